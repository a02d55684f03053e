//! Transport-facing message types shared by the routers and the reactor.

use std::fmt;

use bytes::Bytes;

/// A `(hostname, port)` pair identifying a remote endpoint. Equality is by
/// value; the client router deduplicates connections on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkDestination {
    hostname: String,
    port: u16,
}

impl NetworkDestination {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address string suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for NetworkDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl std::str::FromStr for NetworkDestination {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected host:port, got {s:?}"))?;
        if host.is_empty() {
            anyhow::bail!("empty hostname in {s:?}");
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port in {s:?}"))?;
        Ok(Self::new(host, port))
    }
}

/// Opaque transport-level identity of a live connection. Unique across all
/// router instances in the process, so a reply can be routed through
/// whichever router owns the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A fully assembled frame plus the identity of the connection it arrived on,
/// which is enough to reply without a destination lookup.
#[derive(Debug, Clone)]
pub struct GalileoMessage {
    pub payload: Bytes,
    pub origin: ConnectionId,
    /// The dialed peer, when the frame arrived on a client-side connection.
    /// Frames from server-accepted connections carry `None`.
    pub peer: Option<NetworkDestination>,
}

/// What a router delivers to its listeners.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    Message(GalileoMessage),
    Disconnected {
        connection: ConnectionId,
        destination: Option<NetworkDestination>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_equality_is_by_value() {
        let a = NetworkDestination::new("alpha", 5555);
        let b = NetworkDestination::new("alpha".to_string(), 5555);
        let c = NetworkDestination::new("alpha", 5556);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn destination_parses_host_port() {
        let dest: NetworkDestination = "storage-1:5555".parse().unwrap();
        assert_eq!(dest.hostname(), "storage-1");
        assert_eq!(dest.port(), 5555);
        assert!("storage-1".parse::<NetworkDestination>().is_err());
        assert!(":5555".parse::<NetworkDestination>().is_err());
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
