//! Static overlay topology, read once at startup.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};

use crate::message::NetworkDestination;
use crate::wire::{self, Decode, Encode, WireError};

/// One storage node in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub hostname: String,
    pub port: u16,
    pub group_id: u32,
}

impl NodeInfo {
    pub fn destination(&self) -> NetworkDestination {
        NetworkDestination::new(&self.hostname, self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.group_id, self.hostname, self.port)
    }
}

impl Encode for NodeInfo {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.hostname);
        buf.put_u16(self.port);
        buf.put_u32(self.group_id);
    }
}

impl Decode for NodeInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(NodeInfo {
            hostname: wire::get_str(buf)?,
            port: wire::get_u16(buf)?,
            group_id: wire::get_u32(buf)?,
        })
    }
}

/// Snapshot of the overlay membership. Immutable for the node's lifetime.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    nodes: Vec<NodeInfo>,
}

impl NetworkInfo {
    pub fn from_nodes(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }

    /// Read a network description file: one `group@host:port` entry per line,
    /// blank lines and `#` comments ignored.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read network description {}", path.display()))?;

        let mut nodes = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let node = parse_node(line).with_context(|| {
                format!("invalid node entry at {}:{}", path.display(), lineno + 1)
            })?;
            nodes.push(node);
        }

        if nodes.is_empty() {
            anyhow::bail!("network description {} lists no nodes", path.display());
        }
        Ok(Self { nodes })
    }

    pub fn all_nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The entry listening on the given port, if any. Used to derive this
    /// node's own identity from the shared description.
    pub fn node_on_port(&self, port: u16) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.port == port)
    }
}

/// Parse a `group@host:port` node entry.
fn parse_node(entry: &str) -> anyhow::Result<NodeInfo> {
    let (group, addr) = entry
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("expected group@host:port, got {entry:?}"))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected group@host:port, got {entry:?}"))?;
    let group_id: u32 = group
        .trim()
        .parse()
        .with_context(|| format!("invalid group id in {entry:?}"))?;
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("invalid port in {entry:?}"))?;
    if host.trim().is_empty() {
        anyhow::bail!("empty hostname in {entry:?}");
    }
    Ok(NodeInfo {
        hostname: host.trim().to_string(),
        port,
        group_id,
    })
}
