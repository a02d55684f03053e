//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use galileo_store::events::{Event, EventContainer};
use galileo_store::message::{NetworkDestination, RouterEvent};
use galileo_store::router::{ClientMessageRouter, RouterConfig};
use galileo_store::wire::Decode;
use galileo_store::{start_embedded_node, EmbeddedNodeConfig, EmbeddedNodeHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Timeout for protocol round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind port 0");
    listener.local_addr().expect("local addr").port()
}

/// Destination for a node listening on localhost.
pub fn dest(port: u16) -> NetworkDestination {
    NetworkDestination::new("127.0.0.1", port)
}

/// Find the workspace root by walking up until a `crates` directory sits
/// next to a `Cargo.toml`.
pub fn find_workspace_root() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        if dir.join("Cargo.toml").exists() && dir.join("crates").is_dir() {
            return Some(dir);
        }
        let parent = dir.parent()?.to_path_buf();
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

/// Build a per-test scratch directory under the workspace's `.tmp/tests`.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    let root = find_workspace_root().unwrap_or_else(std::env::temp_dir);
    root.join(".tmp")
        .join("tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// One embedded node plus its scratch directory.
pub struct TestNode {
    pub port: u16,
    pub dir: PathBuf,
    pub handle: EmbeddedNodeHandle,
}

impl TestNode {
    pub fn storage_dir(&self) -> PathBuf {
        self.dir.join("storage")
    }

    pub async fn shutdown(self) {
        let _ = self.handle.shutdown().await;
    }
}

/// Start an embedded node whose overlay description lists the given
/// `(group, port)` entries, all on localhost.
pub async fn start_node(
    dir: &Path,
    port: u16,
    overlay: &[(u32, u16)],
    query_timeout: Duration,
) -> TestNode {
    let config_dir = dir.join("config");
    std::fs::create_dir_all(&config_dir).expect("create config dir");
    let mut description = String::new();
    for (group, peer_port) in overlay {
        description.push_str(&format!("{group}@127.0.0.1:{peer_port}\n"));
    }
    std::fs::write(config_dir.join("network"), description).expect("write network description");

    let mut config = EmbeddedNodeConfig::new(port, dir);
    config.query_timeout = query_timeout;
    let handle = start_embedded_node(config).await.expect("start node");

    TestNode {
        port,
        dir: dir.to_path_buf(),
        handle,
    }
}

/// Count `.gblock` files under a directory, recursively.
pub fn gblock_count(dir: &Path) -> usize {
    let mut count = 0;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += gblock_count(&path);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".gblock"))
        {
            count += 1;
        }
    }
    count
}

/// Wait until a directory holds exactly `expected` block files.
pub async fn wait_for_gblocks(dir: &Path, expected: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if gblock_count(dir) == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {expected} blocks under {}, found {}",
            dir.display(),
            gblock_count(dir)
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A protocol client over a real client router.
pub struct TestClient {
    pub router: ClientMessageRouter,
    events: mpsc::UnboundedReceiver<RouterEvent>,
}

impl TestClient {
    pub fn new() -> Self {
        let router = ClientMessageRouter::new(RouterConfig::default());
        let events = router.subscribe();
        Self { router, events }
    }

    pub async fn send(&self, destination: &NetworkDestination, event: &Event) {
        self.router
            .send_message(destination, event.to_frame())
            .await
            .expect("send event");
    }

    /// Next decoded protocol event, skipping disconnect notifications.
    /// Returns `None` when nothing arrives within the timeout.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = tokio::time::timeout(remaining, self.events.recv())
                .await
                .ok()??;
            match event {
                RouterEvent::Message(message) => {
                    let container =
                        EventContainer::from_bytes(message.payload).expect("decode container");
                    return Some(Event::decode(&container).expect("decode event"));
                }
                RouterEvent::Disconnected { .. } => continue,
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.router.force_shutdown().await;
    }
}

/// Read one length-prefixed frame from a raw socket.
pub async fn read_frame(stream: &mut tokio::net::TcpStream) -> std::io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame to a raw socket.
pub async fn write_frame(
    stream: &mut tokio::net::TcpStream,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}
