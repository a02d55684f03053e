//! Galileo storage node runtime: non-blocking message transport, typed event
//! reactor, and fan-out query coordination for a DHT of block storage nodes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub mod config;
pub mod dataset;
pub mod events;
pub mod fs;
pub mod message;
pub mod network;
pub mod node;
pub mod partition;
pub mod query_tracker;
pub mod reactor;
pub mod router;
pub mod wire;

pub use node::{run_node_with_shutdown, NodeArgs};

/// Minimal configuration for running a node inside another process. Tests
/// use this to stand up whole overlays in-process.
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub port: u16,
    /// Directory holding `config/network`, `storage/`, and the status line.
    pub install_root: PathBuf,
    pub pool_size: usize,
    pub max_write_queue: usize,
    pub query_timeout: Duration,
    pub ready_timeout: Duration,
}

impl EmbeddedNodeConfig {
    pub fn new(port: u16, install_root: impl Into<PathBuf>) -> Self {
        Self {
            port,
            install_root: install_root.into(),
            pool_size: 4,
            max_write_queue: router::DEFAULT_WRITE_QUEUE_SIZE,
            query_timeout: query_tracker::DEFAULT_QUERY_TIMEOUT,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to an embedded node; dropping it does not stop the node, shutting
/// down does.
pub struct EmbeddedNodeHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNodeHandle {
    /// Request a graceful shutdown and wait for the node to finish.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("node task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> NodeArgs {
    NodeArgs {
        port: config.port,
        bind: "127.0.0.1".to_string(),
        pool_size: config.pool_size,
        max_write_queue: config.max_write_queue,
        query_timeout_ms: config.query_timeout.as_millis() as u64,
        install_root: Some(config.install_root.clone()),
        config_dir: None,
        storage_root: None,
    }
}

/// Start a node in-process and wait until its listen port answers.
pub async fn start_embedded_node(
    config: EmbeddedNodeConfig,
) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.port);
    let ready_timeout = config.ready_timeout.max(Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(run_node_with_shutdown(args, async move {
        let _ = shutdown_rx.await;
    }));

    wait_for_listener(addr, ready_timeout, &task).await?;

    Ok(EmbeddedNodeHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn wait_for_listener(
    addr: SocketAddr,
    timeout: Duration,
    task: &tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if task.is_finished() {
            anyhow::bail!("embedded node exited before its listener became ready");
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for node listener on {addr}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
