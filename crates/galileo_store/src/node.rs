//! The storage node: wiring and the protocol event handlers.
//!
//! A node runs a dual message router (inbound listener plus outbound
//! client), a concurrent event reactor over the combined frame stream, the
//! file-system layer, and the query tracker table that stitches fan-out
//! responses back to the originating client.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SystemConfig;
use crate::events::{
    Event, Query, QueryPreamble, QueryRequest, QueryResponse, StorageEvent, StorageRequest,
};
use crate::fs::FileSystem;
use crate::message::{ConnectionId, GalileoMessage, NetworkDestination};
use crate::network::NetworkInfo;
use crate::partition::{GroupHashPartitioner, Partitioner};
use crate::query_tracker::QueryTrackerTable;
use crate::reactor::{ConcurrentEventReactor, EventHandlers};
use crate::router::{DualMessageRouter, RouterConfig};

/// Options for running a node, from the CLI or an embedding process.
#[derive(Debug, Clone, Parser)]
pub struct NodeArgs {
    /// TCP listen port, stable across the cluster.
    #[arg(long, env = "GALILEO_PORT", default_value_t = crate::config::DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, env = "GALILEO_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Event reactor worker pool size.
    #[arg(long, env = "GALILEO_POOL_SIZE", default_value_t = 4)]
    pub pool_size: usize,

    /// Per-connection pending-write queue bound.
    #[arg(
        long,
        env = "GALILEO_WRITE_QUEUE",
        default_value_t = crate::router::DEFAULT_WRITE_QUEUE_SIZE
    )]
    pub max_write_queue: usize,

    /// Per-query deadline in milliseconds.
    #[arg(long, env = "GALILEO_QUERY_TIMEOUT_MS", default_value_t = 30_000)]
    pub query_timeout_ms: u64,

    /// Installation root; the config and storage directories derive from it
    /// unless set explicitly.
    #[arg(long, env = "GALILEO_HOME")]
    pub install_root: Option<PathBuf>,

    /// Directory holding the network description.
    #[arg(long, env = "GALILEO_CONF")]
    pub config_dir: Option<PathBuf>,

    /// Root directory for stored blocks.
    #[arg(long, env = "GALILEO_ROOT")]
    pub storage_root: Option<PathBuf>,
}

impl NodeArgs {
    fn system_config(&self) -> SystemConfig {
        let mut system = match &self.install_root {
            Some(root) => SystemConfig::rooted(root.clone()),
            None => SystemConfig::from_env(),
        };
        if let Some(dir) = &self.config_dir {
            system.config_dir = dir.clone();
        }
        if let Some(root) = &self.storage_root {
            system.storage_root = root.clone();
        }
        system
    }
}

/// Single-line JSON status file, rewritten at each startup phase so wrapper
/// scripts can follow the node's progress.
struct StatusLine {
    path: PathBuf,
    port: u16,
}

#[derive(Serialize)]
struct StatusSnapshot<'a> {
    status: &'a str,
    port: u16,
}

impl StatusLine {
    fn new(path: PathBuf, port: u16) -> Self {
        Self { path, port }
    }

    fn set(&self, status: &str) {
        let snapshot = StatusSnapshot {
            status,
            port: self.port,
        };
        let line = match serde_json::to_string(&snapshot) {
            Ok(line) => line,
            Err(_) => return,
        };
        // The status line is best-effort; a failed write never stops the node.
        if let Err(err) = std::fs::write(&self.path, line + "\n") {
            tracing::debug!(path = %self.path.display(), error = %err, "status line write failed");
        }
    }
}

/// Primary coordination component: services client requests and traffic from
/// other storage nodes in the overlay.
pub struct StorageNode {
    session_id: String,
    router: DualMessageRouter,
    fs: FileSystem,
    partitioner: Box<dyn Partitioner>,
    trackers: QueryTrackerTable,
}

impl StorageNode {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn outstanding_queries(&self) -> usize {
        self.trackers.len()
    }
}

/// Run a node until the shutdown future resolves. Startup fails fast: the
/// listen port is bound before anything else initializes, and a bad network
/// description or storage root aborts before the node goes online.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let system = args.system_config();
    let status = StatusLine::new(system.status_file(), args.port);

    status.set("attempting to bind");
    let router_config = RouterConfig {
        max_write_queue_size: args.max_write_queue,
    };
    let router = DualMessageRouter::bind((args.bind.as_str(), args.port), router_config)
        .await
        .with_context(|| format!("could not bind to port {}", args.port))?;

    status.set("reading network configuration");
    let network = NetworkInfo::load(system.network_file())?;

    status.set("initializing file system");
    let fs = FileSystem::open(&system.storage_root)?;
    let recovered = fs
        .recover_metadata()
        .context("file system recovery failed")?;

    status.set("initializing communications");
    // The session id seeds query ids; deriving it from this node's overlay
    // entry keeps ids unique across the cluster without coordination.
    let hostname = network
        .node_on_port(args.port)
        .map(|n| n.hostname.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let session_id = format!("{hostname}-{}", args.port);
    let trackers = QueryTrackerTable::new(
        session_id.clone(),
        Duration::from_millis(args.query_timeout_ms),
    );
    let partitioner = Box::new(GroupHashPartitioner::new(network.clone()));

    let node = Arc::new(StorageNode {
        session_id: session_id.clone(),
        router,
        fs,
        partitioner,
        trackers,
    });

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    node.router.add_listener(event_tx);
    let reactor = ConcurrentEventReactor::new(node.clone(), event_rx, args.pool_size);
    reactor.start();

    let sweeper = tokio::spawn(sweep_expired_queries(node.clone()));

    node.router.listen()?;
    status.set("online");
    tracing::info!(
        port = args.port,
        session_id = %session_id,
        blocks = recovered,
        nodes = network.len(),
        "storage node online"
    );

    shutdown.await;

    tracing::info!("initiating shutdown");
    status.set("shutting down");
    sweeper.abort();
    reactor.stop().await;
    if let Err(err) = node.router.shutdown().await {
        tracing::warn!(error = ?err, "router shutdown failed");
    }
    node.fs.shutdown();
    status.set("offline");
    Ok(())
}

/// Close trackers whose deadline has passed. Expiry is logged; the client
/// sees no error and any later responses are dropped at WARN.
async fn sweep_expired_queries(node: Arc<StorageNode>) {
    let period = node
        .trackers
        .timeout()
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(50));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        for query_id in node.trackers.expire(Instant::now()) {
            if let Some(tracker) = node.trackers.close(&query_id) {
                tracing::warn!(
                    query_id = %query_id,
                    responded = tracker.responded.len(),
                    expected = tracker.expected.len(),
                    "query deadline expired"
                );
            }
        }
    }
}

#[async_trait]
impl EventHandlers for StorageNode {
    /// A client wants a block stored somewhere: ask the partitioner where it
    /// belongs and forward it there. The originator gets no response.
    async fn handle_storage_request(
        &self,
        event: StorageRequest,
        _message: &GalileoMessage,
    ) -> anyhow::Result<()> {
        let target = match self.partitioner.locate(&event.block.metadata) {
            Ok(target) => target,
            Err(err) => {
                tracing::error!(
                    block = %event.block.metadata.name,
                    error = %err,
                    "partitioner failed, dropping storage request"
                );
                return Ok(());
            }
        };

        tracing::info!(
            block = %event.block.metadata.name,
            destination = %target,
            "forwarding block to its partition"
        );
        let frame = Event::Storage(StorageEvent { block: event.block }).to_frame();
        self.router.send_message(&target.destination(), frame).await
    }

    /// Persist a block on this node. Failures are logged; the protocol has
    /// no storage ack, so the client verifies via query.
    async fn handle_storage(
        &self,
        event: StorageEvent,
        _message: &GalileoMessage,
    ) -> anyhow::Result<()> {
        match self.fs.store_block(&event.block) {
            Ok(path) => {
                tracing::info!(path = %path.display(), "stored block");
            }
            Err(err) => {
                tracing::warn!(
                    block = %event.block.metadata.name,
                    error = ?err,
                    "failed to store block"
                );
            }
        }
        Ok(())
    }

    /// Fan a client query out across the overlay. The preamble is sent to
    /// the client before any subquery is forwarded, so no response can
    /// outrun it on the client's connection.
    async fn handle_query_request(
        &self,
        event: QueryRequest,
        message: &GalileoMessage,
    ) -> anyhow::Result<()> {
        let targets = self.partitioner.query_targets(&event.query);
        let query_id = self
            .trackers
            .open(message.origin, targets.iter().map(|n| n.destination()));
        tracing::info!(
            query_id = %query_id,
            query = %event.query,
            targets = targets.len(),
            "query request"
        );

        let preamble = Event::QueryPreamble(QueryPreamble {
            query_id: query_id.clone(),
            query: event.query.clone(),
            nodes: targets.clone(),
        })
        .to_frame();
        self.router.publish_response(message.origin, preamble).await?;

        let subquery = Event::Query(Query {
            query_id: query_id.clone(),
            query: event.query,
        })
        .to_frame();
        // Every peer in the promised set gets its subquery; a peer that
        // cannot be reached just never answers, and the deadline sweep
        // completes the query without it.
        for target in &targets {
            if let Err(err) = self
                .router
                .send_message(&target.destination(), subquery.clone())
                .await
            {
                tracing::warn!(
                    query_id = %query_id,
                    destination = %target,
                    error = ?err,
                    "could not forward subquery to peer"
                );
            }
        }
        Ok(())
    }

    /// Evaluate a subquery from another storage node and reply over the
    /// connection it arrived on.
    async fn handle_query(
        &self,
        event: Query,
        message: &GalileoMessage,
    ) -> anyhow::Result<()> {
        let results = self.fs.query(&event.query)?;
        tracing::info!(
            query_id = %event.query_id,
            results = results.len(),
            "evaluated subquery"
        );
        let frame = Event::QueryResponse(QueryResponse {
            query_id: event.query_id,
            results,
        })
        .to_frame();
        self.router.publish_response(message.origin, frame).await
    }

    /// Record a peer's response and forward the frame as-is to the
    /// originating client. Unknown ids are expected after a deadline sweep
    /// and are dropped at WARN.
    async fn handle_query_response(
        &self,
        event: QueryResponse,
        message: &GalileoMessage,
    ) -> anyhow::Result<()> {
        let peer = message
            .peer
            .clone()
            .unwrap_or_else(|| NetworkDestination::new("unknown", 0));
        let Some(outcome) =
            self.trackers
                .record(&event.query_id, &peer, message.payload.clone())
        else {
            tracing::warn!(query_id = %event.query_id, "unknown query response received");
            return Ok(());
        };

        if let Err(err) = self
            .router
            .publish_response(outcome.origin, message.payload.clone())
            .await
        {
            tracing::warn!(
                query_id = %event.query_id,
                error = ?err,
                "could not forward response to originating client"
            );
        }

        if outcome.done {
            self.trackers.close(&event.query_id);
            tracing::debug!(query_id = %event.query_id, "query complete");
        }
        Ok(())
    }

    async fn handle_disconnect(
        &self,
        connection: ConnectionId,
        destination: Option<NetworkDestination>,
    ) {
        tracing::debug!(connection = %connection, destination = ?destination, "peer disconnected");
    }
}
