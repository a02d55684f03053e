//! Non-blocking message transport.
//!
//! Three shapes share one engine: `ServerMessageRouter` accepts inbound
//! connections, `ClientMessageRouter` initiates outbound ones, and
//! `DualMessageRouter` composes both with independent reactor tasks for the
//! read and write sides. Every payload on the wire is preceded by a 4-byte
//! big-endian length.
//!
//! Each router instance runs a single reactor task that exclusively owns the
//! connection maps; callers talk to it through a command queue, so lazy
//! connects and map mutation never race. Per-connection state is a bounded
//! write queue (capacity `max_write_queue_size`) drained by a dedicated
//! writer task and a reader task that delivers assembled frames to listeners
//! in arrival order. `send_message` blocks when the destination's write
//! queue is full; that is the back-pressure surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::message::{ConnectionId, GalileoMessage, NetworkDestination, RouterEvent};

/// Default bound on a connection's pending-write queue.
pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 100;

/// Largest frame the codec will assemble. Blocks ride inside frames, so this
/// is effectively the block size ceiling.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Graceful shutdown polls write queues with escalating waits.
const SHUTDOWN_INITIAL_WAIT: Duration = Duration::from_secs(1);
const SHUTDOWN_LONGEST_WAIT: Duration = Duration::from_secs(5);

/// Tuning for one router instance.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_write_queue_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
        }
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Registered frame consumers. Delivery happens on the connection reader
/// tasks; listeners must hand work off rather than block.
#[derive(Clone, Default)]
struct Listeners {
    inner: Arc<RwLock<Vec<mpsc::UnboundedSender<RouterEvent>>>>,
}

impl Listeners {
    fn add(&self, tx: mpsc::UnboundedSender<RouterEvent>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
    }

    fn deliver(&self, event: RouterEvent) {
        let mut listeners = self.inner.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

enum Command {
    /// Resolve the write-queue handle for a destination, connecting lazily.
    Outbound {
        destination: NetworkDestination,
        reply: oneshot::Sender<mpsc::Sender<Bytes>>,
    },
    /// Write-queue handle for an existing connection, if the router owns it.
    ConnectionSender {
        connection: ConnectionId,
        reply: oneshot::Sender<Option<mpsc::Sender<Bytes>>>,
    },
    /// Pending-write depth of every live queue.
    PendingWrites {
        reply: oneshot::Sender<Vec<usize>>,
    },
    /// A server-side connection was accepted.
    Accepted {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    /// An outbound connect finished; hand the socket and queue to I/O tasks.
    Established {
        connection: ConnectionId,
        stream: TcpStream,
        write_rx: mpsc::Receiver<Bytes>,
    },
    /// A connection's I/O failed or its peer went away.
    Closed {
        connection: ConnectionId,
    },
    Shutdown {
        force: bool,
        done: oneshot::Sender<()>,
    },
}

struct Connection {
    destination: Option<NetworkDestination>,
    write_tx: mpsc::Sender<Bytes>,
    connector: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Reactor state. Touched only by the reactor task.
struct Reactor {
    config: RouterConfig,
    listeners: Listeners,
    cmd_tx: mpsc::UnboundedSender<Command>,
    connections: HashMap<ConnectionId, Connection>,
    by_destination: HashMap<NetworkDestination, ConnectionId>,
}

impl Reactor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Outbound { destination, reply } => {
                    let _ = reply.send(self.outbound_queue(&destination));
                }
                Command::ConnectionSender { connection, reply } => {
                    let sender = self
                        .connections
                        .get(&connection)
                        .map(|conn| conn.write_tx.clone());
                    let _ = reply.send(sender);
                }
                Command::PendingWrites { reply } => {
                    let depths = self
                        .connections
                        .values()
                        .map(|conn| {
                            conn.write_tx.max_capacity() - conn.write_tx.capacity()
                        })
                        .collect();
                    let _ = reply.send(depths);
                }
                Command::Accepted { stream, peer_addr } => {
                    self.register_accepted(stream, peer_addr);
                }
                Command::Established {
                    connection,
                    stream,
                    write_rx,
                } => {
                    self.spawn_io(connection, stream, write_rx);
                }
                Command::Closed { connection } => {
                    self.teardown(connection);
                }
                Command::Shutdown { force, done } => {
                    self.shutdown(force).await;
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    /// Write-queue handle for a destination. At most one connection exists
    /// per destination; a new one is dialed lazily when none is live.
    fn outbound_queue(&mut self, destination: &NetworkDestination) -> mpsc::Sender<Bytes> {
        if let Some(id) = self.by_destination.get(destination) {
            if let Some(conn) = self.connections.get(id) {
                return conn.write_tx.clone();
            }
        }

        let id = ConnectionId::next();
        let (write_tx, write_rx) = mpsc::channel(self.config.max_write_queue_size);
        let cmd_tx = self.cmd_tx.clone();
        let dial = destination.clone();
        let connector = tokio::spawn(async move {
            match TcpStream::connect(dial.addr()).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let _ = cmd_tx.send(Command::Established {
                        connection: id,
                        stream,
                        write_rx,
                    });
                }
                Err(err) => {
                    tracing::warn!(destination = %dial, error = %err, "connect failed");
                    // Dropping write_rx fails queued sends; teardown notifies
                    // listeners of the disconnect.
                    let _ = cmd_tx.send(Command::Closed { connection: id });
                }
            }
        });

        self.connections.insert(
            id,
            Connection {
                destination: Some(destination.clone()),
                write_tx: write_tx.clone(),
                connector: Some(connector),
                reader: None,
                writer: None,
            },
        );
        self.by_destination.insert(destination.clone(), id);
        tracing::debug!(connection = %id, destination = %destination, "dialing");
        write_tx
    }

    fn register_accepted(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = ConnectionId::next();
        let (write_tx, write_rx) = mpsc::channel(self.config.max_write_queue_size);
        self.connections.insert(
            id,
            Connection {
                destination: None,
                write_tx,
                connector: None,
                reader: None,
                writer: None,
            },
        );
        tracing::debug!(connection = %id, peer = %peer_addr, "accepted connection");
        self.spawn_io(id, stream, write_rx);
    }

    /// Start the independent reader and writer tasks for a live socket.
    fn spawn_io(
        &mut self,
        id: ConnectionId,
        stream: TcpStream,
        mut write_rx: mpsc::Receiver<Bytes>,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            // Torn down while the connect was in flight.
            return;
        };
        conn.connector = None;

        let (read_half, write_half) = stream.into_split();
        let destination = conn.destination.clone();

        let listeners = self.listeners.clone();
        let cmd_tx = self.cmd_tx.clone();
        let reader = tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, frame_codec());
            while let Some(next) = framed.next().await {
                match next {
                    Ok(frame) => {
                        listeners.deliver(RouterEvent::Message(GalileoMessage {
                            payload: frame.freeze(),
                            origin: id,
                            peer: destination.clone(),
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(connection = %id, error = %err, "read failed");
                        break;
                    }
                }
            }
            let _ = cmd_tx.send(Command::Closed { connection: id });
        });

        let cmd_tx = self.cmd_tx.clone();
        let writer = tokio::spawn(async move {
            let mut framed = FramedWrite::new(write_half, frame_codec());
            while let Some(frame) = write_rx.recv().await {
                if let Err(err) = framed.send(frame).await {
                    tracing::warn!(connection = %id, error = %err, "write failed");
                    let _ = cmd_tx.send(Command::Closed { connection: id });
                    return;
                }
            }
            // Queue closed and drained: flush and close the socket.
            let _ = framed.close().await;
        });

        conn.reader = Some(reader);
        conn.writer = Some(writer);
    }

    /// Remove a dead connection and notify listeners. The next send to the
    /// same destination re-establishes the connection lazily.
    fn teardown(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        if let Some(destination) = &conn.destination {
            self.by_destination.remove(destination);
        }
        for task in [&conn.connector, &conn.reader, &conn.writer]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        tracing::debug!(connection = %id, destination = ?conn.destination, "disconnected");
        self.listeners.deliver(RouterEvent::Disconnected {
            connection: id,
            destination: conn.destination.clone(),
        });
    }

    async fn shutdown(&mut self, force: bool) {
        let mut writers = Vec::new();
        for (_, conn) in self.connections.drain() {
            if force {
                for task in [&conn.connector, &conn.reader, &conn.writer]
                    .into_iter()
                    .flatten()
                {
                    // Aborting the writer drops the queue receiver, which
                    // unblocks any sender stuck on a full queue.
                    task.abort();
                }
            } else {
                if let Some(task) = &conn.connector {
                    task.abort();
                }
                if let Some(task) = &conn.reader {
                    task.abort();
                }
                // Dropping the last queue sender lets the writer drain the
                // remaining frames, flush, and exit.
                drop(conn.write_tx);
                if let Some(task) = conn.writer {
                    writers.push(task);
                }
            }
        }
        self.by_destination.clear();

        for writer in writers {
            let _ = tokio::time::timeout(SHUTDOWN_LONGEST_WAIT, writer).await;
        }
    }
}

/// Cloneable interface to a router instance's reactor task.
#[derive(Clone)]
pub struct RouterHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    listeners: Listeners,
}

impl RouterHandle {
    fn spawn(config: RouterConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let listeners = Listeners::default();
        let reactor = Reactor {
            config,
            listeners: listeners.clone(),
            cmd_tx: cmd_tx.clone(),
            connections: HashMap::new(),
            by_destination: HashMap::new(),
        };
        tokio::spawn(reactor.run(cmd_rx));
        Self { cmd_tx, listeners }
    }

    /// Register a frame consumer. Events arrive in per-connection order.
    pub fn add_listener(&self, tx: mpsc::UnboundedSender<RouterEvent>) {
        self.listeners.add(tx);
    }

    /// Convenience listener registration returning the receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RouterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_listener(tx);
        rx
    }

    /// Queue a frame for a destination, connecting lazily. Blocks while the
    /// destination's write queue is full.
    pub async fn send_message(
        &self,
        destination: &NetworkDestination,
        frame: Bytes,
    ) -> anyhow::Result<()> {
        let queue = self.outbound_queue(destination).await?;
        queue.send(frame).await.map_err(|_| {
            anyhow::anyhow!("connection to {destination} closed before the message was written")
        })
    }

    /// Non-blocking variant: returns `false` when the write queue is full.
    pub async fn try_send_message(
        &self,
        destination: &NetworkDestination,
        frame: Bytes,
    ) -> anyhow::Result<bool> {
        let queue = self.outbound_queue(destination).await?;
        match queue.try_send(frame) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow::anyhow!(
                "connection to {destination} closed before the message was written"
            )),
        }
    }

    /// Send one frame to every destination. A failed destination is logged
    /// and skipped; the rest still get the frame.
    pub async fn broadcast(
        &self,
        destinations: &[NetworkDestination],
        frame: Bytes,
    ) -> anyhow::Result<()> {
        for destination in destinations {
            if let Err(err) = self.send_message(destination, frame.clone()).await {
                tracing::warn!(
                    destination = %destination,
                    error = ?err,
                    "broadcast send failed"
                );
            }
        }
        Ok(())
    }

    /// Send a frame over an existing connection. Returns `false` when this
    /// router does not own the connection.
    pub async fn send_to_connection(
        &self,
        connection: ConnectionId,
        frame: Bytes,
    ) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ConnectionSender { connection, reply })
            .map_err(|_| anyhow::anyhow!("message router is offline"))?;
        let Some(queue) = rx.await.context("message router is offline")? else {
            return Ok(false);
        };
        queue
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("{connection} closed before the message was written"))?;
        Ok(true)
    }

    /// Total frames pending across all write queues.
    pub async fn pending_writes(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::PendingWrites { reply })
            .is_err()
        {
            return 0;
        }
        rx.await.map(|d| d.iter().sum()).unwrap_or(0)
    }

    /// Drain write queues, then stop the reactor. Polls queue occupancy with
    /// escalating waits: 1 s at first, growing by 1 s up to 5 s whenever a
    /// poll sees no progress.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let mut wait = SHUTDOWN_INITIAL_WAIT;
        let mut last_total = usize::MAX;
        loop {
            let total = self.pending_writes().await;
            if total == 0 {
                break;
            }
            tracing::info!(pending = total, "waiting to shut down");
            tokio::time::sleep(wait).await;
            if total >= last_total && wait < SHUTDOWN_LONGEST_WAIT {
                wait += SHUTDOWN_INITIAL_WAIT;
            }
            last_total = total;
        }
        self.stop(false).await
    }

    /// Stop immediately, discarding queued writes and unblocking senders.
    pub async fn force_shutdown(&self) -> anyhow::Result<()> {
        self.stop(true).await
    }

    async fn stop(&self, force: bool) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown { force, done })
            .is_err()
        {
            // Already stopped.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn outbound_queue(
        &self,
        destination: &NetworkDestination,
    ) -> anyhow::Result<mpsc::Sender<Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Outbound {
                destination: destination.clone(),
                reply,
            })
            .map_err(|_| anyhow::anyhow!("message router is offline"))?;
        rx.await.context("message router is offline")
    }
}

/// Accepts inbound connections and routes their frames to listeners.
pub struct ServerMessageRouter {
    handle: RouterHandle,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerMessageRouter {
    /// Bind the listen socket without accepting yet, so startup can fail
    /// fast on an unavailable port before other components initialize.
    pub async fn bind(addr: impl ToSocketAddrs, config: RouterConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("bind listen port")?;
        let local_addr = listener.local_addr().context("resolve listen address")?;
        Ok(Self {
            handle: RouterHandle::spawn(config),
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
        })
    }

    /// Start accepting connections.
    pub fn listen(&self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("router is already listening")?;
        let cmd_tx = self.handle.cmd_tx.clone();
        let local_addr = self.local_addr;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let _ = stream.set_nodelay(true);
                        if cmd_tx.send(Command::Accepted { stream, peer_addr }).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(listen = %local_addr, error = %err, "accept failed");
                    }
                }
            }
        });
        self.accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        tracing::info!(listen = %self.local_addr, "listening for connections");
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> &RouterHandle {
        &self.handle
    }

    pub fn add_listener(&self, tx: mpsc::UnboundedSender<RouterEvent>) {
        self.handle.add_listener(tx);
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.stop_accepting();
        self.handle.shutdown().await
    }

    pub async fn force_shutdown(&self) -> anyhow::Result<()> {
        self.stop_accepting();
        self.handle.force_shutdown().await
    }

    fn stop_accepting(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

/// Initiates outbound connections, one per destination, established lazily
/// on first send.
pub struct ClientMessageRouter {
    handle: RouterHandle,
}

impl ClientMessageRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            handle: RouterHandle::spawn(config),
        }
    }

    pub fn handle(&self) -> &RouterHandle {
        &self.handle
    }

    pub fn add_listener(&self, tx: mpsc::UnboundedSender<RouterEvent>) {
        self.handle.add_listener(tx);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RouterEvent> {
        self.handle.subscribe()
    }

    pub async fn send_message(
        &self,
        destination: &NetworkDestination,
        frame: Bytes,
    ) -> anyhow::Result<()> {
        self.handle.send_message(destination, frame).await
    }

    pub async fn broadcast(
        &self,
        destinations: &[NetworkDestination],
        frame: Bytes,
    ) -> anyhow::Result<()> {
        self.handle.broadcast(destinations, frame).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.handle.shutdown().await
    }

    pub async fn force_shutdown(&self) -> anyhow::Result<()> {
        self.handle.force_shutdown().await
    }
}

/// A server and a client router side by side: inbound and outbound traffic
/// are processed by separate reactor tasks with separate connection tables.
pub struct DualMessageRouter {
    server: ServerMessageRouter,
    client: ClientMessageRouter,
}

impl DualMessageRouter {
    pub async fn bind(addr: impl ToSocketAddrs, config: RouterConfig) -> anyhow::Result<Self> {
        Ok(Self {
            server: ServerMessageRouter::bind(addr, config.clone()).await?,
            client: ClientMessageRouter::new(config),
        })
    }

    pub fn listen(&self) -> anyhow::Result<()> {
        self.server.listen()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server_handle(&self) -> &RouterHandle {
        self.server.handle()
    }

    pub fn client_handle(&self) -> &RouterHandle {
        self.client.handle()
    }

    /// Register one listener on both sides.
    pub fn add_listener(&self, tx: mpsc::UnboundedSender<RouterEvent>) {
        self.server.add_listener(tx.clone());
        self.client.add_listener(tx);
    }

    pub async fn send_message(
        &self,
        destination: &NetworkDestination,
        frame: Bytes,
    ) -> anyhow::Result<()> {
        self.client.send_message(destination, frame).await
    }

    pub async fn broadcast(
        &self,
        destinations: &[NetworkDestination],
        frame: Bytes,
    ) -> anyhow::Result<()> {
        self.client.broadcast(destinations, frame).await
    }

    /// Reply over whichever side owns the connection a message arrived on.
    pub async fn publish_response(
        &self,
        connection: ConnectionId,
        frame: Bytes,
    ) -> anyhow::Result<()> {
        if self
            .server
            .handle()
            .send_to_connection(connection, frame.clone())
            .await?
        {
            return Ok(());
        }
        if self
            .client
            .handle()
            .send_to_connection(connection, frame)
            .await?
        {
            return Ok(());
        }
        anyhow::bail!("no live connection {connection} for response")
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.server.shutdown().await?;
        self.client.shutdown().await
    }

    pub async fn force_shutdown(&self) -> anyhow::Result<()> {
        self.server.force_shutdown().await?;
        self.client.force_shutdown().await
    }
}
