//! Demultiplexes framed payloads onto typed event handlers.
//!
//! The reactor consumes router events from a FIFO queue, deserializes each
//! payload to its typed event, and dispatches on the closed tag enumeration.
//! `EventReactor` is the single-threaded cooperative variant; the caller owns
//! the loop. `ConcurrentEventReactor` runs a fixed pool of workers over the
//! same queue: take-order stays FIFO, completion order is unspecified, and
//! the handler object must tolerate concurrent invocation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::events::{Event, EventContainer};
use crate::message::{ConnectionId, GalileoMessage, NetworkDestination, RouterEvent};
use crate::wire::Decode;

/// One handler per event type. A handler may fail; the reactor logs the
/// error and keeps going.
#[async_trait]
pub trait EventHandlers: Send + Sync + 'static {
    async fn handle_storage(
        &self,
        event: crate::events::StorageEvent,
        message: &GalileoMessage,
    ) -> anyhow::Result<()>;

    async fn handle_storage_request(
        &self,
        event: crate::events::StorageRequest,
        message: &GalileoMessage,
    ) -> anyhow::Result<()>;

    async fn handle_query(
        &self,
        event: crate::events::Query,
        message: &GalileoMessage,
    ) -> anyhow::Result<()>;

    async fn handle_query_request(
        &self,
        event: crate::events::QueryRequest,
        message: &GalileoMessage,
    ) -> anyhow::Result<()>;

    async fn handle_query_response(
        &self,
        event: crate::events::QueryResponse,
        message: &GalileoMessage,
    ) -> anyhow::Result<()>;

    /// Preambles are addressed to clients; a node receiving one drops it.
    async fn handle_query_preamble(
        &self,
        _event: crate::events::QueryPreamble,
        message: &GalileoMessage,
    ) -> anyhow::Result<()> {
        tracing::warn!(origin = %message.origin, "dropping query preamble addressed to a client");
        Ok(())
    }

    /// A transport connection went away.
    async fn handle_disconnect(
        &self,
        _connection: ConnectionId,
        _destination: Option<NetworkDestination>,
    ) {
    }
}

/// Single-threaded event reactor. `process_next_event` takes one queued
/// payload (blocking on an empty queue), deserializes, and dispatches.
pub struct EventReactor<H: EventHandlers> {
    handlers: Arc<H>,
    queue: Mutex<mpsc::UnboundedReceiver<RouterEvent>>,
}

impl<H: EventHandlers> EventReactor<H> {
    pub fn new(handlers: Arc<H>, queue: mpsc::UnboundedReceiver<RouterEvent>) -> Self {
        Self {
            handlers,
            queue: Mutex::new(queue),
        }
    }

    /// Take and dispatch one event. Returns `false` once the queue closes.
    pub async fn process_next_event(&self) -> bool {
        match self.take_next().await {
            Some(event) => {
                self.handle(event).await;
                true
            }
            None => false,
        }
    }

    /// Take the next event in FIFO order. Workers contend on the queue lock
    /// only while taking, never while handling.
    async fn take_next(&self) -> Option<RouterEvent> {
        self.queue.lock().await.recv().await
    }

    async fn handle(&self, event: RouterEvent) {
        match event {
            RouterEvent::Message(message) => self.dispatch(message).await,
            RouterEvent::Disconnected {
                connection,
                destination,
            } => {
                self.handlers
                    .handle_disconnect(connection, destination)
                    .await;
            }
        }
    }

    async fn dispatch(&self, message: GalileoMessage) {
        let container = match EventContainer::from_bytes(message.payload.clone()) {
            Ok(container) => container,
            Err(err) => {
                tracing::warn!(origin = %message.origin, error = %err, "undecodable payload dropped");
                return;
            }
        };

        let event = match Event::decode(&container) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    origin = %message.origin,
                    tag = container.tag,
                    error = %err,
                    "event dropped"
                );
                return;
            }
        };

        tracing::debug!(kind = ?event.kind(), origin = %message.origin, "processing event");
        let result = match event {
            Event::Storage(e) => self.handlers.handle_storage(e, &message).await,
            Event::StorageRequest(e) => self.handlers.handle_storage_request(e, &message).await,
            Event::Query(e) => self.handlers.handle_query(e, &message).await,
            Event::QueryRequest(e) => self.handlers.handle_query_request(e, &message).await,
            Event::QueryResponse(e) => self.handlers.handle_query_response(e, &message).await,
            Event::QueryPreamble(e) => self.handlers.handle_query_preamble(e, &message).await,
        };
        if let Err(err) = result {
            tracing::warn!(origin = %message.origin, error = ?err, "event handler failed");
        }
    }
}

/// Fixed worker pool over a shared event queue.
pub struct ConcurrentEventReactor<H: EventHandlers> {
    reactor: Arc<EventReactor<H>>,
    pool_size: usize,
    stop_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<H: EventHandlers> ConcurrentEventReactor<H> {
    pub fn new(
        handlers: Arc<H>,
        queue: mpsc::UnboundedReceiver<RouterEvent>,
        pool_size: usize,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            reactor: Arc::new(EventReactor::new(handlers, queue)),
            pool_size: pool_size.max(1),
            stop_tx,
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Idempotent.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return;
        }
        for worker in 0..self.pool_size {
            tracing::debug!(worker, "starting event reactor worker");
            let reactor = self.reactor.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    // Stop is only observed between events, so an in-flight
                    // handler always finishes.
                    let event = tokio::select! {
                        _ = stop_rx.changed() => break,
                        event = reactor.take_next() => event,
                    };
                    match event {
                        Some(event) => reactor.handle(event).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "event reactor worker exited");
            }));
        }
    }

    /// Stop the workers, letting any in-flight handlers finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}
