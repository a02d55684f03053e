//! Correlation of in-flight fan-out queries with their expected responses.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::message::{ConnectionId, NetworkDestination};

/// Default per-query deadline.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// State of one outstanding fan-out query.
#[derive(Debug)]
pub struct QueryTracker {
    /// Connection the originating client used; replies go back over it.
    pub origin: ConnectionId,
    /// Peers the query was forwarded to.
    pub expected: HashSet<NetworkDestination>,
    /// Peers that have responded, in arrival order. A peer may appear more
    /// than once; completion counts distinct peers.
    pub responded: Vec<NetworkDestination>,
    /// Accumulated response bodies, opaque to the table.
    pub responses: Vec<Bytes>,
    pub deadline: Instant,
}

impl QueryTracker {
    /// All expected peers have responded at least once.
    pub fn is_complete(&self) -> bool {
        self.expected
            .iter()
            .all(|peer| self.responded.contains(peer))
    }
}

/// Outcome of recording one peer response.
#[derive(Debug, Clone, Copy)]
pub struct RecordOutcome {
    pub origin: ConnectionId,
    pub done: bool,
}

/// Table of outstanding queries keyed by `sessionId:counter` ids.
///
/// An id is present iff at least one expected peer has not responded and the
/// deadline has not been swept.
pub struct QueryTrackerTable {
    session_id: String,
    counter: AtomicU64,
    timeout: Duration,
    inner: Mutex<HashMap<String, QueryTracker>>,
}

impl QueryTrackerTable {
    pub fn new(session_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            counter: AtomicU64::new(0),
            timeout,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert a tracker for a new query and return its id.
    pub fn open(
        &self,
        origin: ConnectionId,
        expected: impl IntoIterator<Item = NetworkDestination>,
    ) -> String {
        let id = format!(
            "{}:{}",
            self.session_id,
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        let tracker = QueryTracker {
            origin,
            expected: expected.into_iter().collect(),
            responded: Vec::new(),
            responses: Vec::new(),
            deadline: Instant::now() + self.timeout,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(id.clone(), tracker);
        id
    }

    /// Record one peer response. Returns `None` for unknown ids, which the
    /// caller reports as a late response rather than an error.
    pub fn record(
        &self,
        query_id: &str,
        peer: &NetworkDestination,
        response: Bytes,
    ) -> Option<RecordOutcome> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let tracker = inner.get_mut(query_id)?;
        tracker.responded.push(peer.clone());
        tracker.responses.push(response);
        Some(RecordOutcome {
            origin: tracker.origin,
            done: tracker.is_complete(),
        })
    }

    /// Remove and return a tracker, on completion or deadline.
    pub fn close(&self, query_id: &str) -> Option<QueryTracker> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(query_id)
    }

    /// Ids whose deadline has passed.
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .iter()
            .filter(|(_, tracker)| tracker.deadline < now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer(port: u16) -> NetworkDestination {
        NetworkDestination::new("peer", port)
    }

    fn table() -> QueryTrackerTable {
        QueryTrackerTable::new("alpha-5555", DEFAULT_QUERY_TIMEOUT)
    }

    #[test]
    fn ids_are_session_scoped_and_sequential() {
        let table = table();
        let origin = ConnectionId::next();
        assert_eq!(table.open(origin, [peer(1)]), "alpha-5555:0");
        assert_eq!(table.open(origin, [peer(1)]), "alpha-5555:1");
    }

    #[test]
    fn concurrent_opens_never_collide() {
        let table = Arc::new(table());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                let origin = ConnectionId::next();
                (0..100)
                    .map(|_| table.open(origin, [peer(1)]))
                    .collect::<Vec<_>>()
            }));
        }
        let mut ids: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn tracker_completes_when_all_peers_respond() {
        let table = table();
        let origin = ConnectionId::next();
        let id = table.open(origin, [peer(1), peer(2), peer(3)]);

        let body = Bytes::from_static(b"results");
        assert!(!table.record(&id, &peer(3), body.clone()).unwrap().done);
        assert!(!table.record(&id, &peer(1), body.clone()).unwrap().done);
        // A duplicate response does not complete the query.
        assert!(!table.record(&id, &peer(1), body.clone()).unwrap().done);
        let outcome = table.record(&id, &peer(2), body).unwrap();
        assert!(outcome.done);
        assert_eq!(outcome.origin, origin);

        let tracker = table.close(&id).unwrap();
        assert_eq!(tracker.responses.len(), 4);
        assert_eq!(tracker.responded[0], peer(3));
        assert!(table.is_empty());
    }

    #[test]
    fn recording_an_unknown_id_returns_none() {
        let table = table();
        assert!(table
            .record("alpha-5555:99", &peer(1), Bytes::new())
            .is_none());
    }

    #[test]
    fn expire_returns_only_overdue_ids() {
        let table = QueryTrackerTable::new("alpha-5555", Duration::from_millis(10));
        let id = table.open(ConnectionId::next(), [peer(1)]);

        assert!(table.expire(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(table.expire(later), vec![id.clone()]);
        // Expiry only reports; the caller closes.
        assert_eq!(table.len(), 1);
        table.close(&id).unwrap();
        assert!(table.is_empty());
    }
}
