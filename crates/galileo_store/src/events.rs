//! Typed events of the node protocol and their wire containers.
//!
//! The tag enumeration is closed and its values are part of the wire format.

use bytes::{BufMut, Bytes, BytesMut};

use crate::dataset::{Block, Metadata};
use crate::network::NodeInfo;
use crate::wire::{self, Decode, Encode, WireError};

/// Stable wire tags for the closed event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    Storage = 1,
    StorageRequest = 2,
    Query = 3,
    QueryRequest = 4,
    QueryResponse = 5,
    QueryPreamble = 6,
}

impl TryFrom<u32> for EventKind {
    type Error = WireError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(EventKind::Storage),
            2 => Ok(EventKind::StorageRequest),
            3 => Ok(EventKind::Query),
            4 => Ok(EventKind::QueryRequest),
            5 => Ok(EventKind::QueryResponse),
            6 => Ok(EventKind::QueryPreamble),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// `(tag, body)` wrapper: the unit of the application protocol. Bodies are
/// opaque to the transport and the reactor queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContainer {
    pub tag: u32,
    pub body: Bytes,
}

impl Encode for EventContainer {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.tag);
        wire::put_blob(buf, &self.body);
    }
}

impl Decode for EventContainer {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(EventContainer {
            tag: wire::get_u32(buf)?,
            body: wire::get_blob(buf)?,
        })
    }
}

/// Client request to store a block somewhere in the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRequest {
    pub block: Block,
}

/// Directive to persist a block on the receiving node.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub block: Block,
}

/// Client request to evaluate a query across the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
}

/// Subquery forwarded to a single node during fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query_id: String,
    pub query: String,
}

/// One node's results for a fanned-out query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub query_id: String,
    pub results: Vec<Metadata>,
}

/// Sent to the originating client before any responses: the assigned query
/// id and the set of nodes the query was forwarded to.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPreamble {
    pub query_id: String,
    pub query: String,
    pub nodes: Vec<NodeInfo>,
}

impl Encode for StorageRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.block.encode(buf);
    }
}

impl Decode for StorageRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(StorageRequest {
            block: Block::decode(buf)?,
        })
    }
}

impl Encode for StorageEvent {
    fn encode(&self, buf: &mut BytesMut) {
        self.block.encode(buf);
    }
}

impl Decode for StorageEvent {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(StorageEvent {
            block: Block::decode(buf)?,
        })
    }
}

impl Encode for QueryRequest {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.query);
    }
}

impl Decode for QueryRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(QueryRequest {
            query: wire::get_str(buf)?,
        })
    }
}

impl Encode for Query {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.query_id);
        wire::put_str(buf, &self.query);
    }
}

impl Decode for Query {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Query {
            query_id: wire::get_str(buf)?,
            query: wire::get_str(buf)?,
        })
    }
}

impl Encode for QueryResponse {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.query_id);
        wire::put_seq(buf, &self.results);
    }
}

impl Decode for QueryResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(QueryResponse {
            query_id: wire::get_str(buf)?,
            results: wire::get_seq(buf)?,
        })
    }
}

impl Encode for QueryPreamble {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.query_id);
        wire::put_str(buf, &self.query);
        wire::put_seq(buf, &self.nodes);
    }
}

impl Decode for QueryPreamble {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(QueryPreamble {
            query_id: wire::get_str(buf)?,
            query: wire::get_str(buf)?,
            nodes: wire::get_seq(buf)?,
        })
    }
}

/// A decoded protocol event. Decoding switches over the closed tag set, which
/// serves as the event map: one deserializer per tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Storage(StorageEvent),
    StorageRequest(StorageRequest),
    Query(Query),
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
    QueryPreamble(QueryPreamble),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Storage(_) => EventKind::Storage,
            Event::StorageRequest(_) => EventKind::StorageRequest,
            Event::Query(_) => EventKind::Query,
            Event::QueryRequest(_) => EventKind::QueryRequest,
            Event::QueryResponse(_) => EventKind::QueryResponse,
            Event::QueryPreamble(_) => EventKind::QueryPreamble,
        }
    }

    /// Decode a container body according to its tag.
    pub fn decode(container: &EventContainer) -> Result<Event, WireError> {
        let kind = EventKind::try_from(container.tag)?;
        let body = container.body.clone();
        Ok(match kind {
            EventKind::Storage => Event::Storage(StorageEvent::from_bytes(body)?),
            EventKind::StorageRequest => Event::StorageRequest(StorageRequest::from_bytes(body)?),
            EventKind::Query => Event::Query(Query::from_bytes(body)?),
            EventKind::QueryRequest => Event::QueryRequest(QueryRequest::from_bytes(body)?),
            EventKind::QueryResponse => Event::QueryResponse(QueryResponse::from_bytes(body)?),
            EventKind::QueryPreamble => Event::QueryPreamble(QueryPreamble::from_bytes(body)?),
        })
    }

    /// Wrap the event in its container, ready for framing.
    pub fn to_container(&self) -> EventContainer {
        let body = match self {
            Event::Storage(e) => e.to_bytes(),
            Event::StorageRequest(e) => e.to_bytes(),
            Event::Query(e) => e.to_bytes(),
            Event::QueryRequest(e) => e.to_bytes(),
            Event::QueryResponse(e) => e.to_bytes(),
            Event::QueryPreamble(e) => e.to_bytes(),
        };
        EventContainer {
            tag: self.kind() as u32,
            body,
        }
    }

    /// Container bytes for this event, as sent on the wire.
    pub fn to_frame(&self) -> Bytes {
        self.to_container().to_bytes()
    }
}
