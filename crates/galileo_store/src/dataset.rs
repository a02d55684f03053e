//! Blocks and the feature metadata attached to them.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{self, Decode, Encode, WireError};

/// A named scalar attribute, e.g. `humidity = 32.3`.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub name: String,
    pub value: f64,
}

impl Feature {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Encode for Feature {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.name);
        buf.put_f64(self.value);
    }
}

impl Decode for Feature {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Feature {
            name: wire::get_str(buf)?,
            value: wire::get_f64(buf)?,
        })
    }
}

/// Indexed description of a block: a name plus its feature set.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub features: Vec<Feature>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.push(Feature::new(name, value));
        self
    }

    /// Value of the named feature, if present.
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value)
    }
}

impl Encode for Metadata {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_str(buf, &self.name);
        wire::put_seq(buf, &self.features);
    }
}

impl Decode for Metadata {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Metadata {
            name: wire::get_str(buf)?,
            features: wire::get_seq(buf)?,
        })
    }
}

/// A unit of stored data plus its metadata.
///
/// Metadata leads the encoding so it can be decoded without touching the
/// payload; the on-disk recovery scan depends on this.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub metadata: Metadata,
    pub data: Bytes,
}

impl Block {
    pub fn new(metadata: Metadata, data: impl Into<Bytes>) -> Self {
        Self {
            metadata,
            data: data.into(),
        }
    }
}

impl Encode for Block {
    fn encode(&self, buf: &mut BytesMut) {
        self.metadata.encode(buf);
        wire::put_blob(buf, &self.data);
    }
}

impl Decode for Block {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Block {
            metadata: Metadata::decode(buf)?,
            data: wire::get_blob(buf)?,
        })
    }
}
