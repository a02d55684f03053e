//! On-disk block storage and the synchronous metadata query surface.
//!
//! Blocks live as `.gblock` files under the storage root: a 4-byte big-endian
//! crc32 of the payload followed by the encoded block, metadata first.
//! Recovery scans the root recursively and rebuilds the in-memory metadata
//! index, verifying every checksum on the way.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::dataset::{Block, Metadata};
use crate::wire::{Decode, Encode, WireError};

/// Suffix for block files on disk.
pub const BLOCK_EXTENSION: &str = ".gblock";

/// Recovery progress is logged every this many blocks.
const RECOVERY_LOG_INTERVAL: usize = 10_000;

#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error("storage I/O failed")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch for block {path}")]
    ChecksumMismatch { path: PathBuf },

    #[error("block file {path} is truncated")]
    Truncated { path: PathBuf },

    #[error("file system is read-only")]
    ReadOnly,

    #[error("malformed block encoding")]
    Encoding(#[from] WireError),

    #[error("malformed query {0:?}")]
    MalformedQuery(String),
}

struct IndexEntry {
    metadata: Metadata,
    path: PathBuf,
}

/// The node-local block store.
pub struct FileSystem {
    storage_root: PathBuf,
    read_only: bool,
    index: RwLock<Vec<IndexEntry>>,
}

impl FileSystem {
    /// Open the store rooted at `storage_root`, creating the directory when
    /// missing. Enters read-only mode when the root is not writable.
    pub fn open(storage_root: impl Into<PathBuf>) -> Result<Self, FileSystemError> {
        let storage_root = storage_root.into();
        tracing::info!(root = %storage_root.display(), "initializing file system");

        if !storage_root.exists() {
            tracing::warn!(
                root = %storage_root.display(),
                "storage root does not exist, attempting to create"
            );
            fs::create_dir_all(&storage_root)?;
        }

        // Readability is required; writability only downgrades to read-only.
        fs::read_dir(&storage_root)?;
        let read_only = !probe_writable(&storage_root);
        if read_only {
            tracing::warn!(
                root = %storage_root.display(),
                "storage root is not writable, starting in read-only mode"
            );
        }

        Ok(Self {
            storage_root,
            read_only,
            index: RwLock::new(Vec::new()),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn block_count(&self) -> usize {
        self.index.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Scan the storage root recursively and rebuild the metadata index.
    /// Unreadable or corrupt blocks are skipped with a warning.
    pub fn recover_metadata(&self) -> Result<usize, FileSystemError> {
        let mut paths = Vec::new();
        scan_directory(&self.storage_root, &mut paths)?;
        tracing::info!(blocks = paths.len(), "recovering metadata index");

        let mut recovered = 0usize;
        for path in &paths {
            match self.load_metadata(path) {
                Ok(metadata) => {
                    self.index_block(metadata, path.clone());
                    recovered += 1;
                    if recovered % RECOVERY_LOG_INTERVAL == 0 {
                        tracing::info!(
                            scanned = recovered,
                            total = paths.len(),
                            "recovery in progress"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = ?err,
                        "failed to recover metadata for block"
                    );
                }
            }
        }

        tracing::info!(recovered, "metadata recovery complete");
        Ok(recovered)
    }

    /// Persist a block and index its metadata. Returns the block path.
    pub fn store_block(&self, block: &Block) -> Result<PathBuf, FileSystemError> {
        if self.read_only {
            return Err(FileSystemError::ReadOnly);
        }

        // Unnamed blocks get a deterministic name derived from their payload.
        let name = if block.metadata.name.is_empty() {
            format!("{:08x}", crc32fast::hash(&block.data))
        } else {
            block.metadata.name.clone()
        };
        let path = self
            .storage_root
            .join(format!("{name}{BLOCK_EXTENSION}"));

        let payload = block.to_bytes();
        let mut file_bytes = BytesMut::with_capacity(payload.len() + 4);
        file_bytes.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        file_bytes.extend_from_slice(&payload);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&file_bytes)?;

        self.index_block(block.metadata.clone(), path.clone());
        Ok(path)
    }

    /// Load a full block from its path, verifying the checksum.
    pub fn load_block(&self, path: impl AsRef<Path>) -> Result<Block, FileSystemError> {
        let payload = self.read_verified(path.as_ref())?;
        Ok(Block::from_bytes(payload)?)
    }

    /// Load only a block's metadata. Metadata leads the encoding, so the
    /// payload bytes are never decoded.
    pub fn load_metadata(&self, path: impl AsRef<Path>) -> Result<Metadata, FileSystemError> {
        let mut payload = self.read_verified(path.as_ref())?;
        Ok(Metadata::decode(&mut payload)?)
    }

    /// Evaluate a feature predicate (`name OP number`) against the metadata
    /// index and return the matching metadata.
    pub fn query(&self, expression: &str) -> Result<Vec<Metadata>, FileSystemError> {
        let predicate = Predicate::parse(expression)?;
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        Ok(index
            .iter()
            .filter(|entry| predicate.matches(&entry.metadata))
            .map(|entry| entry.metadata.clone())
            .collect())
    }

    /// Flush and release. There is no write-behind state today; this exists
    /// so shutdown ordering stays explicit at the call site.
    pub fn shutdown(&self) {
        let blocks = self.block_count();
        tracing::info!(blocks, "file system shutdown complete");
    }

    fn read_verified(&self, path: &Path) -> Result<Bytes, FileSystemError> {
        let raw = fs::read(path)?;
        if raw.len() < 4 {
            return Err(FileSystemError::Truncated {
                path: path.to_path_buf(),
            });
        }
        let mut raw = Bytes::from(raw);
        let expected = raw.get_u32();
        if crc32fast::hash(&raw) != expected {
            return Err(FileSystemError::ChecksumMismatch {
                path: path.to_path_buf(),
            });
        }
        Ok(raw)
    }

    fn index_block(&self, metadata: Metadata, path: PathBuf) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        // Re-storing a block replaces its index entry.
        index.retain(|entry| entry.path != path);
        index.push(IndexEntry { metadata, path });
    }
}

/// Try creating and removing a probe file to detect a read-only root.
fn probe_writable(root: &Path) -> bool {
    let probe = root.join(".galileo-write-probe");
    match OpenOptions::new().write(true).create(true).open(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn scan_directory(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), FileSystemError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            scan_directory(&path, out)?;
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(BLOCK_EXTENSION))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// A single feature comparison, the query surface the FS layer evaluates.
#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    feature: String,
    op: Comparison,
    value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Predicate {
    fn parse(expression: &str) -> Result<Self, FileSystemError> {
        // Two-character operators first so `<=` is not read as `<`.
        const OPS: [(&str, Comparison); 6] = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("!=", Comparison::Ne),
            ("==", Comparison::Eq),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ];

        for (symbol, op) in OPS {
            if let Some((feature, value)) = expression.split_once(symbol) {
                let feature = feature.trim();
                let value = value.trim();
                if feature.is_empty() {
                    break;
                }
                let value: f64 = value
                    .parse()
                    .map_err(|_| FileSystemError::MalformedQuery(expression.to_string()))?;
                return Ok(Predicate {
                    feature: feature.to_string(),
                    op,
                    value,
                });
            }
        }
        Err(FileSystemError::MalformedQuery(expression.to_string()))
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.feature(&self.feature) else {
            return false;
        };
        match self.op {
            Comparison::Lt => actual < self.value,
            Comparison::Le => actual <= self.value,
            Comparison::Gt => actual > self.value,
            Comparison::Ge => actual >= self.value,
            Comparison::Eq => actual == self.value,
            Comparison::Ne => actual != self.value,
        }
    }
}
