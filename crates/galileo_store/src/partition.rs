//! Partitioning strategy: which node owns a block, and which nodes a query
//! fans out to.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use crate::dataset::Metadata;
use crate::network::{NetworkInfo, NodeInfo};

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("network description lists no nodes")]
    EmptyNetwork,

    #[error("no partition for block {0:?}")]
    NoPartition(String),
}

/// Maps block metadata to the owning node and supplies the fan-out target
/// set for queries.
pub trait Partitioner: Send + Sync {
    fn locate(&self, metadata: &Metadata) -> Result<NodeInfo, PartitionError>;

    /// Nodes a query should be forwarded to. The query string is available
    /// so a smarter implementation can narrow the set; the default policy is
    /// every node in the overlay.
    fn query_targets(&self, query: &str) -> Vec<NodeInfo>;
}

/// Hashes the block name over the overlay membership.
pub struct GroupHashPartitioner {
    network: NetworkInfo,
}

impl GroupHashPartitioner {
    pub fn new(network: NetworkInfo) -> Self {
        Self { network }
    }
}

impl Partitioner for GroupHashPartitioner {
    fn locate(&self, metadata: &Metadata) -> Result<NodeInfo, PartitionError> {
        let nodes = self.network.all_nodes();
        if nodes.is_empty() {
            return Err(PartitionError::EmptyNetwork);
        }
        let idx = hash_name(&metadata.name) as usize % nodes.len();
        Ok(nodes[idx].clone())
    }

    fn query_targets(&self, _query: &str) -> Vec<NodeInfo> {
        self.network.all_nodes().to_vec()
    }
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(count: u16) -> NetworkInfo {
        NetworkInfo::from_nodes(
            (0..count)
                .map(|i| NodeInfo {
                    hostname: format!("node-{i}"),
                    port: 5555 + i,
                    group_id: 1,
                })
                .collect(),
        )
    }

    #[test]
    fn locate_is_deterministic() {
        let partitioner = GroupHashPartitioner::new(network(4));
        let metadata = Metadata::new("block-7");
        let first = partitioner.locate(&metadata).unwrap();
        for _ in 0..10 {
            assert_eq!(partitioner.locate(&metadata).unwrap(), first);
        }
    }

    #[test]
    fn locate_fails_on_empty_network() {
        let partitioner = GroupHashPartitioner::new(NetworkInfo::default());
        assert!(matches!(
            partitioner.locate(&Metadata::new("x")),
            Err(PartitionError::EmptyNetwork)
        ));
    }

    #[test]
    fn query_targets_default_to_all_nodes() {
        let partitioner = GroupHashPartitioner::new(network(3));
        assert_eq!(partitioner.query_targets("temperature<300").len(), 3);
    }
}
