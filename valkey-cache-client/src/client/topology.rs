//! Server layouts a client routes over.

use crate::backend::Backend;
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use rand::Rng;
use std::sync::Arc;

/// Whether an operation reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Maps keys to the backend that serves them.
pub trait Topology: Send + Sync + 'static {
    /// Keys live on different servers depending on their hash.
    const SHARDED: bool;

    /// Number of independent keyspaces.
    fn shard_count(&self) -> usize;

    /// Keyspace holding `key`.
    fn shard_for(&self, key: &CacheKey) -> usize;

    /// Backend serving `shard` for this kind of access.
    fn backend(&self, shard: usize, access: Access) -> Arc<dyn Backend>;

    /// Every distinct backend, for teardown.
    fn backends(&self) -> Vec<Arc<dyn Backend>>;

    /// Backend for `key`.
    fn route(&self, key: &CacheKey, access: Access) -> Arc<dyn Backend> {
        self.backend(self.shard_for(key), access)
    }
}

/// One primary followed by optional read replicas. Writes go to the
/// primary; reads go to a random replica when there is one.
pub struct Replicated {
    nodes: Vec<Arc<dyn Backend>>,
}

impl Replicated {
    /// `nodes[0]` is the primary.
    pub fn new(nodes: Vec<Arc<dyn Backend>>) -> CacheResult<Self> {
        if nodes.is_empty() {
            return Err(CacheError::Config("at least one server is required".into()));
        }
        Ok(Self { nodes })
    }

    /// The primary.
    pub fn primary(&self) -> &Arc<dyn Backend> {
        &self.nodes[0]
    }

    /// Number of read replicas.
    pub fn replica_count(&self) -> usize {
        self.nodes.len() - 1
    }
}

impl Topology for Replicated {
    const SHARDED: bool = false;

    fn shard_count(&self) -> usize {
        1
    }

    fn shard_for(&self, _key: &CacheKey) -> usize {
        0
    }

    fn backend(&self, _shard: usize, access: Access) -> Arc<dyn Backend> {
        match access {
            Access::Read if self.nodes.len() > 1 => {
                let index = rand::rng().random_range(1..self.nodes.len());
                self.nodes[index].clone()
            }
            _ => self.nodes[0].clone(),
        }
    }

    fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.nodes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn nodes(n: usize) -> Vec<Arc<dyn Backend>> {
        (0..n)
            .map(|i| Arc::new(MemoryBackend::named(format!("n{i}"))) as Arc<dyn Backend>)
            .collect()
    }

    #[test]
    fn test_replicated_writes_hit_primary() {
        let topology = Replicated::new(nodes(3)).unwrap();
        for _ in 0..10 {
            let write = topology.backend(0, Access::Write);
            assert_eq!(write.describe(), "memory://n0");
            let read = topology.backend(0, Access::Read);
            assert_ne!(read.describe(), "memory://n0");
        }
        assert_eq!(topology.replica_count(), 2);
    }

    #[test]
    fn test_empty_layouts_rejected() {
        assert!(Replicated::new(Vec::new()).is_err());
    }
}
