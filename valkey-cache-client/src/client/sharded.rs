//! The sharded client: keys spread over independent servers.

use super::default::Client;
use super::topology::{Access, Topology};
use crate::backend::Backend;
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use std::sync::Arc;

/// Client whose keys are partitioned over a [`ShardRing`].
///
/// Multi-key verbs that would span servers atomically (`mget`, `mset`) and
/// connection access without a key are rejected.
pub type ShardClient = Client<ShardRing>;

/// Independent servers, each owning the keys whose hash lands on it.
///
/// A key is routed by the crc32 of its raw form, or of the text inside its
/// first non-empty `{...}` section when it has one, modulo the server count.
/// The same raw key always lands on the same server for a given server list.
pub struct ShardRing {
    nodes: Vec<Arc<dyn Backend>>,
}

impl ShardRing {
    /// Create a ring over `nodes` in configuration order.
    pub fn new(nodes: Vec<Arc<dyn Backend>>) -> CacheResult<Self> {
        if nodes.is_empty() {
            return Err(CacheError::Config("at least one shard is required".into()));
        }
        Ok(Self { nodes })
    }

    /// Shard index for a raw key.
    pub fn shard_of(&self, raw: &str) -> usize {
        crc32fast::hash(hash_tag(raw).as_bytes()) as usize % self.nodes.len()
    }
}

/// The `{tag}` portion of a key, or the whole key.
pub fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{')
        && let Some(len) = key[open + 1..].find('}')
        && len > 0
    {
        return &key[open + 1..open + 1 + len];
    }
    key
}

impl Topology for ShardRing {
    const SHARDED: bool = true;

    fn shard_count(&self) -> usize {
        self.nodes.len()
    }

    fn shard_for(&self, key: &CacheKey) -> usize {
        self.shard_of(key.raw())
    }

    fn backend(&self, shard: usize, _access: Access) -> Arc<dyn Backend> {
        self.nodes[shard].clone()
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
    fn test_hash_tag() {
        assert_eq!(hash_tag("user:{42}:name"), "42");
        assert_eq!(hash_tag("user:{}:name"), "user:{}:name");
        assert_eq!(hash_tag("plain"), "plain");
    }

    #[test]
    fn test_routing_is_stable_and_spread() {
        let ring = ShardRing::new(nodes(3)).unwrap();
        let again = ShardRing::new(nodes(3)).unwrap();
        let mut used = [false; 3];
        for i in 0..100 {
            let key = format!("key{i}");
            assert_eq!(ring.shard_of(&key), again.shard_of(&key));
            used[ring.shard_of(&key)] = true;
        }
        assert!(used.iter().all(|u| *u));
    }

    #[test]
    fn test_hash_tag_colocates() {
        let ring = ShardRing::new(nodes(5)).unwrap();
        assert_eq!(ring.shard_of("{cart}:items"), ring.shard_of("{cart}:total"));
    }

    #[test]
    fn test_empty_ring_rejected() {
        assert!(ShardRing::new(Vec::new()).is_err());
    }
}
