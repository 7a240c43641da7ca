/// Shard key routing independent of live connections
use super::hash::HashFunction;
use super::ring::HashRing;
use crate::error::{CompuertaError, CompuertaResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How keys map to shards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// `hash(key) mod shard_count`; remaps most keys when shards change
    HashModulo,
    #[default]
    ConsistentHash,
    /// Lexical `[min, max)` ranges, first match wins
    Range,
    /// Exact key lookup table
    Lookup,
}

/// A lexical key range owned by one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    pub min: String,
    pub max: String,
    pub shard_id: u32,
}

impl ShardRange {
    pub fn contains(&self, key: &str) -> bool {
        key >= self.min.as_str() && key < self.max.as_str()
    }
}

/// Resolves shard keys to shard ids
#[derive(Debug, Clone)]
pub struct ShardRouter {
    strategy: ShardingStrategy,
    hash_function: HashFunction,
    /// Registered shards in insertion order
    shards: Vec<(u32, String)>,
    ring: HashRing,
    ranges: Vec<ShardRange>,
    lookups: HashMap<String, u32>,
}

impl ShardRouter {
    pub fn new(strategy: ShardingStrategy, hash_function: HashFunction, virtual_nodes: usize) -> Self {
        Self {
            strategy,
            hash_function,
            shards: Vec::new(),
            ring: HashRing::new(hash_function, virtual_nodes),
            ranges: Vec::new(),
            lookups: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> ShardingStrategy {
        self.strategy
    }

    pub fn add_shard(&mut self, id: u32, name: &str) -> CompuertaResult<()> {
        if self.shards.iter().any(|(existing, _)| *existing == id) {
            return Err(CompuertaError::duplicate("shard id", id.to_string()));
        }

        self.shards.push((id, name.to_string()));
        if self.strategy == ShardingStrategy::ConsistentHash {
            self.ring.add_node(id, name);
        }
        Ok(())
    }

    /// Forget a shard along with its ring entries, ranges and lookups
    pub fn remove_shard(&mut self, id: u32) -> CompuertaResult<()> {
        let position = self
            .shards
            .iter()
            .position(|(existing, _)| *existing == id)
            .ok_or_else(|| CompuertaError::shard(format!("shard {id} not found")))?;

        let (_, name) = self.shards.remove(position);
        if self.strategy == ShardingStrategy::ConsistentHash {
            self.ring.remove_node(id, &name);
        }
        self.ranges.retain(|r| r.shard_id != id);
        self.lookups.retain(|_, shard| *shard != id);
        Ok(())
    }

    pub fn add_range(&mut self, min: &str, max: &str, shard_id: u32) -> CompuertaResult<()> {
        self.ensure_known(shard_id)?;
        if min >= max {
            return Err(CompuertaError::shard(format!("range [{min}, {max}) is empty")));
        }
        self.ranges.push(ShardRange {
            min: min.to_string(),
            max: max.to_string(),
            shard_id,
        });
        Ok(())
    }

    pub fn add_lookup(&mut self, key: &str, shard_id: u32) -> CompuertaResult<()> {
        self.ensure_known(shard_id)?;
        self.lookups.insert(key.to_string(), shard_id);
        Ok(())
    }

    fn ensure_known(&self, shard_id: u32) -> CompuertaResult<()> {
        if self.shards.iter().any(|(id, _)| *id == shard_id) {
            Ok(())
        } else {
            Err(CompuertaError::shard(format!("shard {shard_id} not found")))
        }
    }

    /// Resolve a key to a shard id
    pub fn route(&self, key: &str) -> CompuertaResult<u32> {
        if self.shards.is_empty() {
            return Err(CompuertaError::shard("no shards available"));
        }

        match self.strategy {
            ShardingStrategy::HashModulo => {
                let index = self.hash_function.hash_str(key) as usize % self.shards.len();
                Ok(self.shards[index].0)
            }
            ShardingStrategy::ConsistentHash => self
                .ring
                .get(key)
                .ok_or_else(|| CompuertaError::shard("hash ring is empty")),
            ShardingStrategy::Range => self
                .ranges
                .iter()
                .find(|r| r.contains(key))
                .map(|r| r.shard_id)
                .ok_or_else(|| CompuertaError::shard(format!("no range found for key {key}"))),
            ShardingStrategy::Lookup => self
                .lookups
                .get(key)
                .copied()
                .ok_or_else(|| CompuertaError::shard(format!("no lookup entry for key {key}"))),
        }
    }

    /// Count how many of `keys` each shard receives. Unroutable keys are skipped.
    pub fn distribution<I, S>(&self, keys: I) -> BTreeMap<u32, usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts: BTreeMap<u32, usize> = self.shards.iter().map(|(id, _)| (*id, 0)).collect();
        for key in keys {
            if let Ok(id) = self.route(key.as_ref()) {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(strategy: ShardingStrategy) -> ShardRouter {
        let mut router = ShardRouter::new(strategy, HashFunction::Crc32, 150);
        for id in 0..3 {
            router.add_shard(id, &format!("shard-{id}")).unwrap();
        }
        router
    }

    #[test]
    fn test_routing_is_deterministic_for_every_strategy() {
        let keys: Vec<String> = (0..100).map(|i| format!("user:{i:03}")).collect();

        for strategy in [ShardingStrategy::HashModulo, ShardingStrategy::ConsistentHash] {
            let router = router(strategy);
            for key in &keys {
                assert_eq!(router.route(key).unwrap(), router.route(key).unwrap());
            }
        }

        let mut ranged = router(ShardingStrategy::Range);
        ranged.add_range("user:000", "user:050", 0).unwrap();
        ranged.add_range("user:050", "user:100", 1).unwrap();
        for key in &keys {
            assert_eq!(ranged.route(key).unwrap(), ranged.route(key).unwrap());
        }

        let mut lookup = router(ShardingStrategy::Lookup);
        for (i, key) in keys.iter().enumerate() {
            lookup.add_lookup(key, (i % 3) as u32).unwrap();
        }
        for key in &keys {
            assert_eq!(lookup.route(key).unwrap(), lookup.route(key).unwrap());
        }
    }

    #[test]
    fn test_range_routing() {
        let mut router = router(ShardingStrategy::Range);
        router.add_range("a", "m", 0).unwrap();
        router.add_range("m", "z", 1).unwrap();

        assert_eq!(router.route("apple").unwrap(), 0);
        assert_eq!(router.route("m").unwrap(), 1);
        assert_eq!(router.route("melon").unwrap(), 1);
        assert!(router.route("zebra").is_err());
        assert!(router.add_range("q", "b", 2).is_err());
        assert!(router.add_range("a", "b", 9).is_err());
    }

    #[test]
    fn test_lookup_routing() {
        let mut router = router(ShardingStrategy::Lookup);
        router.add_lookup("tenant-a", 2).unwrap();
        assert_eq!(router.route("tenant-a").unwrap(), 2);
        assert!(router.route("tenant-b").is_err());
    }

    #[test]
    fn test_no_shards() {
        let router = ShardRouter::new(ShardingStrategy::ConsistentHash, HashFunction::Crc32, 10);
        assert!(router.route("key").is_err());
    }

    #[test]
    fn test_duplicate_shard_id_rejected() {
        let mut router = router(ShardingStrategy::HashModulo);
        assert!(router.add_shard(1, "other").is_err());
    }

    #[test]
    fn test_remove_shard_purges_routes() {
        let mut router = router(ShardingStrategy::ConsistentHash);
        router.remove_shard(2).unwrap();
        assert_eq!(router.shard_ids(), vec![0, 1]);
        for i in 0..200 {
            assert_ne!(router.route(&format!("key-{i}")).unwrap(), 2);
        }
        assert!(router.remove_shard(2).is_err());
    }

    #[test]
    fn test_consistent_hash_distribution() {
        for function in [HashFunction::Crc32, HashFunction::Fnv1a] {
            let mut router = ShardRouter::new(ShardingStrategy::ConsistentHash, function, 150);
            for id in 0..3 {
                router.add_shard(id, &format!("shard-{id}")).unwrap();
            }

            let keys: Vec<String> = (0..1000).map(|i| format!("user:{i}")).collect();
            let counts = router.distribution(&keys);
            assert_eq!(counts.values().sum::<usize>(), 1000);
            for (id, count) in counts {
                assert!(
                    (100..=400).contains(&count),
                    "shard {id} got {count} of 1000 keys with {function:?}"
                );
            }
        }
    }
}
