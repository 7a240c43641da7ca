/// Consistent hash ring with virtual nodes
use super::hash::HashFunction;
use std::collections::HashMap;

/// Maps virtual node hashes to shard ids
#[derive(Debug, Clone)]
pub struct HashRing {
    hash_function: HashFunction,
    virtual_nodes: usize,
    /// Virtual node hash to the shards placed there, ascending. The lowest id
    /// serves a point; the rest take over when it is removed.
    nodes: HashMap<u32, Vec<u32>>,
    /// Sorted virtual node hashes
    sorted: Vec<u32>,
}

impl HashRing {
    pub fn new(hash_function: HashFunction, virtual_nodes: usize) -> Self {
        Self {
            hash_function,
            virtual_nodes,
            nodes: HashMap::new(),
            sorted: Vec::new(),
        }
    }

    fn node_hashes<'a>(&'a self, name: &'a str) -> impl Iterator<Item = u32> + 'a {
        (0..self.virtual_nodes).map(move |i| self.hash_function.hash_str(&format!("{name}-{i}")))
    }

    /// Place `virtual_nodes` entries named `{name}-{i}` for a shard
    pub fn add_node(&mut self, shard_id: u32, name: &str) {
        let hashes: Vec<u32> = self.node_hashes(name).collect();
        for hash in hashes {
            let owners = self.nodes.entry(hash).or_default();
            if owners.is_empty() {
                self.sorted.push(hash);
            }
            let at = owners.partition_point(|id| *id <= shard_id);
            owners.insert(at, shard_id);
        }
        self.sorted.sort_unstable();
    }

    /// Remove the entries placed for a shard
    pub fn remove_node(&mut self, shard_id: u32, name: &str) {
        let hashes: Vec<u32> = self.node_hashes(name).collect();
        for hash in hashes {
            let Some(owners) = self.nodes.get_mut(&hash) else {
                continue;
            };
            if let Some(at) = owners.iter().position(|id| *id == shard_id) {
                owners.remove(at);
            }
            if owners.is_empty() {
                self.nodes.remove(&hash);
            }
        }
        let nodes = &self.nodes;
        self.sorted.retain(|hash| nodes.contains_key(hash));
    }

    /// First node clockwise from the key's hash, wrapping to the start
    pub fn get(&self, key: &str) -> Option<u32> {
        if self.sorted.is_empty() {
            return None;
        }

        let hash = self.hash_function.hash_str(key);
        let index = self.sorted.partition_point(|h| *h < hash);
        let index = if index == self.sorted.len() { 0 } else { index };
        self.nodes
            .get(&self.sorted[index])
            .and_then(|owners| owners.first())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }
}
