/// Key hashing for shard routing
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Hash function used for modulo routing and ring placement.
///
/// A ring must keep the same function for its whole lifetime; switching it
/// without rebuilding the ring remaps most keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    #[default]
    Crc32,
    Fnv1a,
}

impl HashFunction {
    pub fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashFunction::Crc32 => crc32fast::hash(key),
            HashFunction::Fnv1a => {
                let mut hasher = FnvHasher::default();
                hasher.write(key);
                let h = hasher.finish();
                // fold to the ring's 32-bit space
                (h ^ (h >> 32)) as u32
            }
        }
    }

    pub fn hash_str(&self, key: &str) -> u32 {
        self.hash(key.as_bytes())
    }
}
