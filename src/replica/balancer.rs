/// Replica selection algorithms
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Selection strategy applied to the filtered replica set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    #[default]
    WeightedRoundRobin,
    Random,
    LeastLag,
}

/// A replica eligible for selection
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub lag: Option<Duration>,
}

/// Load balancing algorithm trait
pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Pick one of `candidates`. `weighted_pool` holds candidate names repeated
    /// by their effective weight, in registration order.
    fn select_replica(&self, candidates: &[Candidate], weighted_pool: &[&str]) -> Option<String>;
}

/// Build the algorithm for a strategy
pub fn algorithm_for(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalancingAlgorithm> {
    match strategy {
        LoadBalanceStrategy::RoundRobin => Box::new(RoundRobin::new()),
        LoadBalanceStrategy::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        LoadBalanceStrategy::Random => Box::new(RandomSelection),
        LoadBalanceStrategy::LeastLag => Box::new(LeastLag),
    }
}

/// Round-robin load balancing algorithm
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingAlgorithm for RoundRobin {
    fn select_replica(&self, candidates: &[Candidate], _weighted_pool: &[&str]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].name.clone())
    }
}

/// Weighted round-robin over the expanded weight pool
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingAlgorithm for WeightedRoundRobin {
    fn select_replica(&self, candidates: &[Candidate], weighted_pool: &[&str]) -> Option<String> {
        // Zero effective weight keeps a candidate out of the pool
        if candidates.is_empty() || weighted_pool.is_empty() {
            return None;
        }

        let position = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(weighted_pool[position % weighted_pool.len()].to_string())
    }
}

/// Uniform random selection
pub struct RandomSelection;

impl LoadBalancingAlgorithm for RandomSelection {
    fn select_replica(&self, candidates: &[Candidate], _weighted_pool: &[&str]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[index].name.clone())
    }
}

/// Minimum recorded lag. Replicas without a lag sample rank last; ties keep
/// registration order.
pub struct LeastLag;

impl LoadBalancingAlgorithm for LeastLag {
    fn select_replica(&self, candidates: &[Candidate], _weighted_pool: &[&str]) -> Option<String> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(index, c)| (c.lag.unwrap_or(Duration::MAX), *index))
            .map(|(_, c)| c.name.clone())
    }
}
