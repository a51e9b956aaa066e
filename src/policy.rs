//! Upstream selection policies.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Policy variant selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Uniform random permutation of the proxy list.
    #[default]
    Random,
    /// Rotating head with the remaining proxies in their original order.
    RoundRobin,
}

/// Orders the proxy list per request.
#[derive(Debug)]
pub enum Policy {
    /// Uniform random permutation; single-element lists pass through and
    /// two-element lists swap with probability one half.
    Random,
    /// Atomic counter selects the head; the rest keep their configured order.
    RoundRobin {
        /// Monotonically incremented pick counter.
        robin: AtomicU32,
    },
}

impl Policy {
    /// Build a policy from its configured kind.
    pub fn new(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Random => Policy::Random,
            PolicyKind::RoundRobin => Policy::RoundRobin {
                robin: AtomicU32::new(0),
            },
        }
    }

    /// Human-readable policy name.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Random => "random",
            Policy::RoundRobin { .. } => "round_robin",
        }
    }

    /// Return the items in the order they should be tried for one request.
    pub fn order<T: Clone>(&self, items: &[T]) -> Vec<T> {
        match self {
            Policy::Random => match items.len() {
                0 | 1 => items.to_vec(),
                2 => {
                    if rand::thread_rng().gen_bool(0.5) {
                        vec![items[1].clone(), items[0].clone()]
                    } else {
                        items.to_vec()
                    }
                }
                _ => {
                    let mut shuffled = items.to_vec();
                    shuffled.shuffle(&mut rand::thread_rng());
                    shuffled
                }
            },
            Policy::RoundRobin { robin } => {
                if items.is_empty() {
                    return Vec::new();
                }
                let head = robin.fetch_add(1, Ordering::Relaxed) as usize % items.len();
                let mut ordered = Vec::with_capacity(items.len());
                ordered.push(items[head].clone());
                ordered.extend_from_slice(&items[..head]);
                ordered.extend_from_slice(&items[head + 1..]);
                ordered
            }
        }
    }
}
