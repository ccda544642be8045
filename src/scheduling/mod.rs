//! Placement decisions for new VMs: node, NUMA domain and host cores.
//!
//! All randomness flows through [`RandomSource`] so callers (and tests) can
//! pin the generator.

pub mod allocator;
pub mod cores;
pub mod selector;

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

pub use allocator::{allocate, allocate_with_overrides, select_numa, CoreOverrides, CorePolicy};
pub use selector::{select_by_name, select_weighted};

/// Errors raised while choosing where a VM goes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    #[error("Both phy_only and ht_only cannot be set at the same time")]
    ConflictingCorePolicy,

    #[error("Invalid node: {0}")]
    NodeNotFound(String),

    #[error("No nodes available for selection")]
    NoNodesAvailable,

    #[error("NUMA node {id} not found on node {node}")]
    NumaNotFound { node: String, id: u32 },

    #[error("no NUMA nodes defined for node {0}")]
    NoNumaNodes(String),
}

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Shared random generator handed to every placement decision
///
/// The lock is only held for the duration of a single draw, never across
/// an await point.
pub struct RandomSource {
    rng: Mutex<StdRng>,
}

impl RandomSource {
    /// Generator seeded from OS entropy
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator for reproducible runs
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Run `f` with exclusive access to the generator
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut guard = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Random lowercase alphanumeric string of `len` characters
    pub fn alphanumeric(&self, len: usize) -> String {
        self.with_rng(|rng| {
            (0..len)
                .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
                .collect()
        })
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphanumeric_shape() {
        let source = RandomSource::seeded(3);
        let s = source.alphanumeric(6);
        assert_eq!(s.len(), 6);
        assert!(s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = RandomSource::seeded(11);
        let b = RandomSource::seeded(11);
        assert_eq!(a.alphanumeric(12), b.alphanumeric(12));
    }
}
