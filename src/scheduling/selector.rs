//! Weighted hypervisor node selection
//!
//! A single-shot heuristic: each node is chosen with probability
//! proportional to its configured weight. Weight-0 nodes are only reachable
//! by explicit name.

use rand::Rng;

use super::SchedulingError;
use crate::config::HypervisorNode;

/// Pick a node at random, weighted by `weight`.
///
/// Returns `None` when there are no nodes or every weight is zero.
pub fn select_weighted<'a, R: Rng + ?Sized>(
    nodes: &'a [HypervisorNode],
    rng: &mut R,
) -> Option<&'a HypervisorNode> {
    let total: u64 = nodes.iter().map(|n| n.weight as u64).sum();
    if total == 0 {
        return None;
    }

    let draw = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for node in nodes {
        cumulative += node.weight as u64;
        if cumulative > draw {
            return Some(node);
        }
    }
    None
}

/// Look up a node by its configured name.
pub fn select_by_name<'a>(
    nodes: &'a [HypervisorNode],
    name: &str,
) -> Result<&'a HypervisorNode, SchedulingError> {
    nodes
        .iter()
        .find(|n| n.name == name)
        .ok_or_else(|| SchedulingError::NodeNotFound(name.to_string()))
}
