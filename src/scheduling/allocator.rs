//! NUMA selection and host core affinity
//!
//! Host affinity and guest vCPU count are independent: the guest always sees
//! exactly the template's core count, while the affinity list may be wider
//! when hyperthread siblings are included.

use rand::Rng;
use tracing::{debug, info};

use super::cores;
use super::SchedulingError;
use crate::config::{HypervisorNode, NumaNode};

/// Which host core pool a VM is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorePolicy {
    /// Physical and hyperthread cores together
    #[default]
    Both,
    PhysicalOnly,
    HyperthreadOnly,
}

impl CorePolicy {
    /// Build a policy from the two request flags, rejecting the combination
    /// of both.
    pub fn from_flags(physical_only: bool, ht_only: bool) -> Result<Self, SchedulingError> {
        match (physical_only, ht_only) {
            (true, true) => Err(SchedulingError::ConflictingCorePolicy),
            (true, false) => Ok(CorePolicy::PhysicalOnly),
            (false, true) => Ok(CorePolicy::HyperthreadOnly),
            (false, false) => Ok(CorePolicy::Both),
        }
    }
}

/// Explicit core lists that bypass pool selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreOverrides {
    pub phy: Option<String>,
    pub ht: Option<String>,
}

impl CoreOverrides {
    pub fn is_empty(&self) -> bool {
        self.phy.as_deref().map_or(true, str::is_empty) && self.ht.as_deref().map_or(true, str::is_empty)
    }

    /// Non-empty override strings in phy, ht order
    fn parts(&self) -> Vec<&str> {
        [self.phy.as_deref(), self.ht.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Resolve the NUMA domain for a new VM.
///
/// An explicit id must exist on the node; otherwise one domain is picked
/// uniformly at random.
pub fn select_numa<'a, R: Rng + ?Sized>(
    node: &'a HypervisorNode,
    explicit: Option<u32>,
    rng: &mut R,
) -> Result<&'a NumaNode, SchedulingError> {
    if let Some(id) = explicit {
        return node.numa_node(id).ok_or_else(|| SchedulingError::NumaNotFound {
            node: node.name.clone(),
            id,
        });
    }

    if node.numa.is_empty() {
        return Err(SchedulingError::NoNumaNodes(node.name.clone()));
    }

    let numa = &node.numa[rng.gen_range(0..node.numa.len())];
    info!("Auto-selected NUMA node ID: {}", numa.id);
    Ok(numa)
}

/// Compute the affinity list for a NUMA domain under a policy.
pub fn allocate(numa: &NumaNode, policy: CorePolicy) -> String {
    let physical = cores::parse(&numa.cores.phy);
    let hyperthread = cores::parse(&numa.cores.ht);

    debug!(
        "Available cores on NUMA {}: phy={} ({}), ht={} ({})",
        numa.id,
        numa.cores.phy,
        physical.len(),
        numa.cores.ht,
        hyperthread.len()
    );

    let selected: cores::CoreSet = match policy {
        CorePolicy::PhysicalOnly => physical,
        CorePolicy::HyperthreadOnly => hyperthread,
        CorePolicy::Both => physical.union(&hyperthread).copied().collect(),
    };

    let affinity = cores::format(selected.iter().copied());
    info!(
        "Selected cores ({:?}): {} ({} cores)",
        policy,
        affinity,
        selected.len()
    );
    affinity
}

/// Compute the affinity list, preferring explicit overrides.
///
/// Overrides are used verbatim (joined with `,`). A mismatch between the
/// override width and `vcpus` is reported but not rejected.
pub fn allocate_with_overrides(
    numa: &NumaNode,
    policy: CorePolicy,
    overrides: &CoreOverrides,
    vcpus: u32,
) -> String {
    if overrides.is_empty() {
        return allocate(numa, policy);
    }

    let parts = overrides.parts();
    let total: usize = parts.iter().map(|p| cores::count(p)).sum();
    if total != vcpus as usize {
        info!(
            "Total specified cores ({}) doesn't match VM template cores ({})",
            total, vcpus
        );
    }
    parts.join(",")
}

/// Guest-visible vCPU list for `vcpus` cores, always `0..vcpus-1`.
pub fn guest_cpu_list(vcpus: u32) -> String {
    format!("0-{}", vcpus.saturating_sub(1))
}
