//! CPU, memory and NUMA configuration for a cloned VM

use tracing::info;

use crate::config::{HypervisorNode, VmTemplate};
use crate::hypervisor::device::{self, PRIMARY_DISK, PRIMARY_NIC};
use crate::hypervisor::{ConfigUpdate, VmConfig};
use crate::scheduling::allocator::guest_cpu_list;

/// CPU model used when the template does not name one
pub const DEFAULT_CPU_MODEL: &str = "x86-64-v3";

/// Placement decided for one VM
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub numa_id: u32,
    pub affinity: String,
}

fn current_device<'a>(current: Option<&'a VmConfig>, key: &str) -> Option<&'a str> {
    current?.get(key)?.as_str()
}

/// Build the ordered configuration fields for a freshly cloned VM.
///
/// `current` is the clone's existing configuration; when it is unavailable
/// the device upgrades are skipped.
pub fn build_vm_config(
    template: &VmTemplate,
    node: &HypervisorNode,
    placement: &Placement,
    current: Option<&VmConfig>,
) -> ConfigUpdate {
    let mut fields: ConfigUpdate = Vec::new();
    let mut set = |key: &str, value: String| fields.push((key.to_string(), value));

    set(
        "cpu",
        template
            .cpu_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_CPU_MODEL.to_string()),
    );
    set("cores", template.cpu.to_string());
    set("memory", template.memory.to_string());

    if node.hugepages {
        info!("Setting hugepages=2 for VM");
        set("hugepages", "2".to_string());
    }
    set("numa", "1".to_string());

    if let Some(disk) = current_device(current, PRIMARY_DISK).and_then(device::upgrade_disk) {
        info!("Setting {} with aio=native: {}", PRIMARY_DISK, disk);
        set(PRIMARY_DISK, disk);
    }
    if let Some(nic) = current_device(current, PRIMARY_NIC).and_then(device::upgrade_nic) {
        info!("Setting {} with queues=2: {}", PRIMARY_NIC, nic);
        set(PRIMARY_NIC, nic);
    }

    if !placement.affinity.is_empty() {
        info!("Setting CPU affinity: {}", placement.affinity);
        set("affinity", placement.affinity.clone());
    }

    set("sockets", "1".to_string());

    let numa0 = format!(
        "cpus={},memory={},hostnodes={},policy=bind",
        guest_cpu_list(template.cpu),
        template.memory,
        placement.numa_id
    );
    info!("Setting guest NUMA topology: numa0={}", numa0);
    set("numa0", numa0);

    fields
}
