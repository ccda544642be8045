//! Inputs and outcomes of the provisioning pipeline

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::config::Role;
use crate::hypervisor::StopMethod;
use crate::scheduling::CoreOverrides;

/// Largest number of VMs a single bulk request may create
pub const MAX_BATCH_COUNT: u32 = 100;

/// A validated request to create one or more VMs
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningRequest {
    pub base_template: String,
    pub vm_template: String,
    pub node: Option<String>,
    pub name: Option<String>,
    pub numa: Option<u32>,
    pub cores: CoreOverrides,
    pub phy_only: bool,
    pub ht_only: bool,
    pub reset: bool,
    pub count: u32,
}

impl ProvisioningRequest {
    pub fn new(base_template: impl Into<String>, vm_template: impl Into<String>) -> Self {
        Self {
            base_template: base_template.into(),
            vm_template: vm_template.into(),
            node: None,
            name: None,
            numa: None,
            cores: CoreOverrides::default(),
            phy_only: false,
            ht_only: false,
            reset: false,
            count: 1,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn is_bulk(&self) -> bool {
        self.count > 1
    }
}

/// How the VM to delete is identified
#[derive(Debug, Clone, PartialEq)]
pub enum VmTarget {
    /// Searched across nodes in configured order
    Name(String),
    Id { node: String, vm_id: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub target: VmTarget,
    pub stop_method: StopMethod,
}

/// Outcome for one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub vm_id: u32,
    pub node: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    pub reset: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisioningResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Ordered outcomes of a bulk request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub count: usize,
    pub vms: Vec<ProvisioningResult>,
}

impl BatchResult {
    pub fn new(vms: Vec<ProvisioningResult>) -> Self {
        Self {
            count: vms.len(),
            vms,
        }
    }

    pub fn failures(&self) -> usize {
        self.vms.iter().filter(|vm| !vm.is_success()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionResult {
    pub node: String,
    pub vm_id: u32,
}
