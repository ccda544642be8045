//! Cluster topology - hypervisor nodes and VM templates
//!
//! The topology is read once at startup and shared read-only for the
//! lifetime of the process. Nothing in here performs I/O.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors found while validating a parsed topology
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("no hypervisor nodes configured")]
    NoNodes,

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' declares NUMA id {id} more than once")]
    DuplicateNuma { node: String, id: u32 },

    #[error("duplicate vm template '{0}'")]
    DuplicateTemplate(String),

    #[error("total node weight must be positive")]
    ZeroTotalWeight,

    #[error("vm template '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("YAML parse error: {0}")]
    Parse(String),
}

/// A named base image available for cloning on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseTemplate {
    pub name: String,
    pub id: u32,
}

/// Physical and hyperthread core lists of one NUMA domain
///
/// Both fields use the comma/range notation understood by
/// [`crate::scheduling::cores`], e.g. `"0-7,16"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreRange {
    #[serde(default)]
    pub phy: String,
    #[serde(default)]
    pub ht: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: u32,
    #[serde(default)]
    pub cores: CoreRange,
}

/// A hypervisor node VMs can be placed on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorNode {
    pub name: String,

    /// Relative selection probability; 0 means "explicit name only"
    #[serde(default)]
    pub weight: u32,

    /// Short tag used when deriving VM names
    #[serde(default)]
    pub suffix: String,

    /// Hyperthreading enabled on this host
    #[serde(default)]
    pub ht: bool,

    #[serde(default)]
    pub hugepages: bool,

    #[serde(default)]
    pub numa: Vec<NumaNode>,

    #[serde(default)]
    pub base_templates: Vec<BaseTemplate>,
}

impl HypervisorNode {
    /// Look up a base template id by name
    pub fn base_template(&self, name: &str) -> Option<&BaseTemplate> {
        self.base_templates.iter().find(|t| t.name == name)
    }

    /// Look up a NUMA domain by id
    pub fn numa_node(&self, id: u32) -> Option<&NumaNode> {
        self.numa.iter().find(|n| n.id == id)
    }
}

/// Role a provisioned VM takes in the managed cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Worker,
    Controlplane,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Controlplane => "controlplane",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named provisioning profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub name: String,

    /// Guest vCPU count
    pub cpu: u32,

    /// Memory in MiB
    pub memory: u32,

    /// Primary disk size in GiB
    pub disk: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,

    #[serde(default)]
    pub role: Role,

    /// Static NUMA id override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numa: Option<u32>,

    /// Static physical core override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phy: Option<String>,

    /// Static hyperthread core override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ht: Option<String>,
}

/// The whole topology file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<HypervisorNode>,

    #[serde(default)]
    pub vm_templates: Vec<VmTemplate>,
}

impl ClusterConfig {
    /// Parse and validate a topology from YAML
    pub fn from_str(yaml: &str) -> Result<Self, TopologyError> {
        let config: ClusterConfig =
            serde_yaml::from_str(yaml).map_err(|e| TopologyError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn node(&self, name: &str) -> Option<&HypervisorNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn vm_template(&self, name: &str) -> Option<&VmTemplate> {
        self.vm_templates.iter().find(|t| t.name == name)
    }

    pub fn total_weight(&self) -> u64 {
        self.nodes.iter().map(|n| n.weight as u64).sum()
    }

    /// Check structural invariants of the topology
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::NoNodes);
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateNode(node.name.clone()));
            }

            let mut numa_ids = HashSet::new();
            for numa in &node.numa {
                if !numa_ids.insert(numa.id) {
                    return Err(TopologyError::DuplicateNuma {
                        node: node.name.clone(),
                        id: numa.id,
                    });
                }
            }
        }

        if self.total_weight() == 0 {
            return Err(TopologyError::ZeroTotalWeight);
        }

        let mut templates = HashSet::new();
        for template in &self.vm_templates {
            if !templates.insert(template.name.as_str()) {
                return Err(TopologyError::DuplicateTemplate(template.name.clone()));
            }
            let reason = if template.cpu == 0 {
                Some("cpu must be at least 1")
            } else if template.memory == 0 {
                Some("memory must be at least 1 MiB")
            } else if template.disk == 0 {
                Some("disk must be at least 1 GiB")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(TopologyError::InvalidTemplate {
                    name: template.name.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        Ok(())
    }
}
