//! Cluster registration of freshly provisioned VMs
//!
//! A join document is rendered from a machine template, then applied to the
//! VM once its management port accepts connections.

pub mod talos;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Role;

pub use talos::{ReadinessSettings, TalosRegistrar};

/// Errors from the registration collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("failed to read machine template {path}: {reason}")]
    TemplateRead { path: String, reason: String },

    #[error("node {ip} not ready after {attempts} attempts: {reason}")]
    NotReady {
        ip: Ipv4Addr,
        attempts: u32,
        reason: String,
    },

    #[error("failed to apply machine config to {ip}: {reason}")]
    Apply { ip: Ipv4Addr, reason: String },

    #[error("registration was cancelled")]
    Cancelled,
}

/// VM identity fields available to the machine template
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSubstitutions {
    pub role: Role,
    pub vm_name: String,
    pub node: String,
    pub vm_template: String,
    pub cpu: String,
    pub memory: u32,
    pub suffix: String,
    pub cpu_cores: u32,
    pub disk: String,
    pub vm_ip: Ipv4Addr,
}

impl JoinSubstitutions {
    /// Placeholder name to value
    pub fn to_map(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("role", self.role.to_string()),
            ("vm_name", self.vm_name.clone()),
            ("node", self.node.clone()),
            ("vm_template", self.vm_template.clone()),
            ("cpu", self.cpu.clone()),
            ("memory", self.memory.to_string()),
            ("suffix", self.suffix.clone()),
            ("cpu_cores", self.cpu_cores.to_string()),
            ("disk", self.disk.clone()),
            ("vm_ip", self.vm_ip.to_string()),
        ])
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex is valid"))
}

/// Replace `{name}` placeholders. Unknown names are left as written.
pub fn render_template(template: &str, values: &HashMap<&str, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Joins a VM to the cluster
#[async_trait]
pub trait ClusterRegistrar: Send + Sync {
    /// Render the join document for one VM
    async fn generate_config(&self, subs: &JoinSubstitutions) -> Result<String, RegistrationError>;

    /// Wait until the VM's management port accepts connections
    async fn wait_ready(
        &self,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), RegistrationError>;

    /// Push the join document to the VM
    async fn apply(&self, ip: Ipv4Addr, document: &str) -> Result<(), RegistrationError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Registrar that records calls and optionally refuses readiness
    #[derive(Default)]
    pub struct MockRegistrar {
        calls: Mutex<Vec<String>>,
        never_ready: bool,
    }

    impl MockRegistrar {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn never_ready() -> Self {
            Self {
                never_ready: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterRegistrar for MockRegistrar {
        async fn generate_config(
            &self,
            subs: &JoinSubstitutions,
        ) -> Result<String, RegistrationError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("generate {} {}", subs.vm_name, subs.role));
            Ok(render_template("name: {vm_name}\nip: {vm_ip}\n", &subs.to_map()))
        }

        async fn wait_ready(
            &self,
            ip: Ipv4Addr,
            _cancel: &CancellationToken,
        ) -> Result<(), RegistrationError> {
            self.calls.lock().unwrap().push(format!("wait {}", ip));
            if self.never_ready {
                return Err(RegistrationError::NotReady {
                    ip,
                    attempts: 30,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        async fn apply(&self, ip: Ipv4Addr, _document: &str) -> Result<(), RegistrationError> {
            self.calls.lock().unwrap().push(format!("apply {}", ip));
            Ok(())
        }
    }
}
