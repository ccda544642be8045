//! Remote hypervisor operations
//!
//! The provisioning pipeline only talks to the hypervisor through the traits
//! in this module. [`client::ProxmoxClient`] is the HTTP implementation;
//! [`mock`] provides a scripted one for tests.

pub mod client;
pub mod device;
pub mod tasks;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{ProxmoxClient, ProxmoxConfig};
pub use tasks::{TaskError, TaskTracker};

/// Errors talking to a remote collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    NotFound(String),
}

/// Handle returned by an asynchronous remote operation
///
/// An empty handle means the operation already completed synchronously.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTask(Option<String>);

impl RemoteTask {
    /// Operation finished synchronously; nothing to track
    pub fn completed() -> Self {
        Self(None)
    }

    pub fn pending(upid: impl Into<String>) -> Self {
        let upid = upid.into();
        if upid.is_empty() {
            Self(None)
        } else {
            Self(Some(upid))
        }
    }

    pub fn upid(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.0.is_none()
    }
}

impl From<Option<String>> for RemoteTask {
    fn from(value: Option<String>) -> Self {
        value.map(RemoteTask::pending).unwrap_or_default()
    }
}

/// Status reported for a remote task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Stopped { exit_status: String },
    /// A status string the tracker does not understand
    Unknown(String),
}

/// How a VM is brought down before deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMethod {
    /// ACPI shutdown request
    #[default]
    Shutdown,
    /// Hard power off
    Stop,
}

impl StopMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopMethod::Shutdown => "shutdown",
            StopMethod::Stop => "stop",
        }
    }
}

impl fmt::Display for StopMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "shutdown" => Ok(StopMethod::Shutdown),
            "stop" => Ok(StopMethod::Stop),
            other => Err(format!("Invalid stop_method: {}", other)),
        }
    }
}

/// One address reported by the guest agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestAddress {
    #[serde(rename = "ip-address")]
    pub address: String,
    #[serde(rename = "ip-address-type")]
    pub address_type: String,
}

/// One network interface reported by the guest agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub addresses: Vec<GuestAddress>,
}

/// Current VM configuration as a key/value map
pub type VmConfig = HashMap<String, serde_json::Value>;

/// Ordered form fields for a configuration update
pub type ConfigUpdate = Vec<(String, String)>;

// ============================================================================
// SBIO: Traits for abstraction (allows mocking in tests)
// ============================================================================

/// VM lifecycle operations on the hypervisor cluster
#[async_trait]
pub trait VmOperations: Send + Sync {
    /// Reserve a fresh cluster-wide VM id
    async fn next_id(&self) -> Result<u32, RemoteError>;

    async fn clone_vm(
        &self,
        node: &str,
        template_id: u32,
        new_id: u32,
        name: &str,
    ) -> Result<RemoteTask, RemoteError>;

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig, RemoteError>;

    async fn configure_vm(
        &self,
        node: &str,
        vmid: u32,
        fields: &ConfigUpdate,
    ) -> Result<RemoteTask, RemoteError>;

    async fn resize_disk(
        &self,
        node: &str,
        vmid: u32,
        disk: &str,
        size_gib: u32,
    ) -> Result<RemoteTask, RemoteError>;

    async fn start_vm(&self, node: &str, vmid: u32) -> Result<RemoteTask, RemoteError>;

    async fn stop_vm(
        &self,
        node: &str,
        vmid: u32,
        method: StopMethod,
    ) -> Result<RemoteTask, RemoteError>;

    async fn reset_vm(&self, node: &str, vmid: u32) -> Result<RemoteTask, RemoteError>;

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<RemoteTask, RemoteError>;

    /// Find a VM id by name on one node; `Ok(None)` when absent
    async fn find_vm_by_name(&self, node: &str, name: &str) -> Result<Option<u32>, RemoteError>;
}

/// Status lookup for asynchronous remote tasks
#[async_trait]
pub trait TaskStatusSource: Send + Sync {
    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, RemoteError>;
}

/// In-guest agent introspection
#[async_trait]
pub trait GuestAgent: Send + Sync {
    async fn network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<Vec<GuestInterface>, RemoteError>;
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
