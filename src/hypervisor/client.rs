//! Proxmox VE REST client
//!
//! Every response is wrapped in a `{"data": ...}` envelope. Decoding of the
//! envelope payloads is kept in pure functions so it can be tested without
//! a server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{
    ConfigUpdate, GuestAgent, GuestInterface, RemoteError, RemoteTask, StopMethod, TaskStatus,
    TaskStatusSource, VmConfig, VmOperations,
};

/// Connection settings for the hypervisor API
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// Base URL including the API prefix, e.g. `https://pve:8006/api2/json`
    pub base_url: String,

    /// API token in `user@realm!id=secret` form
    pub token: String,

    pub verify_ssl: bool,

    pub timeout: Duration,
}

impl ProxmoxConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            verify_ssl: true,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TaskStatusBody {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmListEntry {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResult {
    #[serde(default)]
    result: Vec<GuestInterface>,
}

// ============================================================================
// SBIO: Pure decoding (no I/O)
// ============================================================================

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, RemoteError> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(|e| e.data)
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Decode the next-id payload, which the API returns as a numeric string.
pub fn decode_next_id(body: &str) -> Result<u32, RemoteError> {
    let data: Value = decode(body)?;
    match data {
        Value::String(s) => s
            .parse()
            .map_err(|_| RemoteError::Decode(format!("invalid next id: {}", s))),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| RemoteError::Decode(format!("invalid next id: {}", n))),
        other => Err(RemoteError::Decode(format!("invalid next id: {}", other))),
    }
}

/// Decode a task handle; `null` or an empty string mean "already done".
pub fn decode_task(body: &str) -> Result<RemoteTask, RemoteError> {
    let data: Option<String> = decode(body)?;
    Ok(RemoteTask::from(data))
}

/// Decode a task status payload.
///
/// The payload is either an object or an array whose first element is the
/// status object.
pub fn decode_task_status(body: &str) -> Result<TaskStatus, RemoteError> {
    let data: Value = decode(body)?;
    let status: TaskStatusBody = match data {
        Value::Object(_) => {
            serde_json::from_value(data).map_err(|e| RemoteError::Decode(e.to_string()))?
        }
        Value::Array(mut items) => {
            if items.is_empty() {
                return Err(RemoteError::Decode("empty task status array".to_string()));
            }
            serde_json::from_value(items.swap_remove(0))
                .map_err(|e| RemoteError::Decode(e.to_string()))?
        }
        _ => {
            return Err(RemoteError::Decode(
                "unexpected task status format".to_string(),
            ))
        }
    };

    Ok(match status.status.as_str() {
        "running" => TaskStatus::Running,
        "stopped" => TaskStatus::Stopped {
            exit_status: status.exitstatus.unwrap_or_default(),
        },
        other => TaskStatus::Unknown(other.to_string()),
    })
}

/// Find a VM id by name in a `/nodes/{node}/qemu` listing.
pub fn decode_vm_lookup(body: &str, name: &str) -> Result<Option<u32>, RemoteError> {
    let vms: Vec<VmListEntry> = decode(body)?;
    Ok(vms
        .into_iter()
        .find(|vm| vm.name.as_deref() == Some(name))
        .map(|vm| vm.vmid))
}

/// Decode the guest agent `network-get-interfaces` payload.
pub fn decode_interfaces(body: &str) -> Result<Vec<GuestInterface>, RemoteError> {
    let data: AgentResult = decode(body)?;
    Ok(data.result)
}

// ============================================================================
// I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ProxmoxClient {
    pub fn new(config: ProxmoxConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| RemoteError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("PVEAPIToken={}", self.token))
    }

    async fn send(&self, op: &str, req: RequestBuilder) -> Result<String, RemoteError> {
        let response = req
            .send()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        debug!("{} raw response: {}", op, body);

        if !status.is_success() {
            return Err(RemoteError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(body)
    }

    async fn task_request(&self, op: &str, req: RequestBuilder) -> Result<RemoteTask, RemoteError> {
        let body = self.send(op, req).await?;
        let task = decode_task(&body)?;
        match task.upid() {
            Some(upid) => info!("{} task created successfully: {}", op, upid),
            None => info!("{} completed synchronously", op),
        }
        Ok(task)
    }
}

#[async_trait]
impl VmOperations for ProxmoxClient {
    async fn next_id(&self) -> Result<u32, RemoteError> {
        let body = self
            .send("next_id", self.request(Method::GET, "/cluster/nextid"))
            .await?;
        let id = decode_next_id(&body)?;
        info!("Obtained next VM id: {}", id);
        Ok(id)
    }

    async fn clone_vm(
        &self,
        node: &str,
        template_id: u32,
        new_id: u32,
        name: &str,
    ) -> Result<RemoteTask, RemoteError> {
        let form = [
            ("newid", new_id.to_string()),
            ("name", name.to_string()),
            ("full", "1".to_string()),
            ("format", "raw".to_string()),
        ];
        let req = self
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/clone", node, template_id),
            )
            .form(&form[..]);
        self.task_request("Clone", req).await
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig, RemoteError> {
        let req = self.request(Method::GET, &format!("/nodes/{}/qemu/{}/config", node, vmid));
        let body = self.send("vm_config", req).await?;
        decode(&body)
    }

    async fn configure_vm(
        &self,
        node: &str,
        vmid: u32,
        fields: &ConfigUpdate,
    ) -> Result<RemoteTask, RemoteError> {
        for (key, value) in fields {
            debug!("VM Configure   {}: {}", key, value);
        }
        let req = self
            .request(Method::POST, &format!("/nodes/{}/qemu/{}/config", node, vmid))
            .form(fields);
        self.task_request("Configure VM", req).await
    }

    async fn resize_disk(
        &self,
        node: &str,
        vmid: u32,
        disk: &str,
        size_gib: u32,
    ) -> Result<RemoteTask, RemoteError> {
        let form = [("disk", disk.to_string()), ("size", format!("{}G", size_gib))];
        let req = self
            .request(Method::PUT, &format!("/nodes/{}/qemu/{}/resize", node, vmid))
            .form(&form[..]);
        self.task_request("Resize disk", req).await
    }

    async fn start_vm(&self, node: &str, vmid: u32) -> Result<RemoteTask, RemoteError> {
        let req = self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/start", node, vmid),
        );
        self.task_request("Start VM", req).await
    }

    async fn stop_vm(
        &self,
        node: &str,
        vmid: u32,
        method: StopMethod,
    ) -> Result<RemoteTask, RemoteError> {
        let req = self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/{}", node, vmid, method),
        );
        self.task_request("Stop VM", req).await
    }

    async fn reset_vm(&self, node: &str, vmid: u32) -> Result<RemoteTask, RemoteError> {
        let req = self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/reset", node, vmid),
        );
        self.task_request("Reset VM", req).await
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<RemoteTask, RemoteError> {
        let req = self.request(Method::DELETE, &format!("/nodes/{}/qemu/{}", node, vmid));
        self.task_request("Delete VM", req).await
    }

    async fn find_vm_by_name(&self, node: &str, name: &str) -> Result<Option<u32>, RemoteError> {
        let req = self.request(Method::GET, &format!("/nodes/{}/qemu", node));
        let body = self.send("find_vm_by_name", req).await?;
        decode_vm_lookup(&body, name)
    }
}

#[async_trait]
impl TaskStatusSource for ProxmoxClient {
    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, RemoteError> {
        let req = self.request(
            Method::GET,
            &format!("/nodes/{}/tasks/{}/status", node, upid),
        );
        let body = self.send("task_status", req).await?;
        decode_task_status(&body)
    }
}

#[async_trait]
impl GuestAgent for ProxmoxClient {
    async fn network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<Vec<GuestInterface>, RemoteError> {
        let req = self.request(
            Method::GET,
            &format!("/nodes/{}/qemu/{}/agent/network-get-interfaces", node, vmid),
        );
        let body = self.send("network_interfaces", req).await?;
        decode_interfaces(&body)
    }
}
