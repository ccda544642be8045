//! Address discovery through a Mikrotik router's DHCP lease table

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{poll_for_address, AddressResolver, DiscoveryError, DiscoverySettings};
use crate::hypervisor::device::{nic_mac, PRIMARY_NIC};
use crate::hypervisor::{RemoteError, VmOperations};

/// One entry of `/rest/ip/dhcp-server/lease`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DhcpLease {
    #[serde(rename = "active-address")]
    pub active_address: String,

    #[serde(rename = "active-mac-address")]
    pub active_mac_address: String,

    pub address: String,

    #[serde(rename = "mac-address")]
    pub mac_address: String,

    #[serde(rename = "host-name")]
    pub host_name: String,

    pub status: String,
}

fn normalize_mac(mac: &str) -> String {
    mac.replace('-', ":").to_ascii_uppercase()
}

/// Find the leased address for `mac`.
///
/// Both the static and the active MAC are compared. `active-address` wins
/// over `address`; leases with neither set are skipped.
pub fn find_ip_by_mac<'a>(leases: &'a [DhcpLease], mac: &str) -> Option<&'a str> {
    let wanted = normalize_mac(mac);
    leases
        .iter()
        .filter(|l| {
            normalize_mac(&l.mac_address) == wanted || normalize_mac(&l.active_mac_address) == wanted
        })
        .find_map(|l| {
            [l.active_address.as_str(), l.address.as_str()]
                .into_iter()
                .find(|a| !a.is_empty())
        })
}

/// Source of DHCP leases
#[async_trait]
pub trait LeaseSource: Send + Sync {
    async fn leases(&self) -> Result<Vec<DhcpLease>, RemoteError>;
}

/// Router connection settings
#[derive(Debug, Clone)]
pub struct MikrotikConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// REST client for the router's lease table
pub struct MikrotikClient {
    http: Client,
    config: MikrotikConfig,
}

impl MikrotikClient {
    pub fn new(config: MikrotikConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn lease_url(&self) -> String {
        format!(
            "http://{}:{}/rest/ip/dhcp-server/lease",
            self.config.address, self.config.port
        )
    }
}

#[async_trait]
impl LeaseSource for MikrotikClient {
    async fn leases(&self) -> Result<Vec<DhcpLease>, RemoteError> {
        let response = self
            .http
            .get(self.lease_url())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(RemoteError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Resolves a VM's address from the MAC of its primary NIC
pub struct LeaseResolver {
    vms: Arc<dyn VmOperations>,
    leases: Arc<dyn LeaseSource>,
    settings: DiscoverySettings,
}

impl LeaseResolver {
    pub fn new(vms: Arc<dyn VmOperations>, leases: Arc<dyn LeaseSource>) -> Self {
        Self {
            vms,
            leases,
            settings: DiscoverySettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: DiscoverySettings) -> Self {
        self.settings = settings;
        self
    }

    async fn vm_mac(&self, node: &str, vmid: u32) -> Result<String, DiscoveryError> {
        let config = self
            .vms
            .vm_config(node, vmid)
            .await
            .map_err(|e| DiscoveryError::MacUnavailable(e.to_string()))?;

        let device = config
            .get(PRIMARY_NIC)
            .and_then(|v| v.as_str())
            .ok_or_else(|| DiscoveryError::MacUnavailable(format!("{} not configured", PRIMARY_NIC)))?;

        nic_mac(device)
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::MacUnavailable(format!("no MAC in {}", device)))
    }
}

#[async_trait]
impl AddressResolver for LeaseResolver {
    async fn resolve(
        &self,
        node: &str,
        vmid: u32,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, DiscoveryError> {
        let mac = self.vm_mac(node, vmid).await?;
        info!("Getting VM IP from DHCP leases: vmid={}, mac={}", vmid, mac);

        poll_for_address(self.settings, cancel, || async {
            let leases = self.leases.leases().await?;
            let found = find_ip_by_mac(&leases, &mac).and_then(|a| match a.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    debug!("Ignoring non-IPv4 lease address {}", a);
                    None
                }
            });
            Ok(found)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockHypervisor;
    use crate::hypervisor::VmConfig;
    use std::sync::Mutex;

    fn lease(mac: &str, active_mac: &str, addr: &str, active: &str) -> DhcpLease {
        DhcpLease {
            mac_address: mac.to_string(),
            active_mac_address: active_mac.to_string(),
            address: addr.to_string(),
            active_address: active.to_string(),
            ..Default::default()
        }
    }

    struct ScriptedLeases(Mutex<Vec<Result<Vec<DhcpLease>, RemoteError>>>);

    #[async_trait]
    impl LeaseSource for ScriptedLeases {
        async fn leases(&self) -> Result<Vec<DhcpLease>, RemoteError> {
            let mut queue = self.0.lock().unwrap();
            if queue.is_empty() {
                Ok(Vec::new())
            } else {
                queue.remove(0)
            }
        }
    }

    fn mock_with_nic(nic: &str) -> Arc<MockHypervisor> {
        let mock = Arc::new(MockHypervisor::new(100));
        let mut config = VmConfig::new();
        config.insert(PRIMARY_NIC.to_string(), serde_json::json!(nic));
        mock.set_config(config);
        mock
    }

    #[test]
    fn test_find_prefers_active_address() {
        let leases = vec![
            lease("AA:AA:AA:AA:AA:AA", "", "10.0.0.1", ""),
            lease("bc-24-11-aa-bb-cc", "", "10.0.0.2", "10.0.0.3"),
        ];
        assert_eq!(find_ip_by_mac(&leases, "BC:24:11:AA:BB:CC"), Some("10.0.0.3"));
    }

    #[test]
    fn test_find_matches_active_mac() {
        let leases = vec![lease("", "bc:24:11:aa:bb:cc", "10.0.0.2", "")];
        assert_eq!(find_ip_by_mac(&leases, "BC-24-11-AA-BB-CC"), Some("10.0.0.2"));
        assert_eq!(find_ip_by_mac(&leases, "BC:24:11:AA:BB:00"), None);
    }

    #[test]
    fn test_lease_deserialization() {
        let json = r#"[{".id": "*1", "address": "10.0.0.7", "mac-address": "BC:24:11:AA:BB:CC",
                        "status": "bound", "dynamic": "true"}]"#;
        let leases: Vec<DhcpLease> = serde_json::from_str(json).unwrap();
        assert_eq!(leases[0].address, "10.0.0.7");
        assert_eq!(leases[0].active_address, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_waits_for_lease() {
        let mock = mock_with_nic("virtio=BC:24:11:AA:BB:CC,bridge=vmbr0");
        let leases = Arc::new(ScriptedLeases(Mutex::new(vec![
            Err(RemoteError::Http("router busy".to_string())),
            Ok(vec![]),
            Ok(vec![lease("BC:24:11:AA:BB:CC", "", "10.0.0.8", "")]),
        ])));
        let resolver = LeaseResolver::new(mock, leases);

        let ip = resolver
            .resolve("hv1", 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 8));
    }

    #[tokio::test]
    async fn test_resolver_without_mac() {
        let mock = mock_with_nic("bridge=vmbr0");
        let leases = Arc::new(ScriptedLeases(Mutex::new(vec![])));
        let resolver = LeaseResolver::new(mock, leases);

        let result = resolver.resolve("hv1", 100, &CancellationToken::new()).await;
        assert!(matches!(result, Err(DiscoveryError::MacUnavailable(_))));
    }
}
