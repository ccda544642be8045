//! Address discovery through the in-guest agent

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{poll_for_address, AddressResolver, DiscoveryError, DiscoverySettings};
use crate::hypervisor::{GuestAgent, GuestInterface};

/// Interface assumed when none is configured
pub const DEFAULT_INTERFACE: &str = "eth0";

const LOOPBACK_INTERFACE: &str = "lo";

fn usable_ipv4(iface: &GuestInterface) -> Option<Ipv4Addr> {
    iface
        .addresses
        .iter()
        .filter(|a| a.address_type == "ipv4")
        .filter_map(|a| a.address.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback())
}

/// Pick the guest's address from an interface listing.
///
/// The loopback interface is ignored. The target interface wins; otherwise
/// the first usable IPv4 address on any interface is returned.
pub fn pick_address(interfaces: &[GuestInterface], target: &str) -> Option<(String, Ipv4Addr)> {
    let candidates = || {
        interfaces
            .iter()
            .filter(|iface| iface.name != LOOPBACK_INTERFACE)
    };

    if let Some(ip) = candidates()
        .filter(|iface| iface.name == target)
        .find_map(usable_ipv4)
    {
        return Some((target.to_string(), ip));
    }

    debug!(
        "Target interface {} not found, trying any available interface",
        target
    );
    candidates().find_map(|iface| usable_ipv4(iface).map(|ip| (iface.name.clone(), ip)))
}

/// Polls the guest agent for the VM's IPv4 address
#[derive(Clone)]
pub struct IpDiscoverer {
    agent: Arc<dyn GuestAgent>,
    interface: String,
    settings: DiscoverySettings,
}

impl IpDiscoverer {
    pub fn new(agent: Arc<dyn GuestAgent>) -> Self {
        Self {
            agent,
            interface: DEFAULT_INTERFACE.to_string(),
            settings: DiscoverySettings::default(),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        if !interface.is_empty() {
            self.interface = interface;
        }
        self
    }

    pub fn with_settings(mut self, settings: DiscoverySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Discover the address of `vmid`, preferring `target` interface.
    pub async fn discover(
        &self,
        node: &str,
        vmid: u32,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, DiscoveryError> {
        info!("Getting VM IP using guest agent: node={}, vmid={}", node, vmid);
        poll_for_address(self.settings, cancel, || async {
            let interfaces = self.agent.network_interfaces(node, vmid).await?;
            Ok(pick_address(&interfaces, target).map(|(iface, ip)| {
                info!("Found IP address from guest agent on interface {}: {}", iface, ip);
                ip
            }))
        })
        .await
    }
}

#[async_trait]
impl AddressResolver for IpDiscoverer {
    async fn resolve(
        &self,
        node: &str,
        vmid: u32,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, DiscoveryError> {
        self.discover(node, vmid, &self.interface, cancel).await
    }
}
