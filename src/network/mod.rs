//! VM address discovery
//!
//! A freshly started guest takes a while before its address is visible, so
//! every resolver polls with a bounded attempt budget. Two sources exist:
//! the in-guest agent ([`guest`]) and the DHCP server's lease table
//! ([`lease`]).

pub mod guest;
pub mod lease;

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hypervisor::RemoteError;

pub use guest::IpDiscoverer;
pub use lease::{DhcpLease, LeaseResolver, LeaseSource, MikrotikClient, MikrotikConfig};

/// Default number of lookup attempts
pub const DEFAULT_ATTEMPTS: u32 = 100;

/// Default delay between lookup attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Errors that end address discovery
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("no valid IPv4 address found after {attempts} attempts")]
    NoAddressFound { attempts: u32 },

    #[error("address lookup failed after {attempts} attempts: {source}")]
    TransportExhausted { attempts: u32, source: RemoteError },

    #[error("could not determine MAC address: {0}")]
    MacUnavailable(String),

    #[error("address discovery was cancelled")]
    Cancelled,
}

/// Retry budget for address lookups
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoverySettings {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Resolves the IPv4 address of a running VM
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(
        &self,
        node: &str,
        vmid: u32,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, DiscoveryError>;
}

/// Run `lookup` until it yields an address or the budget is spent.
///
/// Lookup errors are treated as transient; only the final attempt's error is
/// returned.
pub(crate) async fn poll_for_address<F, Fut>(
    settings: DiscoverySettings,
    cancel: &CancellationToken,
    mut lookup: F,
) -> Result<Ipv4Addr, DiscoveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Ipv4Addr>, RemoteError>>,
{
    let attempts = settings.attempts.max(1);

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }

        match lookup().await {
            Ok(Some(ip)) => return Ok(ip),
            Ok(None) if attempt == attempts => {
                return Err(DiscoveryError::NoAddressFound { attempts });
            }
            Ok(None) => {
                info!(
                    "Attempt {}/{}: No valid IP found, retrying in {:?}",
                    attempt, attempts, settings.delay
                );
            }
            Err(source) if attempt == attempts => {
                return Err(DiscoveryError::TransportExhausted { attempts, source });
            }
            Err(e) => {
                info!(
                    "Attempt {}/{}: Address source not ready, retrying in {:?}: {}",
                    attempt, attempts, settings.delay, e
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.delay) => {}
            _ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
        }
    }

    Err(DiscoveryError::NoAddressFound { attempts })
}
