//! Talos machine registration via `talosctl`

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{render_template, ClusterRegistrar, JoinSubstitutions, RegistrationError};

/// Port of the Talos maintenance API
pub const TALOS_API_PORT: u16 = 50000;

/// How long to wait for a node's API port
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessSettings {
    pub attempts: u32,
    pub delay: Duration,
    pub connect_timeout: Duration,
    pub port: u16,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            port: TALOS_API_PORT,
        }
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Arguments for `talosctl apply-config` against an unconfigured node.
pub fn apply_config_args(ip: Ipv4Addr, file: &str) -> Vec<String> {
    vec![
        "apply-config".to_string(),
        "--insecure".to_string(),
        "--nodes".to_string(),
        ip.to_string(),
        "--file".to_string(),
        file.to_string(),
    ]
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Registers VMs with a Talos cluster
#[derive(Debug, Clone)]
pub struct TalosRegistrar {
    template_path: PathBuf,
    controlplane_endpoint: String,
    talosctl: String,
    readiness: ReadinessSettings,
}

impl TalosRegistrar {
    pub fn new(template_path: impl Into<PathBuf>, controlplane_endpoint: impl Into<String>) -> Self {
        Self {
            template_path: template_path.into(),
            controlplane_endpoint: controlplane_endpoint.into(),
            talosctl: "talosctl".to_string(),
            readiness: ReadinessSettings::default(),
        }
    }

    /// Override the `talosctl` binary
    pub fn with_talosctl(mut self, binary: impl Into<String>) -> Self {
        self.talosctl = binary.into();
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessSettings) -> Self {
        self.readiness = readiness;
        self
    }

    async fn probe(&self, ip: Ipv4Addr) -> Result<(), String> {
        match tokio::time::timeout(
            self.readiness.connect_timeout,
            TcpStream::connect((ip, self.readiness.port)),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {:?}",
                self.readiness.connect_timeout
            )),
        }
    }
}

#[async_trait]
impl ClusterRegistrar for TalosRegistrar {
    async fn generate_config(&self, subs: &JoinSubstitutions) -> Result<String, RegistrationError> {
        let template = tokio::fs::read_to_string(&self.template_path)
            .await
            .map_err(|e| RegistrationError::TemplateRead {
                path: self.template_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut values = subs.to_map();
        values.insert("controlplane_endpoint", self.controlplane_endpoint.clone());
        Ok(render_template(&template, &values))
    }

    async fn wait_ready(
        &self,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), RegistrationError> {
        let attempts = self.readiness.attempts.max(1);

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                r = self.probe(ip) => r,
                _ = cancel.cancelled() => return Err(RegistrationError::Cancelled),
            };

            match outcome {
                Ok(()) => {
                    info!("Talos node {} is accepting connections", ip);
                    return Ok(());
                }
                Err(reason) if attempt == attempts => {
                    return Err(RegistrationError::NotReady {
                        ip,
                        attempts,
                        reason,
                    });
                }
                Err(reason) => {
                    debug!(
                        "Attempt {}/{}: Talos node {} not ready: {}",
                        attempt, attempts, ip, reason
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.readiness.delay) => {}
                _ = cancel.cancelled() => return Err(RegistrationError::Cancelled),
            }
        }

        Err(RegistrationError::NotReady {
            ip,
            attempts,
            reason: "no connection attempt succeeded".to_string(),
        })
    }

    async fn apply(&self, ip: Ipv4Addr, document: &str) -> Result<(), RegistrationError> {
        let apply_err = |reason: String| RegistrationError::Apply { ip, reason };

        let mut file = tempfile::Builder::new()
            .prefix(&format!("talos-config-{}-", ip.to_string().replace('.', "-")))
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| apply_err(format!("failed to create config file: {}", e)))?;
        file.write_all(document.as_bytes())
            .map_err(|e| apply_err(format!("failed to write config file: {}", e)))?;

        let path = file.path().to_string_lossy().into_owned();
        let args = apply_config_args(ip, &path);
        debug!("{} args: {:?}", self.talosctl, args);

        let output = Command::new(&self.talosctl)
            .args(&args)
            .output()
            .await
            .map_err(|e| apply_err(format!("failed to run {}: {}", self.talosctl, e)))?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "talosctl failed: {}\nstdout: {}\nstderr: {}",
                output.status, stdout, stderr
            );
            return Err(apply_err(format!("talosctl exited with {}", output.status)));
        }

        info!("Applied Talos config to node: {}", ip);
        Ok(())
    }
}
