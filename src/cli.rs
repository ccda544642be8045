use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Where VM addresses are looked up after boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IpSource {
    /// Query the in-guest agent through the hypervisor
    GuestAgent,
    /// Match the VM's MAC in the router's DHCP leases
    DhcpLease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "vm-deployer")]
#[command(about = "Provision and decommission hypervisor VMs for cluster bootstrapping")]
#[command(version)]
pub struct Args {
    /// Path to the cluster topology file (YAML)
    #[arg(long = "config", env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config_path: PathBuf,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Dry-run mode: validate the topology and print it without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a .env file with credentials
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    #[arg(short, long, env = "LISTEN_PORT", default_value = "8080")]
    pub port: u16,

    /// Token expected in the X-Auth-Token header
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Hypervisor API base, e.g. https://pve:8006/api2/json
    #[arg(long, env = "PROXMOX_BASE_ADDR")]
    pub proxmox_base_addr: Option<String>,

    /// API token in user@realm!id=secret form
    #[arg(long, env = "PROXMOX_TOKEN", hide_env_values = true)]
    pub proxmox_token: Option<String>,

    #[arg(long, env = "VERIFY_SSL", default_value_t = true, action = ArgAction::Set)]
    pub verify_ssl: bool,

    /// Timeout of a single hypervisor API call in seconds
    #[arg(long, default_value = "10")]
    pub api_timeout: u64,

    /// Give up on a remote task after this many seconds
    #[arg(long, env = "TASK_TIMEOUT")]
    pub task_timeout: Option<u64>,

    /// Cancel a create/delete request after this many seconds
    #[arg(long, env = "REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    #[arg(long, env = "IP_SOURCE", value_enum, default_value = "guest-agent")]
    pub ip_source: IpSource,

    /// Guest interface preferred during address discovery
    #[arg(long, env = "TALOS_VM_INTERFACE", default_value = "eth0")]
    pub vm_interface: String,

    /// Machine config template for new nodes
    #[arg(long, env = "TALOS_MACHINE_TEMPLATE", default_value = "talos-machine.yaml")]
    pub talos_machine_template: PathBuf,

    #[arg(long, env = "TALOS_CONTROLPLANE_ENDPOINT", default_value = "")]
    pub talos_controlplane_endpoint: String,

    #[arg(long, env = "MIKROTIK_IP")]
    pub mikrotik_ip: Option<String>,

    #[arg(long, env = "MIKROTIK_PORT", default_value = "8080")]
    pub mikrotik_port: u16,

    #[arg(long, env = "MIKROTIK_USERNAME", default_value = "")]
    pub mikrotik_username: String,

    #[arg(long, env = "MIKROTIK_PASSWORD", default_value = "", hide_env_values = true)]
    pub mikrotik_password: String,
}

impl Args {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout.map(Duration::from_secs)
    }

    /// `~` and `$VAR` expanded form of a configured path
    pub fn expand_path(path: &std::path::Path) -> PathBuf {
        let raw = path.to_string_lossy();
        match shellexpand::full(&raw) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => path.to_path_buf(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        Self::expand_path(&self.config_path)
    }

    pub fn talos_machine_template(&self) -> PathBuf {
        Self::expand_path(&self.talos_machine_template)
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

use crate::config::ClusterConfig;

/// Format a dry-run summary of the loaded topology.
pub fn format_dry_run(cluster: &ClusterConfig, args: &Args) -> String {
    let mut output = String::new();
    let total = cluster.total_weight();

    output.push_str(&format!(
        "vm-deployer v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Topology: {}\n\n", args.config_path.display()));

    output.push_str(&format!("Nodes ({}):\n", cluster.nodes.len()));
    for node in &cluster.nodes {
        let share = if total > 0 {
            node.weight as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        output.push_str(&format!(
            "  [{}] suffix={} weight={} ({:.1}%)",
            node.name, node.suffix, node.weight, share
        ));
        if node.ht {
            output.push_str(" ht");
        }
        if node.hugepages {
            output.push_str(" hugepages");
        }
        output.push('\n');

        for numa in &node.numa {
            output.push_str(&format!(
                "      NUMA {}: phy={} ht={}\n",
                numa.id,
                if numa.cores.phy.is_empty() { "-" } else { numa.cores.phy.as_str() },
                if numa.cores.ht.is_empty() { "-" } else { numa.cores.ht.as_str() },
            ));
        }

        let templates: Vec<String> = node
            .base_templates
            .iter()
            .map(|t| format!("{}={}", t.name, t.id))
            .collect();
        if !templates.is_empty() {
            output.push_str(&format!("      Base templates: {}\n", templates.join(", ")));
        }
    }

    output.push_str(&format!("\nVM templates ({}):\n", cluster.vm_templates.len()));
    for template in &cluster.vm_templates {
        output.push_str(&format!(
            "  - {} [{}] cpu={} memory={}MiB disk={}GiB",
            template.name, template.role, template.cpu, template.memory, template.disk
        ));
        if let Some(ref model) = template.cpu_model {
            output.push_str(&format!(" model={}", model));
        }
        output.push('\n');
    }

    output.push_str(&format!("\nAddress source: {:?}\n", args.ip_source));
    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to serve. Remove --dry-run to start.\n");

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_args() -> Args {
        Args::parse_from(["vm-deployer", "--config", "cluster.yaml", "--dry-run"])
    }

    #[test]
    fn test_format_dry_run_basic() {
        let yaml = r#"
nodes:
  - name: hv1
    weight: 1
    suffix: a
    ht: true
    numa:
      - id: 0
        cores: { phy: "0-3", ht: "" }
    base_templates:
      - { name: tmpl-a, id: 9000 }
  - name: hv2
    weight: 3
    suffix: b
vm_templates:
  - { name: small, cpu: 2, memory: 2048, disk: 20, role: worker }
"#;
        let cluster = ClusterConfig::from_str(yaml).unwrap();
        let output = format_dry_run(&cluster, &create_test_args());

        assert!(output.contains("Nodes (2):"));
        assert!(output.contains("[hv1] suffix=a weight=1 (25.0%) ht"));
        assert!(output.contains("NUMA 0: phy=0-3 ht=-"));
        assert!(output.contains("Base templates: tmpl-a=9000"));
        assert!(output.contains("small [worker] cpu=2 memory=2048MiB disk=20GiB"));
        assert!(output.contains("Validation: PASSED"));
    }

    #[test]
    fn test_clap_parsing() {
        let args = Args::parse_from(["vm-deployer", "--config", "cluster.yaml"]);
        assert_eq!(args.config_path, PathBuf::from("cluster.yaml"));
        assert_eq!(args.verbose, 0);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_clap_verbose_flags() {
        let args = Args::parse_from(["vm-deployer", "-vvv"]);
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_clap_sources_and_timeouts() {
        let args = Args::parse_from([
            "vm-deployer",
            "--ip-source",
            "dhcp-lease",
            "--log-format",
            "json",
            "--verify-ssl",
            "false",
            "--task-timeout",
            "600",
        ]);
        assert_eq!(args.ip_source, IpSource::DhcpLease);
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(!args.verify_ssl);
        assert_eq!(args.task_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(args.request_timeout(), None);
    }

    #[test]
    fn test_env_file_both_forms() {
        let spaced = Args::parse_from(["vm-deployer", "--env-file", "/etc/vm-deployer/env"]);
        let joined = Args::parse_from(["vm-deployer", "--env-file=/etc/vm-deployer/env"]);
        assert_eq!(spaced.env_file, Some(PathBuf::from("/etc/vm-deployer/env")));
        assert_eq!(joined.env_file, spaced.env_file);
    }

    #[test]
    fn test_expand_home() {
        let expanded = Args::expand_path(std::path::Path::new("/etc/vm-deployer/config.yaml"));
        assert_eq!(expanded, PathBuf::from("/etc/vm-deployer/config.yaml"));
    }
}
