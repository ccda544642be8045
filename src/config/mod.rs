pub mod cluster;

pub use cluster::{
    BaseTemplate, ClusterConfig, CoreRange, HypervisorNode, NumaNode, Role, TopologyError,
    VmTemplate,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid cluster topology: {0}")]
    Invalid(#[from] TopologyError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a cluster topology file from disk.
pub fn load_cluster_file(path: &Path) -> Result<ClusterConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = ClusterConfig::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_cluster_file() {
        let content = r#"
nodes:
  - name: hv1
    weight: 1
    suffix: a
vm_templates:
  - { name: small, cpu: 2, memory: 2048, disk: 20 }
"#;

        let file = create_temp_file(content);
        let config = load_cluster_file(file.path()).unwrap();
        assert_eq!(config.nodes[0].name, "hv1");
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_cluster_file(Path::new("/nonexistent/cluster.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_load_invalid_file() {
        let file = create_temp_file("nodes: []");
        let result = load_cluster_file(file.path());
        assert!(matches!(
            result,
            Err(ConfigError::Invalid(TopologyError::NoNodes))
        ));
    }
}
