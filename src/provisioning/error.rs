//! Pipeline-level error taxonomy

use thiserror::Error;

use crate::hypervisor::{RemoteError, TaskError};
use crate::network::DiscoveryError;
use crate::registration::RegistrationError;
use crate::scheduling::SchedulingError;

/// Everything that can end a provisioning or deletion run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProvisionError {
    /// Bad or missing input; raised before any remote call
    #[error("{0}")]
    Validation(String),

    /// No node or NUMA domain could be chosen
    #[error("{0}")]
    Allocation(String),

    #[error("failed to {op}: {source}")]
    Remote {
        op: &'static str,
        source: RemoteError,
    },

    #[error("{0}")]
    TaskFailed(TaskError),

    #[error("failed to get VM IP address: {0}")]
    DiscoveryExhausted(DiscoveryError),

    #[error("node not ready for registration: {0}")]
    RegistrationTimeout(RegistrationError),

    #[error("failed to register node: {0}")]
    Registration(RegistrationError),

    #[error("operation was cancelled")]
    Cancelled,
}

impl ProvisionError {
    pub fn remote(op: &'static str) -> impl FnOnce(RemoteError) -> Self {
        move |source| ProvisionError::Remote { op, source }
    }

    /// Whether the caller is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProvisionError::Validation(_))
    }
}

impl From<SchedulingError> for ProvisionError {
    fn from(e: SchedulingError) -> Self {
        match e {
            SchedulingError::ConflictingCorePolicy
            | SchedulingError::NodeNotFound(_)
            | SchedulingError::NumaNotFound { .. } => ProvisionError::Validation(e.to_string()),
            SchedulingError::NoNodesAvailable | SchedulingError::NoNumaNodes(_) => {
                ProvisionError::Allocation(e.to_string())
            }
        }
    }
}

impl From<TaskError> for ProvisionError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Cancelled(_) => ProvisionError::Cancelled,
            TaskError::Remote { source, .. } => ProvisionError::Remote {
                op: "poll task status",
                source,
            },
            other => ProvisionError::TaskFailed(other),
        }
    }
}

impl From<DiscoveryError> for ProvisionError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::Cancelled => ProvisionError::Cancelled,
            other => ProvisionError::DiscoveryExhausted(other),
        }
    }
}

impl From<RegistrationError> for ProvisionError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::Cancelled => ProvisionError::Cancelled,
            RegistrationError::NotReady { .. } => ProvisionError::RegistrationTimeout(e),
            other => ProvisionError::Registration(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_scheduling_errors_split_by_fault() {
        assert!(ProvisionError::from(SchedulingError::ConflictingCorePolicy).is_client_error());
        assert!(ProvisionError::from(SchedulingError::NodeNotFound("x".into())).is_client_error());
        assert!(!ProvisionError::from(SchedulingError::NoNodesAvailable).is_client_error());
    }

    #[test]
    fn test_cancellation_collapses() {
        assert_eq!(
            ProvisionError::from(TaskError::Cancelled("UPID:1".into())),
            ProvisionError::Cancelled
        );
        assert_eq!(
            ProvisionError::from(DiscoveryError::Cancelled),
            ProvisionError::Cancelled
        );
        assert_eq!(
            ProvisionError::from(RegistrationError::Cancelled),
            ProvisionError::Cancelled
        );
    }

    #[test]
    fn test_not_ready_is_timeout() {
        let err = ProvisionError::from(RegistrationError::NotReady {
            ip: Ipv4Addr::new(10, 0, 0, 5),
            attempts: 30,
            reason: "refused".into(),
        });
        assert!(matches!(err, ProvisionError::RegistrationTimeout(_)));
    }

    #[test]
    fn test_status_lookup_failure_is_remote() {
        let err = ProvisionError::from(TaskError::Remote {
            upid: "UPID:1".into(),
            source: RemoteError::Decode("bad envelope".into()),
        });
        assert_eq!(
            err,
            ProvisionError::Remote {
                op: "poll task status",
                source: RemoteError::Decode("bad envelope".into()),
            }
        );

        let err = ProvisionError::from(TaskError::Failed {
            upid: "UPID:2".into(),
            exit_status: "no space".into(),
        });
        assert!(matches!(err, ProvisionError::TaskFailed(_)));
    }

    #[test]
    fn test_remote_message() {
        let err = ProvisionError::remote("clone VM")(RemoteError::Http("reset".into()));
        assert_eq!(err.to_string(), "failed to clone VM: HTTP error: reset");
    }
}
