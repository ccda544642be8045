//! Tracking of asynchronous remote tasks
//!
//! A task is polled at a fixed interval until it stops. Transport and decode
//! errors abort immediately; they are never retried.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{RemoteError, RemoteTask, TaskStatus, TaskStatusSource};

/// Default delay between status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors that end task tracking
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("task {upid} status lookup failed: {source}")]
    Remote { upid: String, source: RemoteError },

    #[error("task {upid} failed with exit status: {exit_status}")]
    Failed { upid: String, exit_status: String },

    #[error("unknown task status for {upid}: {status}")]
    UnknownStatus { upid: String, status: String },

    #[error("task {upid} did not finish within {timeout:?}")]
    TimedOut { upid: String, timeout: Duration },

    #[error("tracking of task {0} was cancelled")]
    Cancelled(String),
}

/// Polls remote tasks until they reach a terminal state
#[derive(Clone)]
pub struct TaskTracker {
    source: Arc<dyn TaskStatusSource>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl TaskTracker {
    pub fn new(source: Arc<dyn TaskStatusSource>) -> Self {
        Self {
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound the total time spent on one task
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait for `task` on `node` to stop successfully.
    ///
    /// A completed (empty) handle returns immediately without polling.
    pub async fn track(
        &self,
        node: &str,
        task: &RemoteTask,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let Some(upid) = task.upid() else {
            return Ok(());
        };

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.poll(node, upid, cancel))
                .await
                .unwrap_or_else(|_| {
                    Err(TaskError::TimedOut {
                        upid: upid.to_string(),
                        timeout,
                    })
                }),
            None => self.poll(node, upid, cancel).await,
        }
    }

    async fn poll(
        &self,
        node: &str,
        upid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        loop {
            let status = self
                .source
                .task_status(node, upid)
                .await
                .map_err(|source| TaskError::Remote {
                    upid: upid.to_string(),
                    source,
                })?;

            match status {
                TaskStatus::Running => {
                    debug!("Task {} still running", upid);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => {
                            return Err(TaskError::Cancelled(upid.to_string()));
                        }
                    }
                }
                TaskStatus::Stopped { exit_status } if exit_status == "OK" => {
                    info!("Task {} completed successfully", upid);
                    return Ok(());
                }
                TaskStatus::Stopped { exit_status } => {
                    return Err(TaskError::Failed {
                        upid: upid.to_string(),
                        exit_status,
                    });
                }
                TaskStatus::Unknown(status) => {
                    return Err(TaskError::UnknownStatus {
                        upid: upid.to_string(),
                        status,
                    });
                }
            }
        }
    }
}
