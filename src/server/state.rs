use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::metrics::DeployerMetrics;
use crate::provisioning::ProvisioningPipeline;
use crate::reporting::{ErrorReporter, TracingReporter};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ProvisioningPipeline>,
    pub metrics: Arc<DeployerMetrics>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub auth_token: Arc<str>,
    pub shutdown: CancellationToken,
    pub request_timeout: Option<Duration>,
}

/// Cancellation scope of one request; dropping it cancels the token
pub struct RequestScope {
    pub token: CancellationToken,
    _guard: DropGuard,
}

impl AppState {
    pub fn new(pipeline: Arc<ProvisioningPipeline>, auth_token: impl Into<Arc<str>>) -> Self {
        let metrics = pipeline.metrics().clone();
        Self {
            pipeline,
            metrics,
            reporter: Arc::new(TracingReporter),
            auth_token: auth_token.into(),
            shutdown: CancellationToken::new(),
            request_timeout: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Check a presented token against the configured one
    pub fn is_authorized(&self, presented: Option<&str>) -> bool {
        presented.is_some_and(|t| t.as_bytes() == self.auth_token.as_bytes())
    }

    /// Child of the shutdown token, also cancelled once the request
    /// timeout elapses.
    pub fn request_scope(&self) -> RequestScope {
        let token = self.shutdown.child_token();

        if let Some(timeout) = self.request_timeout {
            let deadline = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => deadline.cancel(),
                    _ = deadline.cancelled() => {}
                }
            });
        }

        RequestScope {
            _guard: token.clone().drop_guard(),
            token,
        }
    }
}
