//! Side channel for errors surfaced to callers

use tracing::error;

/// Receives every error the service surfaces, tagged with where it happened
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, error: &dyn std::error::Error);
}

/// Emits each report as a structured `tracing` error event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, context: &str, err: &dyn std::error::Error) {
        error!(context = context, "{}", err);
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Collects reports for assertions
    #[derive(Default)]
    pub struct CollectingReporter {
        reports: Mutex<Vec<(String, String)>>,
    }

    impl CollectingReporter {
        pub fn reports(&self) -> Vec<(String, String)> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, context: &str, err: &dyn std::error::Error) {
            self.reports
                .lock()
                .unwrap()
                .push((context.to_string(), err.to_string()));
        }
    }
}
