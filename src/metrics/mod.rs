//! Deployment counters exported in Prometheus text format
//!
//! Counters are monotonic and keyed by their label values. Updates go through
//! `DashMap` shards and atomics, so handlers never contend on a global lock.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

const CREATED: &str = "vm_deployer_vm_created_total";
const DELETED: &str = "vm_deployer_vm_deleted_total";
const ERRORS: &str = "vm_deployer_errors_total";

/// A labelled family of monotonic counters
struct CounterVec {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    values: DashMap<Vec<String>, AtomicU64>,
}

impl CounterVec {
    fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            labels,
            values: DashMap::new(),
        }
    }

    fn inc(&self, values: &[&str]) {
        debug_assert_eq!(values.len(), self.labels.len());
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.values
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, values: &[&str]) -> u64 {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.values
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);

        let mut samples: Vec<(Vec<String>, u64)> = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        samples.sort();

        for (values, count) in samples {
            let labels: Vec<String> = self
                .labels
                .iter()
                .zip(values.iter())
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                .collect();
            let _ = writeln!(out, "{}{{{}}} {}", self.name, labels.join(","), count);
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Process-wide deployment counters
pub struct DeployerMetrics {
    created: CounterVec,
    deleted: CounterVec,
    errors: CounterVec,
}

impl DeployerMetrics {
    pub fn new() -> Self {
        Self {
            created: CounterVec::new(
                CREATED,
                "Total number of VMs created",
                &["node", "base_template", "vm_template"],
            ),
            deleted: CounterVec::new(DELETED, "Total number of VMs deleted", &["node"]),
            errors: CounterVec::new(ERRORS, "Total number of errors by handler", &["handler"]),
        }
    }

    pub fn record_created(&self, node: &str, base_template: &str, vm_template: &str) {
        self.created.inc(&[node, base_template, vm_template]);
    }

    pub fn record_deleted(&self, node: &str) {
        self.deleted.inc(&[node]);
    }

    pub fn record_error(&self, handler: &str) {
        self.errors.inc(&[handler]);
    }

    pub fn created(&self, node: &str, base_template: &str, vm_template: &str) -> u64 {
        self.created.get(&[node, base_template, vm_template])
    }

    pub fn deleted(&self, node: &str) -> u64 {
        self.deleted.get(&[node])
    }

    pub fn errors(&self, handler: &str) -> u64 {
        self.errors.get(&[handler])
    }

    /// Render every counter in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.created.render(&mut out);
        self.deleted.render(&mut out);
        self.errors.render(&mut out);
        out
    }
}

impl Default for DeployerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_accumulate() {
        let metrics = DeployerMetrics::new();
        metrics.record_created("hv1", "tmpl-a", "small");
        metrics.record_created("hv1", "tmpl-a", "small");
        metrics.record_deleted("hv2");

        assert_eq!(metrics.created("hv1", "tmpl-a", "small"), 2);
        assert_eq!(metrics.created("hv2", "tmpl-a", "small"), 0);
        assert_eq!(metrics.deleted("hv2"), 1);
    }

    #[test]
    fn test_render_is_sorted() {
        let metrics = DeployerMetrics::new();
        metrics.record_error("/api/v1/delete");
        metrics.record_error("/api/v1/create");
        metrics.record_error("/api/v1/create");

        let text = metrics.render();
        let create = text
            .find("vm_deployer_errors_total{handler=\"/api/v1/create\"} 2")
            .unwrap();
        let delete = text
            .find("vm_deployer_errors_total{handler=\"/api/v1/delete\"} 1")
            .unwrap();
        assert!(create < delete);
        assert!(text.contains("# TYPE vm_deployer_vm_created_total counter"));
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(DeployerMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_deleted("hv1");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.deleted("hv1"), 8000);
    }
}
