//! The provisioning pipeline
//!
//! One VM goes through: clone, configure, resize, start, optional reset,
//! address discovery and cluster registration. Every input is validated
//! into a [`Plan`] before the first remote call. Bulk runs repeat the
//! per-VM steps sequentially and record each VM's failure in its own result.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::error::ProvisionError;
use super::payload::{build_vm_config, Placement};
use super::request::{
    BatchResult, DeleteRequest, DeletionResult, ProvisioningRequest, ProvisioningResult, VmTarget,
    MAX_BATCH_COUNT,
};
use crate::config::{ClusterConfig, HypervisorNode, VmTemplate};
use crate::hypervisor::device::PRIMARY_DISK;
use crate::hypervisor::tasks::DEFAULT_POLL_INTERVAL;
use crate::hypervisor::{RemoteTask, TaskTracker, VmOperations};
use crate::metrics::DeployerMetrics;
use crate::network::{AddressResolver, DiscoverySettings};
use crate::registration::{ClusterRegistrar, JoinSubstitutions, ReadinessSettings};
use crate::reporting::{ErrorReporter, TracingReporter};
use crate::scheduling::{
    allocate_with_overrides, select_by_name, select_numa, select_weighted, CoreOverrides,
    CorePolicy, RandomSource, SchedulingError,
};

/// Length of the random suffix in generated VM names
pub const NAME_SUFFIX_LEN: usize = 6;

/// Every delay and retry budget used while provisioning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineTimings {
    pub task_poll_interval: Duration,
    pub reset_settle: Duration,
    pub discovery: DiscoverySettings,
    pub readiness: ReadinessSettings,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            task_poll_interval: DEFAULT_POLL_INTERVAL,
            reset_settle: Duration::from_secs(3),
            discovery: DiscoverySettings::default(),
            readiness: ReadinessSettings::default(),
        }
    }
}

/// A fully validated request, resolved against the topology
#[derive(Debug, Clone)]
pub struct Plan<'a> {
    pub node: &'a HypervisorNode,
    pub base_template: &'a str,
    pub base_template_id: u32,
    pub template: &'a VmTemplate,
    pub numa: Option<u32>,
    pub policy: CorePolicy,
    pub overrides: CoreOverrides,
    pub reset: bool,
}

/// `{template}-{suffix}-{id}-{random}`
pub fn generated_name(template: &str, node_suffix: &str, vmid: u32, random: &str) -> String {
    format!("{}-{}-{}-{}", template, node_suffix, vmid, random)
}

/// Drives VMs through their whole lifecycle
pub struct ProvisioningPipeline {
    cluster: Arc<ClusterConfig>,
    vms: Arc<dyn VmOperations>,
    tracker: TaskTracker,
    resolver: Arc<dyn AddressResolver>,
    registrar: Arc<dyn ClusterRegistrar>,
    random: Arc<RandomSource>,
    metrics: Arc<DeployerMetrics>,
    reporter: Arc<dyn ErrorReporter>,
    reset_settle: Duration,
}

impl ProvisioningPipeline {
    pub fn new(
        cluster: Arc<ClusterConfig>,
        vms: Arc<dyn VmOperations>,
        tracker: TaskTracker,
        resolver: Arc<dyn AddressResolver>,
        registrar: Arc<dyn ClusterRegistrar>,
    ) -> Self {
        Self {
            cluster,
            vms,
            tracker,
            resolver,
            registrar,
            random: Arc::new(RandomSource::from_entropy()),
            metrics: Arc::new(DeployerMetrics::new()),
            reporter: Arc::new(TracingReporter),
            reset_settle: PipelineTimings::default().reset_settle,
        }
    }

    pub fn with_random(mut self, random: Arc<RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DeployerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn metrics(&self) -> &Arc<DeployerMetrics> {
        &self.metrics
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Resolve and validate a request without touching the hypervisor.
    pub fn plan<'a>(&'a self, req: &ProvisioningRequest) -> Result<Plan<'a>, ProvisionError> {
        if req.base_template.is_empty() || req.vm_template.is_empty() {
            return Err(ProvisionError::Validation(
                "base_template and vm_template are required".to_string(),
            ));
        }
        if req.count == 0 {
            return Err(ProvisionError::Validation(
                "Invalid count parameter. Must be a positive integer".to_string(),
            ));
        }
        if req.count > MAX_BATCH_COUNT {
            return Err(ProvisionError::Validation(format!(
                "Invalid count parameter. Must not exceed {}",
                MAX_BATCH_COUNT
            )));
        }
        if req.is_bulk() && req.name.as_deref().is_some_and(|n| !n.is_empty()) {
            return Err(ProvisionError::Validation(
                "name cannot be set when count is greater than 1".to_string(),
            ));
        }

        let policy = CorePolicy::from_flags(req.phy_only, req.ht_only)?;

        let node = match req.node.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => select_by_name(&self.cluster.nodes, name)?,
            None => self
                .random
                .with_rng(|rng| select_weighted(&self.cluster.nodes, rng))
                .ok_or(SchedulingError::NoNodesAvailable)?,
        };

        let base = node.base_template(&req.base_template).ok_or_else(|| {
            ProvisionError::Validation(format!(
                "Invalid base_template: {} for node: {}",
                req.base_template, node.name
            ))
        })?;

        let template = self.cluster.vm_template(&req.vm_template).ok_or_else(|| {
            ProvisionError::Validation(format!("Invalid vm_template: {}", req.vm_template))
        })?;

        let numa = req.numa.or(template.numa);
        match numa {
            Some(id) if node.numa_node(id).is_none() => {
                return Err(SchedulingError::NumaNotFound {
                    node: node.name.clone(),
                    id,
                }
                .into());
            }
            None if node.numa.is_empty() => {
                return Err(SchedulingError::NoNumaNodes(node.name.clone()).into());
            }
            _ => {}
        }

        let overrides = if req.cores.is_empty() {
            CoreOverrides {
                phy: template.phy.clone(),
                ht: template.ht.clone(),
            }
        } else {
            req.cores.clone()
        };

        Ok(Plan {
            node,
            base_template: &base.name,
            base_template_id: base.id,
            template,
            numa,
            policy,
            overrides,
            reset: req.reset,
        })
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Provision a single VM, surfacing the first failure.
    pub async fn create(
        &self,
        req: &ProvisioningRequest,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningResult, ProvisionError> {
        let plan = self.plan(req)?;
        let mut result = ProvisioningResult {
            vm_id: 0,
            node: plan.node.name.clone(),
            name: String::new(),
            ip: None,
            role: None,
            reset: plan.reset,
            error: None,
        };

        let span = info_span!("provision", node = %plan.node.name, vm_template = %plan.template.name);
        self.provision_vm(&plan, req.name.as_deref(), &mut result, cancel)
            .instrument(span)
            .await?;
        Ok(result)
    }

    /// Provision `req.count` VMs one after another.
    ///
    /// Only validation errors fail the whole call; a failing VM is recorded
    /// in its own result and the loop moves on.
    pub async fn create_batch(
        &self,
        req: &ProvisioningRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ProvisionError> {
        let plan = self.plan(req)?;

        info!(
            "Starting bulk creation of {} VMs: node={}, base_template={}, vm_template={}",
            req.count, plan.node.name, plan.base_template, plan.template.name
        );

        let mut vms = Vec::new();
        for index in 1..=req.count {
            let mut result = ProvisioningResult {
                vm_id: 0,
                node: plan.node.name.clone(),
                name: String::new(),
                ip: None,
                role: None,
                reset: plan.reset,
                error: None,
            };

            if cancel.is_cancelled() {
                warn!("[VM {}] Skipped, request was cancelled", index);
                result.error = Some(ProvisionError::Cancelled.to_string());
                vms.push(result);
                continue;
            }

            let span = info_span!("vm", index = index, node = %plan.node.name);
            let outcome = self
                .provision_vm(&plan, None, &mut result, cancel)
                .instrument(span)
                .await;

            if let Err(e) = outcome {
                warn!("[VM {}] Provisioning failed: {}", index, e);
                self.reporter.report("bulk create", &e);
                result.error = Some(e.to_string());
            }
            vms.push(result);
        }

        let batch = BatchResult::new(vms);
        info!(
            "Bulk VM creation completed: {} requested, {} failed",
            batch.count,
            batch.failures()
        );
        Ok(batch)
    }

    fn ensure_active(cancel: &CancellationToken) -> Result<(), ProvisionError> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        Ok(())
    }

    async fn track(
        &self,
        node: &str,
        task: RemoteTask,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.tracker.track(node, &task, cancel).await?;
        Ok(())
    }

    /// Steps 3 to 12 for one VM. `result` is filled in as identity becomes
    /// known so partial progress survives a failure.
    async fn provision_vm(
        &self,
        plan: &Plan<'_>,
        name: Option<&str>,
        result: &mut ProvisioningResult,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let node = plan.node.name.as_str();
        let template = plan.template;

        Self::ensure_active(cancel)?;
        let vmid = self
            .vms
            .next_id()
            .await
            .map_err(ProvisionError::remote("get VM id"))?;
        result.vm_id = vmid;

        let name = match name.filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => generated_name(
                &template.name,
                &plan.node.suffix,
                vmid,
                &self.random.alphanumeric(NAME_SUFFIX_LEN),
            ),
        };
        result.name = name.clone();

        info!(
            "Starting VM creation: node={}, base_template={}, vm_template={}, vm_name={}",
            node, plan.base_template, template.name, name
        );

        Self::ensure_active(cancel)?;
        let task = self
            .vms
            .clone_vm(node, plan.base_template_id, vmid, &name)
            .await
            .map_err(ProvisionError::remote("clone VM"))?;
        self.track(node, task, cancel).await?;

        let current = match self.vms.vm_config(node, vmid).await {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to get current VM config: {}", e);
                None
            }
        };
        let numa = self
            .random
            .with_rng(|rng| select_numa(plan.node, plan.numa, rng))?;
        let placement = Placement {
            numa_id: numa.id,
            affinity: allocate_with_overrides(numa, plan.policy, &plan.overrides, template.cpu),
        };
        let fields = build_vm_config(template, plan.node, &placement, current.as_ref());
        Self::ensure_active(cancel)?;
        let task = self
            .vms
            .configure_vm(node, vmid, &fields)
            .await
            .map_err(ProvisionError::remote("configure VM"))?;
        self.track(node, task, cancel).await?;

        Self::ensure_active(cancel)?;
        let task = self
            .vms
            .resize_disk(node, vmid, PRIMARY_DISK, template.disk)
            .await
            .map_err(ProvisionError::remote("resize disk"))?;
        self.track(node, task, cancel).await?;

        Self::ensure_active(cancel)?;
        let task = self
            .vms
            .start_vm(node, vmid)
            .await
            .map_err(ProvisionError::remote("start VM"))?;
        self.track(node, task, cancel).await?;

        if plan.reset {
            info!("Reset requested for VM: id={}, node={}, name={}", vmid, node, name);
            tokio::select! {
                _ = tokio::time::sleep(self.reset_settle) => {}
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            }
            let task = self
                .vms
                .reset_vm(node, vmid)
                .await
                .map_err(ProvisionError::remote("reset VM"))?;
            self.track(node, task, cancel).await?;
            info!("VM reset successful: id={}, node={}, name={}", vmid, node, name);
        }

        let ip = self.resolver.resolve(node, vmid, cancel).await?;
        info!("VM IP address obtained: {}", ip);
        result.ip = Some(ip);

        self.register(plan, &name, ip, cancel).await?;

        info!(
            "VM creation and registration successful: id={}, node={}, name={}, ip={}, role={}",
            vmid, node, name, ip, template.role
        );
        self.metrics
            .record_created(node, plan.base_template, &template.name);
        result.role = Some(template.role);
        Ok(())
    }

    async fn register(
        &self,
        plan: &Plan<'_>,
        name: &str,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let template = plan.template;
        let subs = JoinSubstitutions {
            role: template.role,
            vm_name: name.to_string(),
            node: plan.node.name.clone(),
            vm_template: template.name.clone(),
            cpu: template.cpu_model.clone().unwrap_or_default(),
            memory: template.memory,
            suffix: plan.node.suffix.clone(),
            cpu_cores: template.cpu,
            disk: template.disk.to_string(),
            vm_ip: ip,
        };

        let document = self.registrar.generate_config(&subs).await?;
        info!("Waiting for node {} to accept registration", ip);
        self.registrar.wait_ready(ip, cancel).await?;
        self.registrar.apply(ip, &document).await?;
        Ok(())
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Find the node and id of the VM a delete request targets.
    pub async fn locate(&self, target: &VmTarget) -> Result<(String, u32), ProvisionError> {
        match target {
            VmTarget::Id { node, vm_id } => Ok((node.clone(), *vm_id)),
            VmTarget::Name(name) => {
                for node in &self.cluster.nodes {
                    match self.vms.find_vm_by_name(&node.name, name).await {
                        Ok(Some(vmid)) => return Ok((node.name.clone(), vmid)),
                        Ok(None) => {}
                        Err(e) => warn!("VM lookup on node {} failed: {}", node.name, e),
                    }
                }
                Err(ProvisionError::Validation(format!(
                    "VM with name {} not found on any node",
                    name
                )))
            }
        }
    }

    /// Stop and delete a VM.
    pub async fn delete(
        &self,
        req: &DeleteRequest,
        cancel: &CancellationToken,
    ) -> Result<DeletionResult, ProvisionError> {
        let (node, vmid) = self.locate(&req.target).await?;

        info!(
            "Starting VM deletion: node={}, vm_id={}, stop_method={}",
            node, vmid, req.stop_method
        );

        let task = self
            .vms
            .stop_vm(&node, vmid, req.stop_method)
            .await
            .map_err(ProvisionError::remote("stop VM"))?;
        if task.is_completed() {
            info!("VM stop completed synchronously");
        }
        self.track(&node, task, cancel).await?;

        let task = self
            .vms
            .delete_vm(&node, vmid)
            .await
            .map_err(ProvisionError::remote("delete VM"))?;
        self.track(&node, task, cancel).await?;

        info!("VM deleted successfully: node={}, vm_id={}", node, vmid);
        self.metrics.record_deleted(&node);
        Ok(DeletionResult { node, vm_id: vmid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockHypervisor;
    use crate::hypervisor::{StopMethod, TaskStatus};
    use crate::network::IpDiscoverer;
    use crate::registration::mock::MockRegistrar;
    use crate::reporting::mock::CollectingReporter;

    const TOPOLOGY: &str = r#"
nodes:
  - name: hv1
    weight: 1
    suffix: a
    ht: true
    hugepages: true
    numa:
      - id: 0
        cores: { phy: "0-3", ht: "16-19" }
      - id: 1
        cores: { phy: "4-7", ht: "20-23" }
    base_templates:
      - { name: tmpl-a, id: 9000 }
  - name: hv2
    weight: 3
    suffix: b
    numa:
      - id: 0
        cores: { phy: "0-7", ht: "" }
    base_templates:
      - { name: tmpl-a, id: 9100 }
vm_templates:
  - { name: small, cpu: 2, memory: 2048, disk: 20, role: worker }
  - { name: cp, cpu: 4, memory: 8192, disk: 40, role: controlplane, numa: 1, phy: "4-5" }
"#;

    struct Harness {
        hv: Arc<MockHypervisor>,
        registrar: Arc<MockRegistrar>,
        reporter: Arc<CollectingReporter>,
        pipeline: ProvisioningPipeline,
    }

    fn harness_with(hv: MockHypervisor, registrar: MockRegistrar) -> Harness {
        let cluster = Arc::new(ClusterConfig::from_str(TOPOLOGY).unwrap());
        let hv = Arc::new(hv);
        let registrar = Arc::new(registrar);
        let reporter = Arc::new(CollectingReporter::default());
        let tracker = TaskTracker::new(hv.clone()).with_poll_interval(Duration::from_millis(1));
        let resolver = Arc::new(IpDiscoverer::new(hv.clone()).with_settings(DiscoverySettings {
            attempts: 3,
            delay: Duration::from_millis(1),
        }));
        let pipeline = ProvisioningPipeline::new(cluster, hv.clone(), tracker, resolver, registrar.clone())
            .with_random(Arc::new(RandomSource::seeded(7)))
            .with_reporter(reporter.clone())
            .with_reset_settle(Duration::from_millis(1));
        Harness {
            hv,
            registrar,
            reporter,
            pipeline,
        }
    }

    fn harness() -> Harness {
        harness_with(MockHypervisor::new(100), MockRegistrar::new())
    }

    fn is_generated_name(name: &str, prefix: &str) -> bool {
        name.strip_prefix(prefix).is_some_and(|rest| {
            rest.len() == NAME_SUFFIX_LEN
                && rest
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
    }

    #[test]
    fn test_generated_name() {
        assert_eq!(generated_name("small", "a", 100, "x1y2z3"), "small-a-100-x1y2z3");
    }

    #[test]
    fn test_plan_validation_errors() {
        let h = harness();
        let cases = vec![
            ProvisioningRequest::new("", "small"),
            ProvisioningRequest::new("tmpl-a", "small").with_count(0),
            ProvisioningRequest::new("tmpl-a", "small").with_count(MAX_BATCH_COUNT + 1),
            ProvisioningRequest::new("tmpl-a", "small").with_count(u32::MAX),
            ProvisioningRequest::new("tmpl-a", "small").with_node("hv9"),
            ProvisioningRequest::new("tmpl-b", "small").with_node("hv1"),
            ProvisioningRequest::new("tmpl-a", "huge").with_node("hv1"),
            ProvisioningRequest::new("tmpl-a", "small")
                .with_name("x")
                .with_count(2),
            ProvisioningRequest {
                numa: Some(5),
                ..ProvisioningRequest::new("tmpl-a", "small").with_node("hv1")
            },
        ];
        for req in cases {
            let err = h.pipeline.plan(&req).unwrap_err();
            assert!(err.is_client_error(), "{:?} -> {:?}", req, err);
        }
    }

    #[test]
    fn test_plan_template_overrides_and_request_precedence() {
        let h = harness();
        let req = ProvisioningRequest::new("tmpl-a", "cp").with_node("hv1");
        let plan = h.pipeline.plan(&req).unwrap();
        assert_eq!(plan.numa, Some(1));
        assert_eq!(plan.overrides.phy.as_deref(), Some("4-5"));

        let req = ProvisioningRequest {
            numa: Some(0),
            cores: CoreOverrides {
                phy: Some("0-1".to_string()),
                ht: None,
            },
            ..ProvisioningRequest::new("tmpl-a", "cp").with_node("hv1")
        };
        let plan = h.pipeline.plan(&req).unwrap();
        assert_eq!(plan.numa, Some(0));
        assert_eq!(plan.overrides.phy.as_deref(), Some("0-1"));
    }

    #[tokio::test]
    async fn test_conflicting_flags_make_no_remote_calls() {
        let h = harness();
        let req = ProvisioningRequest {
            phy_only: true,
            ht_only: true,
            ..ProvisioningRequest::new("tmpl-a", "small").with_node("hv1")
        };
        let err = h
            .pipeline
            .create(&req, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ProvisionError::Validation(
                "Both phy_only and ht_only cannot be set at the same time".to_string()
            )
        );
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_single_vm() {
        let h = harness();
        let req = ProvisioningRequest::new("tmpl-a", "small").with_node("hv1");

        let result = h
            .pipeline
            .create(&req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.vm_id, 100);
        assert_eq!(result.node, "hv1");
        assert!(is_generated_name(&result.name, "small-a-100-"), "{}", result.name);
        assert_eq!(result.role, Some(crate::config::Role::Worker));
        assert_eq!(result.ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!result.reset);
        assert_eq!(h.pipeline.metrics().created("hv1", "tmpl-a", "small"), 1);

        let calls = h.hv.calls();
        assert_eq!(calls[0], format!("clone hv1 9000 100 {}", result.name));
        assert!(calls[1].starts_with("configure hv1 100 cpu=x86-64-v3&cores=2&memory=2048&hugepages=2&numa=1"));
        assert_eq!(calls[2], "resize hv1 100 virtio0 20G");
        assert_eq!(calls[3], "start hv1 100");
        assert_eq!(calls.len(), 4);

        assert_eq!(
            h.registrar.calls(),
            vec![
                format!("generate {} worker", result.name),
                "wait 10.0.0.5".to_string(),
                "apply 10.0.0.5".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_explicit_name_and_reset() {
        let h = harness();
        let req = ProvisioningRequest::new("tmpl-a", "cp")
            .with_node("hv1")
            .with_name("cp-1")
            .with_reset(true);

        let result = h
            .pipeline
            .create(&req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.name, "cp-1");
        assert!(result.reset);
        let calls = h.hv.calls();
        assert!(calls[1].contains("affinity=4-5"));
        assert!(calls[1].ends_with("numa0=cpus=0-3,memory=8192,hostnodes=1,policy=bind"));
        assert_eq!(calls[4], "reset hv1 100");
    }

    #[tokio::test]
    async fn test_failed_task_aborts() {
        let h = harness();
        h.hv.push_statuses(vec![Ok(TaskStatus::Stopped {
            exit_status: "clone failed: no space".to_string(),
        })]);
        let req = ProvisioningRequest::new("tmpl-a", "small").with_node("hv1");

        let err = h
            .pipeline
            .create(&req, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::TaskFailed(_)));
        assert_eq!(h.hv.calls().len(), 1);
        assert!(h.registrar.calls().is_empty());
    }

    #[tokio::test]
    async fn test_registration_timeout() {
        let h = harness_with(MockHypervisor::new(100), MockRegistrar::never_ready());
        let req = ProvisioningRequest::new("tmpl-a", "small").with_node("hv1");

        let err = h
            .pipeline
            .create(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::RegistrationTimeout(_)));
        assert_eq!(h.pipeline.metrics().created("hv1", "tmpl-a", "small"), 0);
    }

    #[tokio::test]
    async fn test_bulk_isolates_failures() {
        let h = harness();
        h.hv.fail_clone_of(101);
        let req = ProvisioningRequest::new("tmpl-a", "small")
            .with_node("hv1")
            .with_count(3);

        let batch = h
            .pipeline
            .create_batch(&req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch.count, 3);
        assert_eq!(batch.failures(), 1);
        assert_eq!(
            batch.vms.iter().map(|v| v.vm_id).collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
        assert!(batch.vms[0].error.is_none());
        assert!(batch.vms[1]
            .error
            .as_deref()
            .unwrap()
            .starts_with("failed to clone VM"));
        assert!(batch.vms[1].ip.is_none());
        assert!(batch.vms[2].error.is_none());
        assert_eq!(batch.vms[2].ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(h.reporter.reports().len(), 1);
        assert_eq!(h.pipeline.metrics().created("hv1", "tmpl-a", "small"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_during_reset_settle() {
        let h = harness();
        let pipeline = h.pipeline.with_reset_settle(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let req = ProvisioningRequest::new("tmpl-a", "small")
            .with_node("hv1")
            .with_reset(true);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = pipeline.create(&req, &cancel).await.unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled);
        assert!(!h.hv.calls().iter().any(|c| c.starts_with("reset")));
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected_before_remote_calls() {
        let h = harness();
        let req = ProvisioningRequest::new("tmpl-a", "small")
            .with_node("hv1")
            .with_count(u32::MAX);

        let err = h
            .pipeline
            .create_batch(&req, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_client_error());
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_batch_makes_no_remote_calls() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = ProvisioningRequest::new("tmpl-a", "small")
            .with_node("hv1")
            .with_count(5);

        let batch = h.pipeline.create_batch(&req, &cancel).await.unwrap();

        assert_eq!(batch.count, 5);
        assert_eq!(batch.failures(), 5);
        assert!(batch.vms.iter().all(|vm| vm.vm_id == 0
            && vm.error.as_deref() == Some("operation was cancelled")));
        assert!(h.hv.calls().is_empty());
        assert_eq!(h.pipeline.metrics().created("hv1", "tmpl-a", "small"), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_skips_remaining_vms() {
        let h = harness();
        let pipeline = h.pipeline.with_reset_settle(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let req = ProvisioningRequest::new("tmpl-a", "small")
            .with_node("hv1")
            .with_reset(true)
            .with_count(3);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let batch = pipeline.create_batch(&req, &cancel).await.unwrap();

        assert_eq!(batch.failures(), 3);
        assert_eq!(batch.vms[0].vm_id, 100);
        assert_eq!(batch.vms[1].vm_id, 0);
        assert_eq!(batch.vms[2].vm_id, 0);
        let clones = h.hv.calls().iter().filter(|c| c.starts_with("clone")).count();
        assert_eq!(clones, 1);
        assert!(!h.hv.calls().iter().any(|c| c.contains(" 101")));
    }

    #[tokio::test]
    async fn test_cancelled_single_create_makes_no_remote_calls() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = ProvisioningRequest::new("tmpl-a", "small").with_node("hv1");

        let err = h.pipeline.create(&req, &cancel).await.unwrap_err();

        assert_eq!(err, ProvisionError::Cancelled);
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_name_searches_nodes_in_order() {
        let h = harness();
        h.hv.add_vm("hv2", "small-b-200-abcdef", 200);
        let req = DeleteRequest {
            target: VmTarget::Name("small-b-200-abcdef".to_string()),
            stop_method: StopMethod::Stop,
        };

        let result = h
            .pipeline
            .delete(&req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result,
            DeletionResult {
                node: "hv2".to_string(),
                vm_id: 200
            }
        );
        assert_eq!(
            h.hv.calls(),
            vec![
                "find hv1 small-b-200-abcdef",
                "find hv2 small-b-200-abcdef",
                "stop hv2 200",
                "delete hv2 200"
            ]
        );
        assert_eq!(h.pipeline.metrics().deleted("hv2"), 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_name() {
        let h = harness();
        let req = DeleteRequest {
            target: VmTarget::Name("ghost".to_string()),
            stop_method: StopMethod::Shutdown,
        };

        let err = h
            .pipeline
            .delete(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(!h.hv.calls().iter().any(|c| c.starts_with("shutdown")));
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let h = harness();
        let req = DeleteRequest {
            target: VmTarget::Id {
                node: "hv1".to_string(),
                vm_id: 150,
            },
            stop_method: StopMethod::Shutdown,
        };

        h.pipeline
            .delete(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.hv.calls(), vec!["shutdown hv1 150", "delete hv1 150"]);
    }

    #[test]
    fn test_weighted_node_when_unspecified() {
        let h = harness();
        let req = ProvisioningRequest::new("tmpl-a", "small");
        let mut hv2 = 0;
        for _ in 0..400 {
            if h.pipeline.plan(&req).unwrap().node.name == "hv2" {
                hv2 += 1;
            }
        }
        assert!((250..350).contains(&hv2), "hv2 chosen {} times", hv2);
    }
}
