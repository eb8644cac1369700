//! Scale set guard jobs and the watchdog facade

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use lattice_common::crd::AzureCluster;
use lattice_common::Error;
use tracing::{info, instrument, warn};

use super::{Job, WatchdogConfig, WorkerPool};
use crate::cloud::{NodeRole, VmssClient, VmssInstance};

/// Outcome of guarding one scale set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmssHealthReport {
    /// Resource group of the scale set
    pub resource_group: String,
    /// Scale set name
    pub scale_set: String,
    /// Instances that provisioned successfully
    pub succeeded: Vec<String>,
    /// Instances whose provisioning failed or was canceled
    pub failed: Vec<String>,
}

impl VmssHealthReport {
    /// No instance failed
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Callback receiving a scale set health report
pub type ReportHandler = Arc<dyn Fn(VmssHealthReport) + Send + Sync>;

/// Polls a scale set until every instance reached a final provisioning state
pub struct VmssGuardJob {
    id: String,
    resource_group: String,
    scale_set: String,
    client: Arc<dyn VmssClient>,
    instances: Option<Vec<VmssInstance>>,
    on_finished: Option<ReportHandler>,
}

impl VmssGuardJob {
    /// Guard `scale_set` in `resource_group`
    pub fn new(resource_group: &str, scale_set: &str, client: Arc<dyn VmssClient>) -> Self {
        Self {
            id: job_id(resource_group, scale_set),
            resource_group: resource_group.to_string(),
            scale_set: scale_set.to_string(),
            client,
            instances: None,
            on_finished: None,
        }
    }

    /// Callback receiving the final report
    pub fn on_report(mut self, handler: ReportHandler) -> Self {
        self.on_finished = Some(handler);
        self
    }

    fn report(&self) -> VmssHealthReport {
        let mut report = VmssHealthReport {
            resource_group: self.resource_group.clone(),
            scale_set: self.scale_set.clone(),
            ..Default::default()
        };
        for instance in self.instances.iter().flatten() {
            if instance.provisioning_state.is_failure() {
                report.failed.push(instance.instance_id.clone());
            } else {
                report.succeeded.push(instance.instance_id.clone());
            }
        }
        report
    }
}

impl fmt::Debug for VmssGuardJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmssGuardJob")
            .field("id", &self.id)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for VmssGuardJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self) -> Result<(), Error> {
        let instances = self
            .client
            .list_instances(&self.resource_group, &self.scale_set)
            .await
            .map_err(|e| e.into_error("vmss.list_instances"))?;

        for instance in instances.iter().filter(|i| i.provisioning_state.is_failure()) {
            warn!(
                scale_set = %self.id,
                instance = %instance.instance_id,
                state = %instance.provisioning_state,
                "scale set instance failed to provision"
            );
        }

        self.instances = Some(instances);
        Ok(())
    }

    fn finished(&self) -> bool {
        self.instances
            .as_ref()
            .is_some_and(|instances| instances.iter().all(|i| i.provisioning_state.is_final()))
    }

    fn on_finished(self: Box<Self>) {
        let report = self.report();
        info!(
            scale_set = %self.id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "scale set settled"
        );
        if let Some(handler) = &self.on_finished {
            handler(report);
        }
    }
}

fn job_id(resource_group: &str, scale_set: &str) -> String {
    format!("{}/{}", resource_group, scale_set)
}

/// Starts guard jobs for scale sets on a shared [`WorkerPool`]
pub struct InstanceWatchdog {
    pool: WorkerPool,
    client: Arc<dyn VmssClient>,
    on_report: Option<ReportHandler>,
}

impl InstanceWatchdog {
    /// Start the worker pool
    pub fn start(client: Arc<dyn VmssClient>, config: &WatchdogConfig) -> Result<Self, Error> {
        Ok(Self {
            pool: WorkerPool::start(config)?,
            client,
            on_report: None,
        })
    }

    /// Receive the health report of every guarded scale set
    pub fn with_report_handler(mut self, handler: ReportHandler) -> Self {
        self.on_report = Some(handler);
        self
    }

    /// Guard a scale set until it settles; a no-op if already guarded
    pub fn guard_vmss(&self, resource_group: &str, scale_set: &str) -> bool {
        let mut job = VmssGuardJob::new(resource_group, scale_set, Arc::clone(&self.client));
        if let Some(handler) = &self.on_report {
            job = job.on_report(Arc::clone(handler));
        }
        self.pool.enqueue_job(Box::new(job))
    }

    /// Whether a scale set is currently guarded
    pub fn is_guarded(&self, resource_group: &str, scale_set: &str) -> bool {
        self.pool.is_active(&job_id(resource_group, scale_set))
    }

    /// Stop accepting work
    pub fn stop(&self) {
        self.pool.stop();
    }

    /// Stop and wait for the workers
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Cluster resource that guards the master and worker scale sets
pub struct InstanceGuardResource {
    watchdog: Arc<InstanceWatchdog>,
}

impl InstanceGuardResource {
    /// Guard scale sets through `watchdog`
    pub fn new(watchdog: Arc<InstanceWatchdog>) -> Self {
        Self { watchdog }
    }

    /// Resource name used in logs and pass outcomes
    pub fn name(&self) -> &str {
        "instanceguard"
    }

    /// Scale set names of a cluster, one per node role
    pub fn scale_sets(cluster: &AzureCluster) -> Vec<String> {
        NodeRole::ALL
            .iter()
            .map(|role| format!("{}-{}", cluster.cluster_id(), role))
            .collect()
    }

    /// Make sure both scale sets are guarded
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    pub async fn ensure_created(&self, cluster: &AzureCluster) -> Result<(), Error> {
        let resource_group = cluster.resource_group();
        for scale_set in Self::scale_sets(cluster) {
            if self.watchdog.guard_vmss(&resource_group, &scale_set) {
                info!(scale_set = %scale_set, "guarding scale set");
            }
        }
        Ok(())
    }

    /// Scale sets go away with their resource group
    pub async fn ensure_deleted(&self, _cluster: &AzureCluster) -> Result<(), Error> {
        Ok(())
    }
}
