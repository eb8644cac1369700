//! AzureCluster reconciliation driver
//!
//! A [`ResourceSet`] runs its resources in a fixed order over one pass.
//! Each pass starts from a fresh [`ReconciliationContext`]; a resource that
//! finds something not ready yet cancels the rest of the pass, and the
//! controller requeues the cluster to try again later.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use lattice_common::crd::{AzureCluster, ClusterPhase};
use lattice_common::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::blob_object::{storage_account_name, BlobObjectResource};
use crate::cloud::{
    CloudConfigRenderer, DeploymentsClient, ObjectStorage, TemplateSource, VmssClient,
};
use crate::config::OperatorConfig;
use crate::context::{ReconciliationContext, StorageContainer};
use crate::deployment::{DeploymentOrchestrator, MainDeployment};
use crate::resource::{reconcile_deletion, reconcile_state, StateResource};
use crate::status::{update_status, ClusterStatusStore};
use crate::watchdog::{InstanceGuardResource, InstanceWatchdog, WatchdogConfig};

/// A resource managed on behalf of a cluster
pub enum ClusterResource {
    /// The cluster network deployment
    Deployment(DeploymentOrchestrator),
    /// Rendered node boot configuration
    BlobObject(BlobObjectResource),
    /// Scale set health guards
    InstanceGuard(InstanceGuardResource),
}

impl ClusterResource {
    /// Resource name used in logs and pass outcomes
    pub fn name(&self) -> &str {
        match self {
            Self::Deployment(d) => d.name(),
            Self::BlobObject(b) => b.name(),
            Self::InstanceGuard(g) => g.name(),
        }
    }

    /// Converge the resource towards its desired state
    pub async fn ensure_created(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<(), Error> {
        match self {
            Self::Deployment(d) => d.ensure_created(cluster, ctx).await.map(|_| ()),
            Self::BlobObject(b) => reconcile_state(b, cluster, ctx).await.map(|_| ()),
            Self::InstanceGuard(g) => g.ensure_created(cluster).await,
        }
    }

    /// Tear the resource down as part of cluster deletion
    pub async fn ensure_deleted(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<(), Error> {
        match self {
            Self::Deployment(d) => d.ensure_deleted(cluster, ctx).await,
            Self::BlobObject(b) => reconcile_deletion(b, cluster, ctx).await,
            Self::InstanceGuard(g) => g.ensure_deleted(cluster).await,
        }
    }
}

/// How a pass ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every resource ran
    Completed,
    /// A resource stopped the pass because something was not ready
    Canceled {
        /// Resource that canceled
        resource: String,
        /// Why it canceled
        reason: String,
    },
}

struct StorageBinding {
    client: Arc<dyn ObjectStorage>,
    container: String,
}

/// Ordered resources reconciled together for each cluster
pub struct ResourceSet {
    resources: Vec<ClusterResource>,
    storage: Option<StorageBinding>,
    cloud_config: Option<Arc<dyn CloudConfigRenderer>>,
}

impl ResourceSet {
    /// Create a builder
    pub fn builder() -> ResourceSetBuilder {
        ResourceSetBuilder::default()
    }

    /// Names of the resources, in run order
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(ClusterResource::name).collect()
    }

    /// Fresh context for one pass over `cluster`
    pub fn new_context(&self, cluster: &AzureCluster) -> ReconciliationContext {
        let mut ctx = ReconciliationContext::new();
        if let Some(storage) = &self.storage {
            ctx.set_storage_container(StorageContainer {
                account: storage_account_name(&cluster.cluster_id()),
                container: storage.container.clone(),
                client: Arc::clone(&storage.client),
            });
        }
        if let Some(renderer) = &self.cloud_config {
            ctx.set_cloud_config(Arc::clone(renderer));
        }
        ctx
    }

    /// Run one pass, stopping at the first resource that cancels it
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    pub async fn reconcile(&self, cluster: &AzureCluster) -> Result<PassOutcome, Error> {
        let mut ctx = self.new_context(cluster);

        for resource in &self.resources {
            debug!(resource = %resource.name(), "ensuring resource");
            if let Err(e) = resource.ensure_created(cluster, &mut ctx).await {
                warn!(resource = %resource.name(), error = %e, "resource failed");
                return Err(e);
            }

            if let Some(reason) = ctx.cancel_reason() {
                info!(resource = %resource.name(), reason = %reason, "pass canceled");
                return Ok(PassOutcome::Canceled {
                    resource: resource.name().to_string(),
                    reason: reason.to_string(),
                });
            }
        }

        debug!("pass completed");
        Ok(PassOutcome::Completed)
    }

    /// Tear down every resource, in reverse order
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    pub async fn reconcile_deletion(&self, cluster: &AzureCluster) -> Result<(), Error> {
        let mut ctx = self.new_context(cluster);
        for resource in self.resources.iter().rev() {
            resource.ensure_deleted(cluster, &mut ctx).await?;
        }
        info!("cluster resources released");
        Ok(())
    }
}

/// Builder for [`ResourceSet`]
#[derive(Default)]
pub struct ResourceSetBuilder {
    resources: Vec<ClusterResource>,
    storage: Option<StorageBinding>,
    cloud_config: Option<Arc<dyn CloudConfigRenderer>>,
}

impl ResourceSetBuilder {
    /// Append a resource; resources run in the order they were added
    pub fn resource(mut self, resource: ClusterResource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Blob storage attached to every pass context
    pub fn storage(
        mut self,
        client: Arc<dyn ObjectStorage>,
        container: impl Into<String>,
    ) -> Self {
        self.storage = Some(StorageBinding {
            client,
            container: container.into(),
        });
        self
    }

    /// Boot configuration renderer attached to every pass context
    pub fn cloud_config(mut self, renderer: Arc<dyn CloudConfigRenderer>) -> Self {
        self.cloud_config = Some(renderer);
        self
    }

    /// Build the set
    pub fn build(self) -> ResourceSet {
        ResourceSet {
            resources: self.resources,
            storage: self.storage,
            cloud_config: self.cloud_config,
        }
    }
}

/// Cloud gateway handles the controller works through
#[derive(Clone)]
pub struct CloudClients {
    /// Template deployments
    pub deployments: Arc<dyn DeploymentsClient>,
    /// Blob storage for node boot configuration
    pub storage: Arc<dyn ObjectStorage>,
    /// Scale set instance listing
    pub vmss: Arc<dyn VmssClient>,
    /// Deployment template documents
    pub templates: Arc<dyn TemplateSource>,
    /// Node boot configuration renderer
    pub cloud_config: Arc<dyn CloudConfigRenderer>,
}

/// Shared state of the AzureCluster controller
pub struct Context {
    /// Resources reconciled for every cluster
    pub resources: ResourceSet,
    /// Where cluster status is written
    pub status: Arc<dyn ClusterStatusStore>,
    /// Operator configuration
    pub config: OperatorConfig,
    watchdog: Option<Arc<InstanceWatchdog>>,
}

impl Context {
    /// Create a controller context around an already assembled resource set
    pub fn new(
        resources: ResourceSet,
        status: Arc<dyn ClusterStatusStore>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            resources,
            status,
            config,
            watchdog: None,
        }
    }

    /// Assemble the standard resources from configuration.
    ///
    /// Resources run as network deployment, boot configuration objects, then
    /// scale set guards. Starts the instance watchdog, so this must be called
    /// inside a tokio runtime.
    pub fn from_config(
        config: OperatorConfig,
        clients: CloudClients,
        status: Arc<dyn ClusterStatusStore>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let orchestrator = DeploymentOrchestrator::builder(
            clients.deployments,
            Arc::clone(&status),
            clients.templates,
        )
        .definition(Arc::new(MainDeployment::new(config.subnets)))
        .status_retry(config.status_retry())
        .build();

        let watchdog = Arc::new(InstanceWatchdog::start(
            clients.vmss,
            &WatchdogConfig::from(&config),
        )?);

        let resources = ResourceSet::builder()
            .resource(ClusterResource::Deployment(orchestrator))
            .resource(ClusterResource::BlobObject(BlobObjectResource::new()))
            .resource(ClusterResource::InstanceGuard(InstanceGuardResource::new(
                Arc::clone(&watchdog),
            )))
            .storage(clients.storage, config.storage_container.clone())
            .cloud_config(clients.cloud_config)
            .build();

        Ok(Self {
            resources,
            status,
            config,
            watchdog: Some(watchdog),
        })
    }

    /// Stop the instance watchdog, if this context started one, and wait for
    /// its workers
    pub async fn shutdown(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.shutdown().await;
        }
    }
}

/// Reconcile an AzureCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<AzureCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        ctx.resources.reconcile_deletion(&cluster).await?;
        return Ok(Action::await_change());
    }

    let outcome = match ctx.resources.reconcile(&cluster).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if !e.is_retryable() {
                let message = e.to_string();
                let failed = set_phase(&ctx, &name, ClusterPhase::Failed, Some(message)).await;
                if let Err(status_err) = failed {
                    warn!(error = %status_err, "failed to record Failed phase");
                }
            }
            return Err(e);
        }
    };

    match outcome {
        PassOutcome::Completed => {
            set_phase(&ctx, &name, ClusterPhase::Ready, None).await?;
            Ok(Action::requeue(ctx.config.ready_requeue))
        }
        PassOutcome::Canceled { resource, reason } => {
            let message = format!("waiting on {}: {}", resource, reason);
            set_phase(&ctx, &name, ClusterPhase::Provisioning, Some(message)).await?;
            Ok(Action::requeue(ctx.config.not_ready_requeue))
        }
    }
}

/// Requeue policy for failed reconciliations
pub fn error_policy(cluster: Arc<AzureCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}

async fn set_phase(
    ctx: &Context,
    name: &str,
    phase: ClusterPhase,
    message: Option<String>,
) -> Result<bool, Error> {
    update_status(ctx.status.as_ref(), name, &ctx.config.status_retry(), |status| {
        if status.phase == phase && status.message == message {
            return false;
        }
        status.phase = phase.clone();
        status.message = message.clone();
        true
    })
    .await
}
