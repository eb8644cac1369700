//! Template deployment orchestration
//!
//! The orchestrator drives one named cloud deployment per cluster through
//! a small state machine, observed fresh on every pass:
//!
//! - **Absent**: submit the deployment as initial provisioning, persist the
//!   template and parameters checksums, cancel the pass.
//! - **In progress**: nothing to do but wait; cancel the pass.
//! - **Final**: publish the deployment outputs into the reconciliation
//!   context, then resubmit once if the template or parameters checksum
//!   differs from the persisted one. A failed deployment with unchanged
//!   content cancels the pass so the cluster never reads as ready.
//!
//! Persisted checksums live in the AzureCluster status so resubmission
//! decisions survive operator restarts.

mod checksum;
mod network;

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use lattice_common::crd::AzureCluster;
use lattice_common::retry::RetryConfig;
use lattice_common::Error;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

pub use checksum::{canonical_json, checksum};
pub use network::{MainDeployment, MAIN_TEMPLATE};

use crate::cloud::{
    DeploymentMode, DeploymentRequest, DeploymentsClient, ProvisioningState, TemplateSource,
};
use crate::config::OperatorConfig;
use crate::context::{ContextField, ReconciliationContext};
use crate::status::{get_resource_condition, set_resource_conditions, ClusterStatusStore};

/// Status condition holding the persisted template checksum
pub const TEMPLATE_CHECKSUM_CONDITION: &str = "DeploymentTemplateChecksum";
/// Status condition holding the persisted parameters checksum
pub const PARAMETERS_CHECKSUM_CONDITION: &str = "DeploymentParametersChecksum";
/// Parameter telling the template whether this is the first submission.
///
/// Added at submission time only; it never takes part in the parameters
/// checksum, so the switch from initial to follow-up submissions does not by
/// itself trigger a resubmission.
pub const INITIAL_PROVISIONING_PARAM: &str = "initialProvisioning";

/// Named deployment parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, Value>);

impl Parameters {
    /// No parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Apply overwrites; an overwrite wins over a computed value
    pub fn merge_overrides(&mut self, overrides: &BTreeMap<String, Value>) {
        for (name, value) in overrides {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Wire form: `{name: {"value": v}}`
    pub fn to_wire(&self) -> Value {
        let wrapped: Map<String, Value> = self
            .0
            .iter()
            .map(|(name, value)| {
                let mut entry = Map::new();
                entry.insert("value".to_string(), value.clone());
                (name.clone(), Value::Object(entry))
            })
            .collect();
        Value::Object(wrapped)
    }
}

/// Maps a deployment output onto a reconciliation context field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputBinding {
    /// Output name in the deployment
    pub output: &'static str,
    /// Context field the output value is written to
    pub field: ContextField,
}

impl OutputBinding {
    /// Bind `output` to `field`
    pub const fn new(output: &'static str, field: ContextField) -> Self {
        Self { output, field }
    }
}

/// What a deployment consists of for a given cluster
pub trait DeploymentDefinition: Send + Sync {
    /// Name of the cloud deployment
    fn deployment_name(&self, cluster: &AzureCluster) -> String;

    /// Name of the template in the [`TemplateSource`]
    fn template_name(&self) -> &str;

    /// Computed parameters, before spec overwrites are applied
    fn parameters(&self, cluster: &AzureCluster) -> Result<Parameters, Error>;

    /// Outputs published into the reconciliation context
    fn outputs(&self) -> &[OutputBinding];
}

/// A fully built deployment with its content checksums
#[derive(Clone, Debug, PartialEq)]
pub struct Deployment {
    /// Cloud deployment name
    pub name: String,
    /// Template document
    pub template: Value,
    /// Parameters, overwrites applied
    pub parameters: Parameters,
    /// Checksum of `template`
    pub template_checksum: String,
    /// Checksum of `parameters`
    pub parameters_checksum: String,
}

impl Deployment {
    /// Build a deployment and compute its checksums
    pub fn new(
        name: impl Into<String>,
        template: Value,
        parameters: Parameters,
    ) -> Result<Self, Error> {
        let template_checksum = checksum(&template)?;
        let parameters_checksum = checksum(&parameters)?;
        Ok(Self {
            name: name.into(),
            template,
            parameters,
            template_checksum,
            parameters_checksum,
        })
    }

    /// Submission body; `initial` marks the first submission
    pub fn request(&self, initial: bool) -> DeploymentRequest {
        let mut parameters = self.parameters.clone();
        parameters.insert(INITIAL_PROVISIONING_PARAM, if initial { "Yes" } else { "No" });
        DeploymentRequest {
            mode: DeploymentMode::Incremental,
            template: self.template.clone(),
            parameters: parameters.to_wire(),
        }
    }
}

/// What one `ensure_created` call did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentOutcome {
    /// A deployment was submitted and the pass canceled
    Submitted {
        /// Whether it was the first submission
        initial: bool,
    },
    /// The deployment is still running; the pass was canceled
    InProgress(ProvisioningState),
    /// The deployment ended Failed or Canceled and its content is unchanged;
    /// the pass was canceled
    Failed(ProvisioningState),
    /// The deployment succeeded and matches the persisted checksums
    UpToDate,
}

/// Drives a cluster's cloud deployment towards its desired content
pub struct DeploymentOrchestrator {
    deployments: Arc<dyn DeploymentsClient>,
    status: Arc<dyn ClusterStatusStore>,
    templates: Arc<dyn TemplateSource>,
    definition: Arc<dyn DeploymentDefinition>,
    status_retry: RetryConfig,
}

impl DeploymentOrchestrator {
    /// Create a builder; the definition defaults to [`MainDeployment`]
    pub fn builder(
        deployments: Arc<dyn DeploymentsClient>,
        status: Arc<dyn ClusterStatusStore>,
        templates: Arc<dyn TemplateSource>,
    ) -> DeploymentOrchestratorBuilder {
        DeploymentOrchestratorBuilder::new(deployments, status, templates)
    }

    /// Resource name used in logs and pass outcomes
    pub fn name(&self) -> &str {
        "deployment"
    }

    /// Build the deployment the cluster should have right now
    pub fn desired_deployment(&self, cluster: &AzureCluster) -> Result<Deployment, Error> {
        let template = self.templates.template(self.definition.template_name())?;
        let mut parameters = self.definition.parameters(cluster)?;
        parameters.merge_overrides(&cluster.spec.parameter_overrides);
        Deployment::new(self.definition.deployment_name(cluster), template, parameters)
    }

    /// Observe the deployment and advance it one step
    #[instrument(skip(self, cluster, ctx), fields(cluster = %cluster.name_any()))]
    pub async fn ensure_created(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<DeploymentOutcome, Error> {
        let resource_group = cluster.resource_group();
        let name = self.definition.deployment_name(cluster);

        let observed = match self.deployments.get(&resource_group, &name).await {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => {
                info!(deployment = %name, "deployment not found, submitting initial provisioning");
                let deployment = self.desired_deployment(cluster)?;
                self.submit(cluster, &deployment, true).await?;
                ctx.cancel_pass(format!("deployment {} submitted", name));
                return Ok(DeploymentOutcome::Submitted { initial: true });
            }
            Err(e) => return Err(e.into_error("deployments.get")),
        };

        let state = observed.provisioning_state;
        if !state.is_final() {
            info!(deployment = %name, state = %state, "deployment in progress");
            ctx.cancel_pass(format!("deployment {} is {}", name, state));
            return Ok(DeploymentOutcome::InProgress(state));
        }

        if state.is_failure() {
            warn!(
                deployment = %name,
                state = %state,
                outputs = %observed.outputs,
                "deployment ended unsuccessfully"
            );
        }

        self.publish_outputs(&name, &observed.outputs, ctx);

        let deployment = self.desired_deployment(cluster)?;
        let cluster_name = cluster.name_any();
        let stored_template = get_resource_condition(
            self.status.as_ref(),
            &cluster_name,
            &name,
            TEMPLATE_CHECKSUM_CONDITION,
        )
        .await?;
        let stored_parameters = get_resource_condition(
            self.status.as_ref(),
            &cluster_name,
            &name,
            PARAMETERS_CHECKSUM_CONDITION,
        )
        .await?;

        let template_changed =
            stored_template.as_deref() != Some(deployment.template_checksum.as_str());
        let parameters_changed =
            stored_parameters.as_deref() != Some(deployment.parameters_checksum.as_str());

        if !template_changed && !parameters_changed {
            if state.is_failure() {
                // same content would fail the same way; wait for a change
                ctx.cancel_pass(format!("deployment {} is {}", name, state));
                return Ok(DeploymentOutcome::Failed(state));
            }
            debug!(deployment = %name, state = %state, "deployment up to date");
            return Ok(DeploymentOutcome::UpToDate);
        }

        info!(
            deployment = %name,
            template_changed,
            parameters_changed,
            "deployment content changed, resubmitting"
        );
        self.submit(cluster, &deployment, false).await?;
        ctx.cancel_pass(format!("deployment {} resubmitted", name));
        Ok(DeploymentOutcome::Submitted { initial: false })
    }

    /// The deployment goes away with its resource group
    pub async fn ensure_deleted(
        &self,
        cluster: &AzureCluster,
        _ctx: &mut ReconciliationContext,
    ) -> Result<(), Error> {
        debug!(
            cluster = %cluster.name_any(),
            deployment = %self.definition.deployment_name(cluster),
            "deployment is removed with its resource group"
        );
        Ok(())
    }

    async fn submit(
        &self,
        cluster: &AzureCluster,
        deployment: &Deployment,
        initial: bool,
    ) -> Result<(), Error> {
        let request = deployment.request(initial);
        self.deployments
            .create_or_update(&cluster.resource_group(), &deployment.name, &request)
            .await
            .map_err(|e| e.into_error("deployments.create_or_update"))?;

        set_resource_conditions(
            self.status.as_ref(),
            &cluster.name_any(),
            &self.status_retry,
            &deployment.name,
            &[
                (TEMPLATE_CHECKSUM_CONDITION, deployment.template_checksum.as_str()),
                (PARAMETERS_CHECKSUM_CONDITION, deployment.parameters_checksum.as_str()),
            ],
        )
        .await?;

        info!(
            deployment = %deployment.name,
            initial,
            template_checksum = %deployment.template_checksum,
            parameters_checksum = %deployment.parameters_checksum,
            "deployment submitted"
        );
        Ok(())
    }

    fn publish_outputs(&self, deployment: &str, outputs: &Value, ctx: &mut ReconciliationContext) {
        for binding in self.definition.outputs() {
            let value = outputs
                .get(binding.output)
                .and_then(|output| output.get("value"))
                .and_then(Value::as_str);

            match value {
                Some(value) => {
                    ctx.set_output(binding.field, value);
                }
                None => warn!(
                    deployment = %deployment,
                    output = binding.output,
                    "deployment output missing, leaving context field unset"
                ),
            }
        }
    }
}

/// Builder for [`DeploymentOrchestrator`]
pub struct DeploymentOrchestratorBuilder {
    deployments: Arc<dyn DeploymentsClient>,
    status: Arc<dyn ClusterStatusStore>,
    templates: Arc<dyn TemplateSource>,
    definition: Option<Arc<dyn DeploymentDefinition>>,
    status_retry: Option<RetryConfig>,
}

impl DeploymentOrchestratorBuilder {
    fn new(
        deployments: Arc<dyn DeploymentsClient>,
        status: Arc<dyn ClusterStatusStore>,
        templates: Arc<dyn TemplateSource>,
    ) -> Self {
        Self {
            deployments,
            status,
            templates,
            definition: None,
            status_retry: None,
        }
    }

    /// Deploy a different definition than [`MainDeployment`]
    pub fn definition(mut self, definition: Arc<dyn DeploymentDefinition>) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Retry policy for checksum writes
    pub fn status_retry(mut self, retry: RetryConfig) -> Self {
        self.status_retry = Some(retry);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> DeploymentOrchestrator {
        DeploymentOrchestrator {
            deployments: self.deployments,
            status: self.status,
            templates: self.templates,
            definition: self
                .definition
                .unwrap_or_else(|| Arc::new(MainDeployment::default())),
            status_retry: self
                .status_retry
                .unwrap_or_else(|| OperatorConfig::default().status_retry()),
        }
    }
}
