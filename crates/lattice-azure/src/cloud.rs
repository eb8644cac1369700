//! Cloud gateway interfaces
//!
//! The reconciliation engine only talks to Azure through the traits in this
//! module. Each trait is object-safe so callers can hold `Arc<dyn ...>`
//! handles, and each one is mockable in tests.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use lattice_common::Error;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes the cloud uses to say "this thing does not exist"
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFound",
    "ResourceGroupNotFound",
    "DeploymentNotFound",
    "ContainerNotFound",
    "BlobNotFound",
];

/// Error codes that mean the storage account is not usable yet
const STORAGE_NOT_READY_CODES: &[&str] =
    &["StorageAccountNotFound", "StorageAccountIsNotProvisioned"];

/// Error returned by cloud gateway calls
///
/// Carries enough of the upstream response to classify it: a missing
/// resource and a not-yet-provisioned storage account are expected states
/// during provisioning, not failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudError {
    /// HTTP status code, when the call got a response
    pub status_code: Option<u16>,
    /// Upstream error code (e.g., "DeploymentNotFound")
    pub code: Option<String>,
    /// Upstream error message
    pub message: String,
}

impl CloudError {
    /// An error without a response (transport failure, timeout)
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            code: None,
            message: message.into(),
        }
    }

    /// An error carrying the upstream status and code
    pub fn with_status(
        status_code: u16,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status_code: Some(status_code),
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// A 404 with the given upstream code
    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(404, code, message)
    }

    /// The addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(404)
            || self
                .code
                .as_deref()
                .is_some_and(|code| NOT_FOUND_CODES.contains(&code))
    }

    /// The storage account is missing or still provisioning
    pub fn is_storage_not_ready(&self) -> bool {
        let matches = |s: &str| STORAGE_NOT_READY_CODES.iter().any(|code| s.contains(code));
        self.code.as_deref().is_some_and(matches) || matches(&self.message)
    }

    /// Convert into the crate error, tagging the failed operation
    pub fn into_error(self, operation: &str) -> Error {
        Error::cloud(operation, self.to_string(), self.status_code)
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status_code, self.code.as_deref()) {
            (Some(status), Some(code)) => write!(f, "[{} {}] {}", status, code, self.message),
            (Some(status), None) => write!(f, "[{}] {}", status, self.message),
            (None, Some(code)) => write!(f, "[{}] {}", code, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CloudError {}

/// Provisioning state reported for a deployment or scale set instance
///
/// Unknown values are kept verbatim and treated as non-final.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Accepted, not started
    Accepted,
    /// In progress
    Running,
    /// Being created
    Creating,
    /// Being updated
    Updating,
    /// Being deleted
    Deleting,
    /// Completed successfully
    Succeeded,
    /// Completed with an error
    Failed,
    /// Canceled before completion
    Canceled,
    /// Any other upstream value
    Other(String),
}

impl ProvisioningState {
    /// Parse an upstream value, case-insensitively
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "accepted" => Self::Accepted,
            "running" => Self::Running,
            "creating" => Self::Creating,
            "updating" => Self::Updating,
            "deleting" => Self::Deleting,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Other(raw.to_string()),
        }
    }

    /// Succeeded, Failed and Canceled are final
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Final but not successful
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "Accepted"),
            Self::Running => write!(f, "Running"),
            Self::Creating => write!(f, "Creating"),
            Self::Updating => write!(f, "Updating"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Deployment mode; this engine only ever submits incremental deployments
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// Add or update resources, leave others alone
    #[default]
    Incremental,
    /// Delete resources not in the template
    Complete,
}

/// Body of a create-or-update deployment call
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeploymentRequest {
    /// Deployment mode
    pub mode: DeploymentMode,
    /// Full template document
    pub template: Value,
    /// Parameters in `{name: {"value": v}}` form
    pub parameters: Value,
}

/// Observed state of a deployment
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentStatus {
    /// Current provisioning state
    pub provisioning_state: ProvisioningState,
    /// Outputs in `{name: {"type": t, "value": v}}` form; Null while running
    pub outputs: Value,
}

/// Deployment operations of the cloud gateway
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentsClient: Send + Sync {
    /// Fetch a deployment; a missing one yields a not-found [`CloudError`]
    async fn get(&self, resource_group: &str, name: &str) -> Result<DeploymentStatus, CloudError>;

    /// Submit a deployment; returns once the cloud accepted it
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<(), CloudError>;
}

/// Metadata of one stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key inside its container
    pub key: String,
}

/// Blob storage operations of the cloud gateway
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Whether the container exists in the account
    async fn container_exists(&self, account: &str, container: &str) -> Result<bool, CloudError>;

    /// List all objects in a container
    async fn list_objects(
        &self,
        account: &str,
        container: &str,
    ) -> Result<Vec<ObjectInfo>, CloudError>;

    /// Read an object body
    async fn get_object(
        &self,
        account: &str,
        container: &str,
        key: &str,
    ) -> Result<String, CloudError>;

    /// Create or overwrite an object
    async fn put_object(
        &self,
        account: &str,
        container: &str,
        key: &str,
        body: &str,
    ) -> Result<(), CloudError>;
}

/// One instance of a virtual machine scale set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmssInstance {
    /// Instance id within the scale set
    pub instance_id: String,
    /// Current provisioning state
    pub provisioning_state: ProvisioningState,
}

/// Scale set operations of the cloud gateway
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmssClient: Send + Sync {
    /// List all instances of a scale set
    async fn list_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
    ) -> Result<Vec<VmssInstance>, CloudError>;
}

/// Node role a rendered artifact is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Control plane node
    Master,
    /// Worker node
    Worker,
}

impl NodeRole {
    /// Both roles, in provisioning order
    pub const ALL: [NodeRole; 2] = [NodeRole::Master, NodeRole::Worker];

    /// Lowercase name, used as object key prefix and scale set suffix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs for rendering one node's boot configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudConfigInput {
    /// Cluster the node belongs to
    pub cluster_id: String,
    /// Role of the node
    pub role: NodeRole,
    /// Release the node runs
    pub release_version: String,
    /// Subnet the node lives in
    pub subnet_id: String,
    /// Load balancer pool fronting the API server
    pub api_server_backend_pool_id: String,
    /// Load balancer pool fronting etcd
    pub etcd_backend_pool_id: String,
}

/// Renders node boot configuration
#[cfg_attr(test, automock)]
pub trait CloudConfigRenderer: Send + Sync {
    /// Render the boot document for one node role
    fn render(&self, input: &CloudConfigInput) -> Result<String, Error>;
}

/// Provides deployment template documents by name
#[cfg_attr(test, automock)]
pub trait TemplateSource: Send + Sync {
    /// Return the template registered under `name`
    fn template(&self, name: &str) -> Result<Value, Error>;
}

/// Templates held in memory, typically loaded once at startup
#[derive(Clone, Debug, Default)]
pub struct StaticTemplates {
    templates: HashMap<String, Value>,
}

impl StaticTemplates {
    /// Empty template set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under `name`
    pub fn with_template(mut self, name: impl Into<String>, template: Value) -> Self {
        self.templates.insert(name.into(), template);
        self
    }

    /// Register a template from its JSON text
    pub fn with_template_json(self, name: impl Into<String>, json: &str) -> Result<Self, Error> {
        let name = name.into();
        let template: Value = serde_json::from_str(json).map_err(|e| {
            Error::serialization_for_kind(format!("template {}", name), e.to_string())
        })?;
        Ok(self.with_template(name, template))
    }
}

impl TemplateSource for StaticTemplates {
    fn template(&self, name: &str) -> Result<Value, Error> {
        self.templates.get(name).cloned().ok_or_else(|| {
            Error::internal_with_context("templates", format!("no template registered as {}", name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_detected_by_status_or_code() {
        assert!(CloudError::not_found("DeploymentNotFound", "gone").is_not_found());
        assert!(CloudError {
            status_code: None,
            code: Some("ResourceGroupNotFound".to_string()),
            message: "rg missing".to_string(),
        }
        .is_not_found());
        assert!(!CloudError::with_status(500, "InternalError", "boom").is_not_found());
        assert!(!CloudError::new("timeout").is_not_found());
    }

    #[test]
    fn test_storage_not_ready_matches_code_or_message() {
        assert!(CloudError::with_status(404, "StorageAccountNotFound", "x").is_storage_not_ready());
        assert!(CloudError::new(
            "request failed: StorageAccountIsNotProvisioned: account is being created"
        )
        .is_storage_not_ready());
        let denied = CloudError::with_status(403, "AuthorizationFailed", "denied");
        assert!(!denied.is_storage_not_ready());
    }

    #[test]
    fn test_into_error_keeps_operation_and_status() {
        let err = CloudError::with_status(409, "Conflict", "busy").into_error("deployments.get");
        match err {
            Error::Cloud {
                operation,
                message,
                status_code,
            } => {
                assert_eq!(operation, "deployments.get");
                assert_eq!(status_code, Some(409));
                assert!(message.contains("busy"));
            }
            other => panic!("expected Cloud error, got {:?}", other),
        }
    }

    #[test]
    fn test_provisioning_state_parsing() {
        assert_eq!(ProvisioningState::parse("Succeeded"), ProvisioningState::Succeeded);
        assert_eq!(ProvisioningState::parse("running"), ProvisioningState::Running);
        assert_eq!(
            ProvisioningState::parse("Migrating"),
            ProvisioningState::Other("Migrating".to_string())
        );
    }

    #[test]
    fn test_only_terminal_states_are_final() {
        for state in ["Succeeded", "Failed", "Canceled"] {
            assert!(ProvisioningState::parse(state).is_final(), "{}", state);
        }
        for state in ["Accepted", "Running", "Updating", "Deleting", "Migrating"] {
            assert!(!ProvisioningState::parse(state).is_final(), "{}", state);
        }
    }

    #[test]
    fn test_request_serializes_mode_as_string() {
        let request = DeploymentRequest {
            mode: DeploymentMode::Incremental,
            template: serde_json::json!({"resources": []}),
            parameters: serde_json::json!({"location": {"value": "westeurope"}}),
        };
        let json = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(json["mode"], "Incremental");
        assert_eq!(json["parameters"]["location"]["value"], "westeurope");
    }

    #[test]
    fn test_static_templates_lookup() {
        let templates = StaticTemplates::new()
            .with_template_json("main", r#"{"resources": []}"#)
            .expect("valid json");
        assert!(templates.template("main").is_ok());
        assert!(templates.template("missing").is_err());
        assert!(StaticTemplates::new().with_template_json("bad", "{").is_err());
    }
}
