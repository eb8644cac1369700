//! AzureCluster CRD: declarative description of a workload cluster on Azure

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ResourceStatus;

/// AzureCluster describes the cloud infrastructure of one workload cluster.
///
/// Example:
/// ```yaml
/// apiVersion: lattice.dev/v1alpha1
/// kind: AzureCluster
/// metadata:
///   name: prod-eu
///   namespace: lattice-system
/// spec:
///   location: westeurope
///   networkCidr: 10.1.0.0/16
///   releaseVersion: 1.32.0
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "AzureCluster",
    namespaced,
    status = "AzureClusterStatus",
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.location"}"#,
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.networkCidr"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterSpec {
    /// Resource group holding the cluster; defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,

    /// Azure region (e.g., "westeurope")
    pub location: String,

    /// Virtual network CIDR carved into Calico, master, worker and VPN subnets
    pub network_cidr: String,

    /// Release version, used to key rendered node artifacts
    pub release_version: String,

    /// Whether to provision a VPN gateway subnet and gateway
    #[serde(default = "default_true")]
    pub vpn_gateway: bool,

    /// Deployment parameter overwrites; win over computed parameters on collision
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameter_overrides: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// Lifecycle phase reported on an AzureCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Nothing reconciled yet
    #[default]
    Pending,
    /// Cloud resources are being created or updated
    Provisioning,
    /// The last pass completed without pending work
    Ready,
    /// The last pass failed with a non-retryable error
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for an AzureCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterStatus {
    /// Current phase of the cluster infrastructure
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Per-resource state (persisted deployment checksums)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

impl AzureClusterStatus {
    /// Find the status entry of a named resource
    pub fn resource(&self, name: &str) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Find or create the status entry of a named resource
    pub fn resource_mut(&mut self, name: &str) -> &mut ResourceStatus {
        let idx = match self.resources.iter().position(|r| r.name == name) {
            Some(idx) => idx,
            None => {
                self.resources.push(ResourceStatus::new(name));
                self.resources.len() - 1
            }
        };
        &mut self.resources[idx]
    }
}

impl AzureCluster {
    /// Resource group holding this cluster's cloud resources
    pub fn resource_group(&self) -> String {
        self.spec
            .resource_group
            .clone()
            .unwrap_or_else(|| self.name_any())
    }

    /// Cluster identifier used to name cloud resources
    pub fn cluster_id(&self) -> String {
        self.name_any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> AzureClusterSpec {
        AzureClusterSpec {
            resource_group: None,
            location: "westeurope".to_string(),
            network_cidr: "10.1.0.0/16".to_string(),
            release_version: "1.32.0".to_string(),
            vpn_gateway: true,
            parameter_overrides: BTreeMap::new(),
        }
    }

    #[test]
    fn test_resource_group_defaults_to_cluster_name() {
        let cluster = AzureCluster::new("prod-eu", sample_spec());
        assert_eq!(cluster.resource_group(), "prod-eu");

        let mut spec = sample_spec();
        spec.resource_group = Some("rg-shared".to_string());
        let cluster = AzureCluster::new("prod-eu", spec);
        assert_eq!(cluster.resource_group(), "rg-shared");
    }

    #[test]
    fn test_spec_parses_with_defaults() {
        let spec: AzureClusterSpec = serde_json::from_value(serde_json::json!({
            "location": "westeurope",
            "networkCidr": "10.1.0.0/16",
            "releaseVersion": "1.32.0"
        }))
        .expect("spec should parse");
        assert!(spec.vpn_gateway);
        assert!(spec.parameter_overrides.is_empty());
        assert!(spec.resource_group.is_none());
    }

    #[test]
    fn test_resource_mut_creates_entry_once() {
        let mut status = AzureClusterStatus::default();
        status
            .resource_mut("cluster-main")
            .set_condition("DeploymentTemplateChecksum", "abc");
        status
            .resource_mut("cluster-main")
            .set_condition("DeploymentParametersChecksum", "def");

        assert_eq!(status.resources.len(), 1);
        let entry = status.resource("cluster-main").expect("entry should exist");
        assert_eq!(entry.condition("DeploymentTemplateChecksum"), Some("abc"));
        assert_eq!(entry.condition("DeploymentParametersChecksum"), Some("def"));
    }
}
