//! The main cluster network deployment

use kube::ResourceExt;
use lattice_common::crd::AzureCluster;
use lattice_common::Error;

use super::{DeploymentDefinition, OutputBinding, Parameters};
use crate::context::ContextField;
use crate::subnet::{self, SubnetConfig};

/// Template name the main deployment is registered under
pub const MAIN_TEMPLATE: &str = "main";

const MAIN_OUTPUTS: &[OutputBinding] = &[
    OutputBinding::new("apiServerBackendPoolID", ContextField::ApiServerBackendPoolId),
    OutputBinding::new("etcdBackendPoolID", ContextField::EtcdBackendPoolId),
    OutputBinding::new("masterSubnetID", ContextField::MasterSubnetId),
    OutputBinding::new("workerSubnetID", ContextField::WorkerSubnetId),
];

/// Virtual network, subnets, load balancers and the optional VPN gateway
#[derive(Clone, Debug, Default)]
pub struct MainDeployment {
    subnets: SubnetConfig,
}

impl MainDeployment {
    /// Main deployment carving subnets of the given sizes
    pub fn new(subnets: SubnetConfig) -> Self {
        Self { subnets }
    }
}

impl DeploymentDefinition for MainDeployment {
    fn deployment_name(&self, cluster: &AzureCluster) -> String {
        format!("{}-main", cluster.cluster_id())
    }

    fn template_name(&self) -> &str {
        MAIN_TEMPLATE
    }

    fn parameters(&self, cluster: &AzureCluster) -> Result<Parameters, Error> {
        let parent = subnet::parse_network(&cluster.name_any(), &cluster.spec.network_cidr)?;
        let subnets = subnet::compute(parent, &self.subnets)?;

        let mut parameters = Parameters::new();
        parameters.insert("clusterID", cluster.cluster_id());
        parameters.insert("location", cluster.spec.location.clone());
        parameters.insert("virtualNetworkCidr", subnets.parent.to_string());
        parameters.insert("calicoSubnetCidr", subnets.calico.to_string());
        parameters.insert("masterSubnetCidr", subnets.master.to_string());
        parameters.insert("workerSubnetCidr", subnets.worker.to_string());
        parameters.insert("vpnSubnetCidr", subnets.vpn.to_string());
        parameters.insert("vpnGatewayEnabled", cluster.spec.vpn_gateway);
        Ok(parameters)
    }

    fn outputs(&self) -> &[OutputBinding] {
        MAIN_OUTPUTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::AzureClusterSpec;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn cluster(cidr: &str) -> AzureCluster {
        AzureCluster::new(
            "prod-eu",
            AzureClusterSpec {
                resource_group: None,
                location: "westeurope".to_string(),
                network_cidr: cidr.to_string(),
                release_version: "1.32.0".to_string(),
                vpn_gateway: true,
                parameter_overrides: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_parameters_carry_computed_subnets() {
        let parameters = MainDeployment::default()
            .parameters(&cluster("10.0.0.0/16"))
            .expect("a /16 has room");

        assert_eq!(parameters.get("clusterID"), Some(&json!("prod-eu")));
        assert_eq!(parameters.get("calicoSubnetCidr"), Some(&json!("10.0.128.0/17")));
        assert_eq!(parameters.get("masterSubnetCidr"), Some(&json!("10.0.0.0/24")));
        assert_eq!(parameters.get("workerSubnetCidr"), Some(&json!("10.0.1.0/24")));
        assert_eq!(parameters.get("vpnSubnetCidr"), Some(&json!("10.0.2.0/24")));
        assert_eq!(parameters.get("vpnGatewayEnabled"), Some(&json!(true)));
    }

    #[test]
    fn test_small_network_fails_parameter_build() {
        let err = MainDeployment::default()
            .parameters(&cluster("10.0.0.0/24"))
            .expect_err("a /24 is too small");
        assert!(matches!(err, Error::SubnetSpaceExhausted { .. }));
    }

    #[test]
    fn test_outputs_bind_every_network_field() {
        let fields: Vec<ContextField> = MainDeployment::default()
            .outputs()
            .iter()
            .map(|b| b.field)
            .collect();
        assert_eq!(
            fields,
            vec![
                ContextField::ApiServerBackendPoolId,
                ContextField::EtcdBackendPoolId,
                ContextField::MasterSubnetId,
                ContextField::WorkerSubnetId,
            ]
        );
        assert_eq!(
            MainDeployment::default().deployment_name(&cluster("10.0.0.0/16")),
            "prod-eu-main"
        );
    }
}
