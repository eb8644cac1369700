//! Custom Resource Definitions for Lattice Azure
//!
//! `AzureCluster` is the declarative description of a workload cluster on
//! Azure. Its status doubles as the persisted checksum store used to decide
//! whether a cloud deployment needs to be resubmitted.

mod azure_cluster;
mod types;

pub use azure_cluster::{AzureCluster, AzureClusterSpec, AzureClusterStatus, ClusterPhase};
pub use types::{ResourceCondition, ResourceStatus};
