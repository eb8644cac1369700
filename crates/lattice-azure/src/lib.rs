//! Azure infrastructure reconciliation for Lattice workload clusters
//!
//! Drives the cloud resources behind an [`lattice_common::crd::AzureCluster`]
//! through repeated, idempotent passes. Each pass threads a
//! [`context::ReconciliationContext`] through a fixed list of resources; the
//! long-running network deployment is gated by checksums persisted on the
//! cluster status, and scale set health is watched by a small worker pool.

#![deny(missing_docs)]

pub mod blob_object;
pub mod cloud;
pub mod config;
pub mod context;
pub mod controller;
pub mod deployment;
pub mod resource;
pub mod status;
pub mod subnet;
pub mod watchdog;

pub use config::OperatorConfig;
pub use controller::{
    error_policy, reconcile, CloudClients, ClusterResource, Context, PassOutcome, ResourceSet,
};
