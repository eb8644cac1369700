//! Per-pass reconciliation context
//!
//! A fresh [`ReconciliationContext`] is created for every pass over a
//! cluster. Resources earlier in the set fill it with values later ones
//! depend on (the deployment publishes its outputs, the resource set
//! attaches the storage and renderer handles), and any resource may cancel
//! the rest of the pass by recording a reason.

use std::fmt;
use std::sync::Arc;

use lattice_common::Error;

use crate::cloud::{CloudConfigRenderer, ObjectStorage};

/// Names of the values a resource may require from the context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextField {
    /// Load balancer pool fronting the API server
    ApiServerBackendPoolId,
    /// Load balancer pool fronting etcd
    EtcdBackendPoolId,
    /// Subnet of the master nodes
    MasterSubnetId,
    /// Subnet of the worker nodes
    WorkerSubnetId,
    /// Storage container handle
    StorageContainer,
    /// Boot configuration renderer handle
    CloudConfig,
}

impl ContextField {
    /// Every field, in declaration order
    pub const ALL: [ContextField; 6] = [
        ContextField::ApiServerBackendPoolId,
        ContextField::EtcdBackendPoolId,
        ContextField::MasterSubnetId,
        ContextField::WorkerSubnetId,
        ContextField::StorageContainer,
        ContextField::CloudConfig,
    ];

    /// Field name as it appears in deployment outputs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiServerBackendPoolId => "apiServerBackendPoolID",
            Self::EtcdBackendPoolId => "etcdBackendPoolID",
            Self::MasterSubnetId => "masterSubnetID",
            Self::WorkerSubnetId => "workerSubnetID",
            Self::StorageContainer => "storageContainer",
            Self::CloudConfig => "cloudConfig",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle on the blob container holding rendered node artifacts
#[derive(Clone)]
pub struct StorageContainer {
    /// Storage account name
    pub account: String,
    /// Container name inside the account
    pub container: String,
    /// Storage client
    pub client: Arc<dyn ObjectStorage>,
}

impl fmt::Debug for StorageContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContainer")
            .field("account", &self.account)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

/// Mutable state shared by the resources of one pass
#[derive(Default)]
pub struct ReconciliationContext {
    api_server_backend_pool_id: Option<String>,
    etcd_backend_pool_id: Option<String>,
    master_subnet_id: Option<String>,
    worker_subnet_id: Option<String>,
    storage: Option<StorageContainer>,
    cloud_config: Option<Arc<dyn CloudConfigRenderer>>,
    cancel_reason: Option<String>,
}

impl ReconciliationContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Load balancer pool fronting the API server
    pub fn api_server_backend_pool_id(&self) -> Option<&str> {
        self.api_server_backend_pool_id.as_deref()
    }

    /// Load balancer pool fronting etcd
    pub fn etcd_backend_pool_id(&self) -> Option<&str> {
        self.etcd_backend_pool_id.as_deref()
    }

    /// Subnet of the master nodes
    pub fn master_subnet_id(&self) -> Option<&str> {
        self.master_subnet_id.as_deref()
    }

    /// Subnet of the worker nodes
    pub fn worker_subnet_id(&self) -> Option<&str> {
        self.worker_subnet_id.as_deref()
    }

    /// Storage container handle
    pub fn storage_container(&self) -> Option<&StorageContainer> {
        self.storage.as_ref()
    }

    /// Boot configuration renderer
    pub fn cloud_config(&self) -> Option<&Arc<dyn CloudConfigRenderer>> {
        self.cloud_config.as_ref()
    }

    /// Attach the storage container handle
    pub fn set_storage_container(&mut self, storage: StorageContainer) {
        self.storage = Some(storage);
    }

    /// Attach the boot configuration renderer
    pub fn set_cloud_config(&mut self, renderer: Arc<dyn CloudConfigRenderer>) {
        self.cloud_config = Some(renderer);
    }

    /// Set a string-valued field.
    ///
    /// Returns false for handle fields, which cannot be set from a string.
    /// An empty value clears the field.
    pub fn set_output(&mut self, field: ContextField, value: impl Into<String>) -> bool {
        let value = Some(value.into()).filter(|v| !v.is_empty());
        let slot = match field {
            ContextField::ApiServerBackendPoolId => &mut self.api_server_backend_pool_id,
            ContextField::EtcdBackendPoolId => &mut self.etcd_backend_pool_id,
            ContextField::MasterSubnetId => &mut self.master_subnet_id,
            ContextField::WorkerSubnetId => &mut self.worker_subnet_id,
            ContextField::StorageContainer | ContextField::CloudConfig => return false,
        };
        *slot = value;
        true
    }

    /// Whether a field holds a usable value
    pub fn is_set(&self, field: ContextField) -> bool {
        let non_empty = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        match field {
            ContextField::ApiServerBackendPoolId => non_empty(&self.api_server_backend_pool_id),
            ContextField::EtcdBackendPoolId => non_empty(&self.etcd_backend_pool_id),
            ContextField::MasterSubnetId => non_empty(&self.master_subnet_id),
            ContextField::WorkerSubnetId => non_empty(&self.worker_subnet_id),
            ContextField::StorageContainer => self.storage.is_some(),
            ContextField::CloudConfig => self.cloud_config.is_some(),
        }
    }

    /// Fail with [`Error::InvalidContext`] naming every required field that is unset
    pub fn validate(&self, resource: &str, required: &[ContextField]) -> Result<(), Error> {
        let missing: Vec<String> = required
            .iter()
            .filter(|field| !self.is_set(**field))
            .map(|field| field.as_str().to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_context(resource, missing))
        }
    }

    /// Stop the remaining resources of this pass.
    ///
    /// The first reason wins; later calls are ignored.
    pub fn cancel_pass(&mut self, reason: impl Into<String>) {
        if self.cancel_reason.is_none() {
            self.cancel_reason = Some(reason.into());
        }
    }

    /// Whether the pass was canceled
    pub fn is_canceled(&self) -> bool {
        self.cancel_reason.is_some()
    }

    /// Why the pass was canceled
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }
}

impl fmt::Debug for ReconciliationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationContext")
            .field("api_server_backend_pool_id", &self.api_server_backend_pool_id)
            .field("etcd_backend_pool_id", &self.etcd_backend_pool_id)
            .field("master_subnet_id", &self.master_subnet_id)
            .field("worker_subnet_id", &self.worker_subnet_id)
            .field("storage", &self.storage)
            .field("cloud_config", &self.cloud_config.is_some())
            .field("cancel_reason", &self.cancel_reason)
            .finish()
    }
}
