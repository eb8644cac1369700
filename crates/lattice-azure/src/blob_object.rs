//! Rendered node boot configuration stored as blobs
//!
//! One object per node role, keyed `{role}-{releaseVersion}`. Bodies are
//! rendered from the network outputs the deployment published into the
//! reconciliation context, so this resource must run after it.

use async_trait::async_trait;
use lattice_common::crd::AzureCluster;
use lattice_common::Error;
use tracing::{debug, info};

use crate::cloud::{CloudConfigInput, CloudError, NodeRole};
use crate::context::{ContextField, ReconciliationContext, StorageContainer};
use crate::resource::{DeletePolicy, KeyedRecord, StateResource};

const REQUIRED: &[ContextField] = &[
    ContextField::StorageContainer,
    ContextField::CloudConfig,
    ContextField::MasterSubnetId,
    ContextField::WorkerSubnetId,
    ContextField::ApiServerBackendPoolId,
    ContextField::EtcdBackendPoolId,
];

const MAX_ACCOUNT_NAME_LEN: usize = 24;

/// One stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobObject {
    /// Storage account holding the container
    pub storage_account: String,
    /// Container name
    pub container: String,
    /// Object key
    pub key: String,
    /// Object body
    pub body: String,
}

impl KeyedRecord for BlobObject {
    fn key(&self) -> &str {
        &self.key
    }
}

/// Object key for a node role at a release
pub fn object_key(role: NodeRole, release_version: &str) -> String {
    format!("{}-{}", role.as_str(), release_version)
}

/// Storage account name for a cluster: lowercase alphanumerics, at most 24 chars
pub fn storage_account_name(cluster_id: &str) -> String {
    let mut name: String = cluster_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_ACCOUNT_NAME_LEN - 2)
        .collect();
    name.push_str("sa");
    name
}

fn is_managed_key(key: &str) -> bool {
    NodeRole::ALL
        .iter()
        .any(|role| key.starts_with(&format!("{}-", role.as_str())))
}

/// Keeps one boot configuration object per node role in the cluster container
#[derive(Clone, Debug, Default)]
pub struct BlobObjectResource;

impl BlobObjectResource {
    /// Create the resource
    pub fn new() -> Self {
        Self
    }

    /// Returns the storage handle, or cancels the pass when the account or
    /// container is not usable yet
    async fn ready_storage(
        &self,
        ctx: &mut ReconciliationContext,
    ) -> Result<Option<StorageContainer>, Error> {
        ctx.validate(self.name(), &[ContextField::StorageContainer])?;
        let Some(storage) = ctx.storage_container().cloned() else {
            return Ok(None);
        };

        match storage
            .client
            .container_exists(&storage.account, &storage.container)
            .await
        {
            Ok(true) => Ok(Some(storage)),
            Ok(false) => {
                ctx.cancel_pass(format!("container {} not ready", storage.container));
                Ok(None)
            }
            Err(e) => self.not_ready_or_error(ctx, e, "storage.container_exists").map(|_| None),
        }
    }

    fn not_ready_or_error(
        &self,
        ctx: &mut ReconciliationContext,
        error: CloudError,
        operation: &str,
    ) -> Result<(), Error> {
        if error.is_storage_not_ready() {
            info!(error = %error, "storage account not ready");
            ctx.cancel_pass("storage account not ready");
            Ok(())
        } else {
            Err(error.into_error(operation))
        }
    }

    async fn put_all(
        &self,
        ctx: &mut ReconciliationContext,
        records: &[BlobObject],
    ) -> Result<(), Error> {
        ctx.validate(self.name(), &[ContextField::StorageContainer])?;
        let Some(storage) = ctx.storage_container().cloned() else {
            return Ok(());
        };

        for record in records {
            let result = storage
                .client
                .put_object(&record.storage_account, &record.container, &record.key, &record.body)
                .await;
            if let Err(e) = result {
                return self.not_ready_or_error(ctx, e, "storage.put_object");
            }
            debug!(key = %record.key, bytes = record.body.len(), "object written");
        }
        Ok(())
    }
}

#[async_trait]
impl StateResource for BlobObjectResource {
    type Record = BlobObject;

    fn name(&self) -> &str {
        "blobobject"
    }

    fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy::CascadeFromParent
    }

    async fn current_state(
        &self,
        _cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<Vec<BlobObject>, Error> {
        let Some(storage) = self.ready_storage(ctx).await? else {
            return Ok(Vec::new());
        };

        let listed = match storage.client.list_objects(&storage.account, &storage.container).await {
            Ok(listed) => listed,
            Err(e) => {
                self.not_ready_or_error(ctx, e, "storage.list_objects")?;
                return Ok(Vec::new());
            }
        };

        let mut objects = Vec::new();
        for info in listed.into_iter().filter(|o| is_managed_key(&o.key)) {
            let body = match storage
                .client
                .get_object(&storage.account, &storage.container, &info.key)
                .await
            {
                Ok(body) => body,
                // deleted between list and get
                Err(e) if e.is_not_found() && !e.is_storage_not_ready() => continue,
                Err(e) => {
                    self.not_ready_or_error(ctx, e, "storage.get_object")?;
                    return Ok(Vec::new());
                }
            };
            objects.push(BlobObject {
                storage_account: storage.account.clone(),
                container: storage.container.clone(),
                key: info.key,
                body,
            });
        }
        Ok(objects)
    }

    async fn desired_state(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<Vec<BlobObject>, Error> {
        ctx.validate(self.name(), REQUIRED)?;
        let (Some(storage), Some(renderer)) = (ctx.storage_container(), ctx.cloud_config()) else {
            return Ok(Vec::new());
        };

        let release = &cluster.spec.release_version;
        let mut objects = Vec::with_capacity(NodeRole::ALL.len());
        for role in NodeRole::ALL {
            let subnet_id = match role {
                NodeRole::Master => ctx.master_subnet_id(),
                NodeRole::Worker => ctx.worker_subnet_id(),
            };
            let input = CloudConfigInput {
                cluster_id: cluster.cluster_id(),
                role,
                release_version: release.clone(),
                subnet_id: subnet_id.unwrap_or_default().to_string(),
                api_server_backend_pool_id: ctx
                    .api_server_backend_pool_id()
                    .unwrap_or_default()
                    .to_string(),
                etcd_backend_pool_id: ctx.etcd_backend_pool_id().unwrap_or_default().to_string(),
            };

            objects.push(BlobObject {
                storage_account: storage.account.clone(),
                container: storage.container.clone(),
                key: object_key(role, release),
                body: renderer.render(&input)?,
            });
        }
        Ok(objects)
    }

    async fn apply_create(
        &self,
        _cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
        records: &[BlobObject],
    ) -> Result<(), Error> {
        self.put_all(ctx, records).await
    }

    async fn apply_update(
        &self,
        _cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
        records: &[BlobObject],
    ) -> Result<(), Error> {
        self.put_all(ctx, records).await
    }
}
