//! Persisted cluster status with optimistic concurrency
//!
//! Status writes carry the resourceVersion they were based on. A write
//! against a newer version fails with [`StoreError::Conflict`] and
//! [`update_status`] re-reads and retries, so concurrent writers never
//! silently overwrite each other.

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use lattice_common::crd::{AzureCluster, AzureClusterStatus};
use lattice_common::retry::{retry_with_backoff_if, RetryConfig};
use lattice_common::{Error, AZURE_FIELD_MANAGER};
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use thiserror::Error as ThisError;
use tracing::debug;

/// A value together with the version it was read at
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    /// The value
    pub value: T,
    /// Opaque version token; None for objects that were never written
    pub resource_version: Option<String>,
}

/// Failure of a status write
#[derive(Debug, ThisError)]
pub enum StoreError {
    /// The stored version moved since it was read
    #[error("status of {0} was modified concurrently")]
    Conflict(String),
    /// Any other failure
    #[error(transparent)]
    Other(#[from] Error),
}

impl StoreError {
    /// Whether a re-read and retry can succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Storage for cluster status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStatusStore: Send + Sync {
    /// Read the current status and its version
    async fn load(&self, name: &str) -> Result<Versioned<AzureClusterStatus>, Error>;

    /// Write a status, failing with a conflict if the stored version is no
    /// longer `resource_version`
    async fn store(
        &self,
        name: &str,
        status: &AzureClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Read-modify-write a cluster status, retrying on conflicts.
///
/// `mutate` is re-run against a fresh read on every attempt and returns
/// whether it changed anything; nothing is written when it did not.
/// Returns whether a write happened.
pub async fn update_status<F>(
    store: &dyn ClusterStatusStore,
    name: &str,
    retry: &RetryConfig,
    mutate: F,
) -> Result<bool, Error>
where
    F: Fn(&mut AzureClusterStatus) -> bool + Send + Sync,
{
    let result = retry_with_backoff_if(
        retry,
        "update_status",
        || try_update(store, name, &mutate),
        StoreError::is_conflict,
    )
    .await;

    match result {
        Ok(written) => {
            debug!(cluster = %name, written, "status update finished");
            Ok(written)
        }
        Err(StoreError::Conflict(_)) => Err(Error::StatusConflict {
            name: name.to_string(),
            attempts: retry.max_attempts,
        }),
        Err(StoreError::Other(e)) => Err(e),
    }
}

async fn try_update<F>(
    store: &dyn ClusterStatusStore,
    name: &str,
    mutate: &F,
) -> Result<bool, StoreError>
where
    F: Fn(&mut AzureClusterStatus) -> bool + Send + Sync,
{
    let current = store.load(name).await?;
    let mut status = current.value;
    if !mutate(&mut status) {
        return Ok(false);
    }
    store.store(name, &status, current.resource_version).await?;
    Ok(true)
}

/// Read one per-resource condition value
pub async fn get_resource_condition(
    store: &dyn ClusterStatusStore,
    name: &str,
    resource: &str,
    condition: &str,
) -> Result<Option<String>, Error> {
    let status = store.load(name).await?.value;
    Ok(status
        .resource(resource)
        .and_then(|r| r.condition(condition))
        .map(str::to_string))
}

/// Set several per-resource condition values in one status write
pub async fn set_resource_conditions(
    store: &dyn ClusterStatusStore,
    name: &str,
    retry: &RetryConfig,
    resource: &str,
    conditions: &[(&str, &str)],
) -> Result<bool, Error> {
    update_status(store, name, retry, |status| {
        let entry = status.resource_mut(resource);
        let mut changed = false;
        for (type_, value) in conditions {
            changed |= entry.set_condition(type_, value);
        }
        changed
    })
    .await
}

/// Status store backed by the AzureCluster status subresource
#[derive(Clone)]
pub struct KubeStatusStore {
    api: Api<AzureCluster>,
}

impl KubeStatusStore {
    /// Store for AzureClusters in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ClusterStatusStore for KubeStatusStore {
    async fn load(&self, name: &str) -> Result<Versioned<AzureClusterStatus>, Error> {
        let cluster = self.api.get_status(name).await?;
        Ok(Versioned {
            value: cluster.status.unwrap_or_default(),
            resource_version: cluster.metadata.resource_version,
        })
    }

    async fn store(
        &self,
        name: &str,
        status: &AzureClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), StoreError> {
        let patch = status_patch(status, resource_version);
        let params = PatchParams::apply(AZURE_FIELD_MANAGER);

        match self.api.patch_status(name, &params, &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(StoreError::Conflict(name.to_string()))
            }
            Err(e) => Err(StoreError::Other(e.into())),
        }
    }
}

/// Merge patch replacing the whole status.
///
/// Serialization skips empty fields, but a merge patch keeps whatever a
/// missing key held before, so cleared fields are sent as explicit nulls.
/// The API server rejects the patch if `resource_version` is stale.
fn status_patch(status: &AzureClusterStatus, resource_version: Option<String>) -> Value {
    let mut patch = json!({ "status": status });
    if status.message.is_none() {
        patch["status"]["message"] = Value::Null;
    }
    if status.resources.is_empty() {
        patch["status"]["resources"] = Value::Null;
    }
    if let Some(version) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}


#[cfg(test)]
mod tests {
    use super::testing::InMemoryStatusStore;
    use super::*;
    use lattice_common::crd::ClusterPhase;
    use std::time::Duration;

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn story_update_writes_and_bumps_version() {
        let store = InMemoryStatusStore::new();

        let written = update_status(&store, "c1", &fast_retry(3), |s| {
            s.phase = ClusterPhase::Provisioning;
            true
        })
        .await
        .expect("update should succeed");

        assert!(written);
        assert_eq!(store.get("c1").phase, ClusterPhase::Provisioning);
        let loaded = store.load("c1").await.expect("load");
        assert_eq!(loaded.resource_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn story_unchanged_status_is_not_written() {
        let store = InMemoryStatusStore::new();
        let written = update_status(&store, "c1", &fast_retry(3), |_| false)
            .await
            .expect("noop update should succeed");
        assert!(!written);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn story_conflicts_are_retried_against_fresh_reads() {
        let store = InMemoryStatusStore::new();
        store.inject_conflicts(2);

        set_resource_conditions(
            &store,
            "c1",
            &fast_retry(5),
            "c1-main",
            &[("DeploymentTemplateChecksum", "abc")],
        )
        .await
        .expect("third attempt should win");

        assert_eq!(store.writes(), 1);
        let value = get_resource_condition(&store, "c1", "c1-main", "DeploymentTemplateChecksum")
            .await
            .expect("read");
        assert_eq!(value.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn story_persistent_conflicts_surface_as_status_conflict() {
        let store = InMemoryStatusStore::new();
        store.inject_conflicts(10);

        let err = update_status(&store, "c1", &fast_retry(3), |s| {
            s.message = Some("x".to_string());
            true
        })
        .await
        .expect_err("conflicts outlast the retry budget");

        match err {
            Error::StatusConflict { name, attempts } => {
                assert_eq!(name, "c1");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected StatusConflict, got {:?}", other),
        }
    }

    // =========================================================================
    // Merge patch body
    // =========================================================================

    #[test]
    fn story_cleared_message_is_sent_as_null() {
        let status = AzureClusterStatus {
            phase: ClusterPhase::Ready,
            ..Default::default()
        };

        let patch = status_patch(&status, Some("42".to_string()));

        assert_eq!(patch["status"]["phase"], "Ready");
        let body = patch["status"].as_object().expect("status object");
        assert_eq!(body.get("message"), Some(&Value::Null));
        assert_eq!(body.get("resources"), Some(&Value::Null));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
    }

    #[test]
    fn story_set_message_is_sent_and_version_is_optional() {
        let status = AzureClusterStatus {
            phase: ClusterPhase::Provisioning,
            message: Some("waiting on deployment: deployment c1-main is Running".to_string()),
            ..Default::default()
        };

        let patch = status_patch(&status, None);

        assert_eq!(
            patch["status"]["message"],
            "waiting on deployment: deployment c1-main is Running"
        );
        assert!(patch.get("metadata").is_none());
    }

    #[tokio::test]
    async fn story_load_errors_are_not_retried() {
        let mut store = MockClusterStatusStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|_| Err(Error::internal("api down")));

        let err = update_status(&store, "c1", &fast_retry(5), |_| true)
            .await
            .expect_err("load failure propagates");
        assert!(matches!(err, Error::Internal { .. }));
    }
}
