//! Generic desired-state reconciliation
//!
//! A [`StateResource`] describes one kind of cloud object as a list of keyed
//! records. [`reconcile_state`] fetches the current and desired lists, diffs
//! them by key and applies the three change sets in order: create, update,
//! delete. The pass cancellation flag is checked on entry and after every
//! step; once set, nothing further runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use lattice_common::crd::AzureCluster;
use lattice_common::Error;
use tracing::{debug, info};

use crate::context::ReconciliationContext;

/// A record addressable by a stable key
pub trait KeyedRecord: Clone + PartialEq + Send + Sync {
    /// Identity of the record; two records with the same key describe the same object
    fn key(&self) -> &str;
}

/// Result of diffing current against desired records
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSet<R> {
    /// Desired records with no current counterpart
    pub to_create: Vec<R>,
    /// Desired records whose current counterpart differs
    pub to_update: Vec<R>,
    /// Current records with no desired counterpart
    pub to_delete: Vec<R>,
}

impl<R> Default for ChangeSet<R> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }
}

impl<R> ChangeSet<R> {
    /// No work to do
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff current against desired records by key.
///
/// The three sets are disjoint, and a record equal on both sides appears in
/// none of them. Records keep the order they had in their input.
pub fn diff<R: KeyedRecord>(current: &[R], desired: &[R]) -> ChangeSet<R> {
    let current_by_key: BTreeMap<&str, &R> = current.iter().map(|r| (r.key(), r)).collect();
    let desired_keys: BTreeSet<&str> = desired.iter().map(|r| r.key()).collect();

    let mut changes = ChangeSet::default();
    for record in desired {
        match current_by_key.get(record.key()) {
            None => changes.to_create.push(record.clone()),
            Some(existing) if *existing != record => changes.to_update.push(record.clone()),
            Some(_) => {}
        }
    }
    changes.to_delete = current
        .iter()
        .filter(|r| !desired_keys.contains(r.key()))
        .cloned()
        .collect();
    changes
}

/// How stale records of a resource are removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Call [`StateResource::apply_delete`] for stale records
    #[default]
    Apply,
    /// Never delete individually; the records go away with their parent
    /// (resource group or storage account)
    CascadeFromParent,
}

/// A kind of cloud object managed as a keyed record list
#[async_trait]
pub trait StateResource: Send + Sync {
    /// Record type
    type Record: KeyedRecord + std::fmt::Debug;

    /// Name used in logs, errors and status
    fn name(&self) -> &str;

    /// How stale records are removed
    fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy::Apply
    }

    /// Records that exist in the cloud now
    async fn current_state(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<Vec<Self::Record>, Error>;

    /// Records that should exist
    async fn desired_state(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
    ) -> Result<Vec<Self::Record>, Error>;

    /// Create missing records
    async fn apply_create(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
        records: &[Self::Record],
    ) -> Result<(), Error>;

    /// Overwrite changed records
    async fn apply_update(
        &self,
        cluster: &AzureCluster,
        ctx: &mut ReconciliationContext,
        records: &[Self::Record],
    ) -> Result<(), Error>;

    /// Remove stale records; only called under [`DeletePolicy::Apply`]
    async fn apply_delete(
        &self,
        _cluster: &AzureCluster,
        _ctx: &mut ReconciliationContext,
        _records: &[Self::Record],
    ) -> Result<(), Error> {
        Err(Error::internal_with_context(
            self.name(),
            "resource does not delete records individually",
        ))
    }
}

/// Converge one resource towards its desired state.
///
/// Returns the change set that was computed. Stops early, without error,
/// when the pass gets canceled at any step.
pub async fn reconcile_state<R>(
    resource: &R,
    cluster: &AzureCluster,
    ctx: &mut ReconciliationContext,
) -> Result<ChangeSet<R::Record>, Error>
where
    R: StateResource + ?Sized,
{
    let name = resource.name().to_string();
    if ctx.is_canceled() {
        debug!(resource = %name, "pass already canceled, skipping");
        return Ok(ChangeSet::default());
    }

    let current = resource.current_state(cluster, ctx).await?;
    if ctx.is_canceled() {
        debug!(resource = %name, "pass canceled while reading current state");
        return Ok(ChangeSet::default());
    }

    let desired = resource.desired_state(cluster, ctx).await?;
    if ctx.is_canceled() {
        debug!(resource = %name, "pass canceled while computing desired state");
        return Ok(ChangeSet::default());
    }

    let changes = diff(&current, &desired);
    if changes.is_empty() {
        debug!(resource = %name, records = desired.len(), "resource is up to date");
        return Ok(changes);
    }

    info!(
        resource = %name,
        create = changes.to_create.len(),
        update = changes.to_update.len(),
        delete = changes.to_delete.len(),
        "applying changes"
    );

    if !changes.to_create.is_empty() {
        resource.apply_create(cluster, ctx, &changes.to_create).await?;
        if ctx.is_canceled() {
            return Ok(changes);
        }
    }

    if !changes.to_update.is_empty() {
        resource.apply_update(cluster, ctx, &changes.to_update).await?;
        if ctx.is_canceled() {
            return Ok(changes);
        }
    }

    if !changes.to_delete.is_empty() {
        match resource.delete_policy() {
            DeletePolicy::Apply => {
                resource.apply_delete(cluster, ctx, &changes.to_delete).await?;
            }
            DeletePolicy::CascadeFromParent => {
                debug!(
                    resource = %name,
                    stale = changes.to_delete.len(),
                    "leaving stale records to parent deletion"
                );
            }
        }
    }

    Ok(changes)
}

/// Remove every record of a resource as part of cluster deletion.
///
/// A no-op for resources whose records cascade from their parent.
pub async fn reconcile_deletion<R>(
    resource: &R,
    cluster: &AzureCluster,
    ctx: &mut ReconciliationContext,
) -> Result<(), Error>
where
    R: StateResource + ?Sized,
{
    if resource.delete_policy() == DeletePolicy::CascadeFromParent {
        debug!(resource = %resource.name(), "deletion cascades from parent");
        return Ok(());
    }

    let current = resource.current_state(cluster, ctx).await?;
    if ctx.is_canceled() || current.is_empty() {
        return Ok(());
    }

    info!(resource = %resource.name(), delete = current.len(), "deleting records");
    resource.apply_delete(cluster, ctx, &current).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use lattice_common::crd::AzureClusterSpec;

    #[derive(Clone, Debug, PartialEq)]
    struct Rec {
        key: String,
        body: String,
    }

    impl KeyedRecord for Rec {
        fn key(&self) -> &str {
            &self.key
        }
    }

    fn rec(key: &str, body: &str) -> Rec {
        Rec {
            key: key.to_string(),
            body: body.to_string(),
        }
    }

    fn keys(records: &[Rec]) -> Vec<&str> {
        records.iter().map(|r| r.key.as_str()).collect()
    }

    fn cluster() -> AzureCluster {
        AzureCluster::new(
            "c1",
            AzureClusterSpec {
                resource_group: None,
                location: "westeurope".to_string(),
                network_cidr: "10.0.0.0/16".to_string(),
                release_version: "1.0.0".to_string(),
                vpn_gateway: false,
                parameter_overrides: Map::new(),
            },
        )
    }

    // =========================================================================
    // Diff
    // =========================================================================

    #[test]
    fn story_diff_sorts_records_into_create_update_delete() {
        let current = vec![rec("a", "1"), rec("b", "1"), rec("c", "1")];
        let desired = vec![rec("b", "2"), rec("c", "1"), rec("d", "1")];

        let changes = diff(&current, &desired);

        assert_eq!(keys(&changes.to_create), vec!["d"]);
        assert_eq!(keys(&changes.to_update), vec!["b"]);
        assert_eq!(changes.to_update[0].body, "2");
        assert_eq!(keys(&changes.to_delete), vec!["a"]);
    }

    #[test]
    fn story_identical_lists_produce_no_changes() {
        let records = vec![rec("a", "1"), rec("b", "2")];
        assert!(diff(&records, &records).is_empty());
    }

    #[test]
    fn story_diff_ignores_input_order() {
        let current = vec![rec("a", "1"), rec("b", "1")];
        let desired = vec![rec("c", "1"), rec("b", "2")];

        let mut reversed_current = current.clone();
        reversed_current.reverse();
        let mut reversed_desired = desired.clone();
        reversed_desired.reverse();

        let forward = diff(&current, &desired);
        let backward = diff(&reversed_current, &reversed_desired);

        let sorted = |records: &[Rec]| {
            let mut k: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
            k.sort();
            k
        };
        assert_eq!(sorted(&forward.to_create), sorted(&backward.to_create));
        assert_eq!(sorted(&forward.to_update), sorted(&backward.to_update));
        assert_eq!(sorted(&forward.to_delete), sorted(&backward.to_delete));
    }

    #[test]
    fn story_empty_sides() {
        let records = vec![rec("a", "1")];
        let created = diff(&[], &records);
        assert_eq!(keys(&created.to_create), vec!["a"]);
        assert!(created.to_delete.is_empty());

        let deleted = diff(&records, &[]);
        assert_eq!(keys(&deleted.to_delete), vec!["a"]);
        assert!(deleted.to_create.is_empty());
    }

    // =========================================================================
    // reconcile_state
    // =========================================================================

    /// In-memory resource that records every apply call
    struct FakeResource {
        policy: DeletePolicy,
        current: Vec<Rec>,
        desired: Vec<Rec>,
        cancel_on_create: bool,
        calls: Mutex<Vec<String>>,
        reads: AtomicU32,
    }

    impl FakeResource {
        fn new(current: Vec<Rec>, desired: Vec<Rec>) -> Self {
            Self {
                policy: DeletePolicy::Apply,
                current,
                desired,
                cancel_on_create: false,
                calls: Mutex::new(Vec::new()),
                reads: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn record(&self, op: &str, records: &[Rec]) {
            self.calls
                .lock()
                .expect("lock")
                .push(format!("{}:{}", op, keys(records).join(",")));
        }
    }

    #[async_trait]
    impl StateResource for FakeResource {
        type Record = Rec;

        fn name(&self) -> &str {
            "fake"
        }

        fn delete_policy(&self) -> DeletePolicy {
            self.policy
        }

        async fn current_state(
            &self,
            _cluster: &AzureCluster,
            _ctx: &mut ReconciliationContext,
        ) -> Result<Vec<Rec>, Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.current.clone())
        }

        async fn desired_state(
            &self,
            _cluster: &AzureCluster,
            _ctx: &mut ReconciliationContext,
        ) -> Result<Vec<Rec>, Error> {
            Ok(self.desired.clone())
        }

        async fn apply_create(
            &self,
            _cluster: &AzureCluster,
            ctx: &mut ReconciliationContext,
            records: &[Rec],
        ) -> Result<(), Error> {
            self.record("create", records);
            if self.cancel_on_create {
                ctx.cancel_pass("container not ready");
            }
            Ok(())
        }

        async fn apply_update(
            &self,
            _cluster: &AzureCluster,
            _ctx: &mut ReconciliationContext,
            records: &[Rec],
        ) -> Result<(), Error> {
            self.record("update", records);
            Ok(())
        }

        async fn apply_delete(
            &self,
            _cluster: &AzureCluster,
            _ctx: &mut ReconciliationContext,
            records: &[Rec],
        ) -> Result<(), Error> {
            self.record("delete", records);
            Ok(())
        }
    }

    #[tokio::test]
    async fn story_changes_are_applied_create_then_update_then_delete() {
        let resource = FakeResource::new(
            vec![rec("a", "1"), rec("b", "1")],
            vec![rec("b", "2"), rec("c", "1")],
        );
        let mut ctx = ReconciliationContext::new();

        let changes = reconcile_state(&resource, &cluster(), &mut ctx)
            .await
            .expect("reconcile should succeed");

        assert_eq!(resource.calls(), vec!["create:c", "update:b", "delete:a"]);
        assert_eq!(keys(&changes.to_create), vec!["c"]);
    }

    #[tokio::test]
    async fn story_cascade_policy_skips_individual_deletes() {
        let mut resource = FakeResource::new(vec![rec("stale", "1")], vec![]);
        resource.policy = DeletePolicy::CascadeFromParent;
        let mut ctx = ReconciliationContext::new();

        let changes = reconcile_state(&resource, &cluster(), &mut ctx)
            .await
            .expect("reconcile should succeed");

        assert_eq!(keys(&changes.to_delete), vec!["stale"]);
        assert!(resource.calls().is_empty());

        reconcile_deletion(&resource, &cluster(), &mut ctx)
            .await
            .expect("cascade deletion is a no-op");
        assert!(resource.calls().is_empty());
    }

    #[tokio::test]
    async fn story_cancellation_stops_remaining_steps() {
        let mut resource = FakeResource::new(
            vec![rec("a", "1"), rec("b", "1")],
            vec![rec("b", "2"), rec("c", "1")],
        );
        resource.cancel_on_create = true;
        let mut ctx = ReconciliationContext::new();

        reconcile_state(&resource, &cluster(), &mut ctx)
            .await
            .expect("cancellation is not an error");

        assert_eq!(resource.calls(), vec!["create:c"]);
        assert_eq!(ctx.cancel_reason(), Some("container not ready"));
    }

    #[tokio::test]
    async fn story_already_canceled_pass_applies_nothing() {
        let resource = FakeResource::new(vec![], vec![rec("a", "1")]);
        let mut ctx = ReconciliationContext::new();
        ctx.cancel_pass("earlier resource not ready");

        let changes = reconcile_state(&resource, &cluster(), &mut ctx)
            .await
            .expect("cancellation is not an error");

        assert!(changes.is_empty());
        assert_eq!(resource.reads.load(Ordering::SeqCst), 0, "current state not read");
        assert!(resource.calls().is_empty());
    }

    #[tokio::test]
    async fn story_deletion_removes_all_current_records() {
        let resource = FakeResource::new(vec![rec("a", "1"), rec("b", "1")], vec![rec("a", "1")]);
        let mut ctx = ReconciliationContext::new();

        reconcile_deletion(&resource, &cluster(), &mut ctx)
            .await
            .expect("deletion should succeed");

        assert_eq!(resource.calls(), vec!["delete:a,b"]);
    }
}
