use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use konverge_core::{split_api_version, GroupKind, ObjectKey, ResourceMapping};
use konverge_kubehub::{ApplyOptions, DeleteOptions, MappingResolver, ResourceStore, StoreError};
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ApplySetConfig;
use crate::error::{Aborted, ApplySetError, CallbackPhase};
use crate::labels::{
    compute_set_id, desired_owner_annotations, inject_membership_label, inject_tool_labels, OwnerScope,
    PARENT_FIELD_MANAGER, PARENT_ID_LABEL, TOOLING_ANNOTATION,
};
use crate::object::ApplyableObject;
use crate::prune::find_prune_candidates;
use crate::result::{ApplyResult, PrunedObject};
use crate::tracker::Tracker;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    /// Record the union of what the owner already lists and what this pass adds.
    Superset,
    /// Record exactly this pass's scope.
    Latest,
}

/// One owner's set of children, converged in passes.
///
/// Objects are registered with [`ApplySet::add`]; [`ApplySet::apply`] then
/// server-side-applies them in order and, with `prune`, deletes every remote
/// object that carries this set's membership label but was not applied.
///
/// An engine can run any number of passes; each one reports mutations
/// relative to the revisions the previous pass left behind.
pub struct ApplySet {
    owner: DynamicObject,
    owner_mapping: ResourceMapping,
    set_id: String,
    config: ApplySetConfig,
    resolver: Arc<dyn MappingResolver>,
    store: Arc<dyn ResourceStore>,
    mappings: FxHashMap<GroupKind, ResourceMapping>,
    desired_scope: OwnerScope,
    desired: Tracker,
    /// Last resourceVersion seen per caller id.
    revisions: FxHashMap<String, Option<String>>,
    deadline: Option<Instant>,
}

impl ApplySet {
    pub async fn new(
        owner: DynamicObject,
        resolver: Arc<dyn MappingResolver>,
        store: Arc<dyn ResourceStore>,
        config: ApplySetConfig,
    ) -> Result<Self, ApplySetError> {
        config.validate()?;
        let name = owner.metadata.name.clone().filter(|n| !n.is_empty());
        let Some(name) = name else {
            return Err(ApplySetError::ConfigInvalid("owner name is required".into()));
        };
        let Some(types) = owner.types.clone().filter(|t| !t.kind.is_empty()) else {
            return Err(ApplySetError::ConfigInvalid("owner kind is required".into()));
        };
        let (group, version) = split_api_version(&types.api_version);
        let gk = GroupKind::new(group.clone(), types.kind.clone());
        let requested = Some(version.as_str()).filter(|v| !v.is_empty());
        let owner_mapping = resolver
            .resolve(&gk, requested)
            .await
            .map_err(|source| ApplySetError::Remote { context: format!("resolving owner kind {gk}"), source })?
            .ok_or_else(|| ApplySetError::MappingNotFound { gvk: format_gvk(&group, &version, &types.kind) })?;

        let namespace = owner.metadata.namespace.clone().unwrap_or_default();
        let set_id = compute_set_id(&name, &namespace, &types.kind, &group);
        debug!(owner = %name, namespace = %namespace, kind = %gk, set_id = %set_id, "applyset created");

        Ok(Self {
            owner,
            owner_mapping,
            set_id,
            config,
            resolver,
            store,
            mappings: FxHashMap::default(),
            desired_scope: OwnerScope::default(),
            desired: Tracker::new(),
            revisions: FxHashMap::default(),
            deadline: None,
        })
    }

    /// Value of the membership label carried by every child.
    pub fn set_id(&self) -> &str {
        &self.set_id
    }

    /// Owner as last read or committed.
    pub fn owner(&self) -> &DynamicObject {
        &self.owner
    }

    /// Scope registered by `add` so far.
    pub fn desired_scope(&self) -> &OwnerScope {
        &self.desired_scope
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }

    /// Register a desired object for the next pass.
    ///
    /// On error nothing is tracked and nothing is recorded in the desired scope.
    pub async fn add(&mut self, mut obj: ApplyableObject) -> Result<(), ApplySetError> {
        let gvk = obj.gvk();
        let mapping = self.mapping_for(&obj.group_kind(), &gvk.version, &gvk.kind).await?;

        match (mapping.namespaced(), obj.namespace()) {
            (true, None) => {
                return Err(ApplySetError::ScopeMismatch {
                    key: obj.key(),
                    reason: "namespace is required for namespaced kind",
                })
            }
            (false, Some(_)) => {
                return Err(ApplySetError::ScopeMismatch {
                    key: obj.key(),
                    reason: "namespace must be empty for cluster-scoped kind",
                })
            }
            _ => {}
        }

        let mut labels = obj.labels();
        inject_tool_labels(&mut labels, &self.config.tool_labels);
        if !obj.is_external_ref() {
            inject_membership_label(&mut labels, &self.set_id);
        }
        obj.set_labels(labels);

        let live = self
            .store
            .get(&mapping, obj.namespace(), obj.name())
            .await
            .map_err(|source| ApplySetError::Remote { context: format!("reading {}", obj.key()), source })?;
        obj.last_read_revision = live.as_ref().and_then(|o| o.metadata.resource_version.clone());

        self.desired.check(&mut obj)?;

        if let Some(cb) = &self.config.load_callback {
            cb(&obj, live.as_ref()).map_err(|source| ApplySetError::Callback { phase: CallbackPhase::Load, source })?;
        }

        let tracked = self.desired.commit(obj);
        self.revisions.insert(tracked.id().to_string(), tracked.last_read_revision.clone());
        if !tracked.is_external_ref() {
            self.desired_scope.insert_group_kind(&mapping.group_kind());
            if let Some(ns) = tracked.namespace() {
                self.desired_scope.insert_namespace(ns);
            }
        }
        debug!(object = %tracked.key(), id = tracked.id(), exists = live.is_some(), "tracked desired object");
        Ok(())
    }

    /// Converge the store to the tracked objects, pruning leftovers when `prune` is set.
    pub async fn apply(&mut self, prune: bool) -> Result<ApplyResult, Aborted> {
        self.apply_and_prune(prune, false, None).await
    }

    /// Same as [`ApplySet::apply`] with every store mutation simulated and the owner untouched.
    pub async fn dry_run(&mut self, prune: bool) -> Result<ApplyResult, Aborted> {
        self.apply_and_prune(prune, true, None).await
    }

    /// [`ApplySet::apply`] bounded by `deadline`.
    ///
    /// When the deadline passes, the store call in flight is abandoned and the
    /// pass fails with [`ApplySetError::DeadlineExceeded`]; the returned
    /// [`Aborted`] holds every outcome recorded before that point.
    pub async fn apply_until(&mut self, prune: bool, deadline: Instant) -> Result<ApplyResult, Aborted> {
        self.apply_and_prune(prune, false, Some(deadline)).await
    }

    /// [`ApplySet::dry_run`] bounded by `deadline`.
    pub async fn dry_run_until(&mut self, prune: bool, deadline: Instant) -> Result<ApplyResult, Aborted> {
        self.apply_and_prune(prune, true, Some(deadline)).await
    }

    async fn apply_and_prune(
        &mut self,
        prune: bool,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> Result<ApplyResult, Aborted> {
        let t0 = Instant::now();
        self.deadline = deadline;
        let mut result = ApplyResult::new(self.desired.len());
        let outcome = self.run(&mut result, prune, dry_run).await;
        self.deadline = None;
        histogram!("applyset_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match outcome {
            Ok(()) => {
                info!(
                    set_id = %self.set_id,
                    desired = result.desired,
                    failed = result.failed_count(),
                    pruned = result.pruned_count(),
                    dry_run,
                    "apply pass complete"
                );
                Ok(result)
            }
            Err(error) => {
                warn!(set_id = %self.set_id, error = %error, dry_run, "apply pass aborted");
                Err(Aborted { result, error })
            }
        }
    }

    async fn run(&mut self, result: &mut ApplyResult, prune: bool, dry_run: bool) -> Result<(), ApplySetError> {
        self.refresh_owner().await?;
        let recorded = OwnerScope::from_annotations(&self.owner_annotations());
        let scope = recorded.union(&self.desired_scope);

        if !dry_run {
            self.update_owner(UpdateMode::Superset).await?;
        }

        self.apply_objects(result, dry_run).await?;

        if !prune {
            return Ok(());
        }
        let delete_failed = self.prune(result, &scope, dry_run).await?;

        if dry_run {
            return Ok(());
        }
        if delete_failed {
            warn!(set_id = %self.set_id, "keeping recorded owner scope because some deletes failed");
            return Ok(());
        }
        self.update_owner(UpdateMode::Latest).await
    }

    /// Run one store call, failing once the pass deadline has passed.
    async fn bounded<T>(
        &self,
        during: impl FnOnce() -> String,
        call: impl Future<Output = T>,
    ) -> Result<T, ApplySetError> {
        let Some(deadline) = self.deadline else {
            return Ok(call.await);
        };
        if Instant::now() >= deadline {
            return Err(ApplySetError::DeadlineExceeded { during: during() });
        }
        tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| ApplySetError::DeadlineExceeded { during: during() })
    }

    async fn apply_objects(&mut self, result: &mut ApplyResult, dry_run: bool) -> Result<(), ApplySetError> {
        let opts = ApplyOptions { field_manager: self.config.field_manager.clone(), force: true, dry_run };
        let owner_ns = self.owner.metadata.namespace.as_deref().filter(|s| !s.is_empty());

        for obj in self.desired.iter() {
            let Some(mapping) = self.mappings.get(&obj.group_kind()) else {
                let gvk = obj.gvk();
                return Err(ApplySetError::MappingNotFound { gvk: format_gvk(&gvk.group, &gvk.version, &gvk.kind) });
            };
            let namespace = if mapping.namespaced() {
                Some(obj.namespace().or(owner_ns).unwrap_or(DEFAULT_NAMESPACE))
            } else {
                None
            };

            let during = || format!("applying {}", obj.key());
            let outcome = if obj.is_external_ref() {
                match self.bounded(during, self.store.get(mapping, namespace, obj.name())).await? {
                    Ok(Some(live)) => Ok(live),
                    Ok(None) => Err(StoreError::NotFound {
                        resource: konverge_kubehub::resource_label(mapping),
                        name: obj.name().to_string(),
                    }),
                    Err(e) => Err(e),
                }
            } else {
                self.bounded(during, self.store.apply(mapping, namespace, obj.name(), obj.body(), &opts)).await?
            };

            let previous = self.revisions.get(obj.id()).cloned().flatten();
            let applied = match outcome {
                Ok(live) => {
                    counter!("applyset_apply_ok", 1u64);
                    if !dry_run {
                        self.revisions.insert(obj.id().to_string(), live.metadata.resource_version.clone());
                    }
                    result.record_applied(Arc::clone(obj), previous, Some(live), None)
                }
                Err(e) => {
                    counter!("applyset_apply_err", 1u64);
                    warn!(object = %obj.key(), error = %e, "apply failed");
                    result.record_applied(Arc::clone(obj), previous, None, Some(e));
                    continue;
                }
            };
            debug!(object = %obj.key(), mutated = applied.has_cluster_mutation(), dry_run, "applied");
            if let Some(cb) = &self.config.after_apply_callback {
                cb(applied).map_err(|source| ApplySetError::Callback { phase: CallbackPhase::AfterApply, source })?;
            }
        }
        Ok(())
    }

    /// Returns whether any delete failed.
    async fn prune(&self, result: &mut ApplyResult, scope: &OwnerScope, dry_run: bool) -> Result<bool, ApplySetError> {
        let keep = result.applied_uids();
        let candidates = self
            .bounded(
                || "listing prune candidates".to_string(),
                find_prune_candidates(
                    self.resolver.as_ref(),
                    self.store.as_ref(),
                    &self.mappings,
                    scope,
                    &self.set_id,
                    &keep,
                ),
            )
            .await??;
        debug!(set_id = %self.set_id, candidates = candidates.len(), "prune candidates");

        let opts = DeleteOptions { dry_run };
        let mut failed = false;
        for candidate in candidates {
            let mut pruned = PrunedObject { object: candidate, error: None };
            if let Some(cb) = &self.config.before_prune_callback {
                cb(&pruned).map_err(|source| ApplySetError::Callback { phase: CallbackPhase::BeforePrune, source })?;
            }
            let target = &pruned.object;
            let deleted = self
                .bounded(
                    || format!("pruning {} {}", target.mapping.group_kind(), target.name),
                    self.store.delete(&target.mapping, target.namespace.as_deref(), &target.name, &opts),
                )
                .await?;
            match deleted {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(name = %target.name, "prune target already gone");
                }
                Err(e) => {
                    counter!("applyset_prune_err", 1u64);
                    warn!(kind = %target.mapping.group_kind(), name = %target.name, error = %e, "prune failed");
                    failed = true;
                    pruned.error = Some(e);
                }
            }
            if pruned.error.is_none() {
                counter!("applyset_prune_total", 1u64);
                info!(
                    kind = %pruned.object.mapping.group_kind(),
                    namespace = ?pruned.object.namespace,
                    name = %pruned.object.name,
                    dry_run,
                    "pruned"
                );
            }
            result.pruned_objects.push(pruned);
        }
        Ok(failed)
    }

    async fn mapping_for(&mut self, gk: &GroupKind, version: &str, kind: &str) -> Result<ResourceMapping, ApplySetError> {
        if let Some(m) = self.mappings.get(gk) {
            return Ok(m.clone());
        }
        let requested = Some(version).filter(|v| !v.is_empty());
        let mapping = self
            .resolver
            .resolve(gk, requested)
            .await
            .map_err(|source| ApplySetError::Remote { context: format!("resolving {gk}"), source })?
            .ok_or_else(|| ApplySetError::MappingNotFound { gvk: format_gvk(&gk.group, version, kind) })?;
        self.mappings.insert(gk.clone(), mapping.clone());
        Ok(mapping)
    }

    fn owner_namespace(&self) -> Option<&str> {
        if self.owner_mapping.namespaced() {
            self.owner.metadata.namespace.as_deref().filter(|s| !s.is_empty())
        } else {
            None
        }
    }

    fn owner_name(&self) -> &str {
        self.owner.metadata.name.as_deref().unwrap_or_default()
    }

    fn owner_annotations(&self) -> BTreeMap<String, String> {
        self.owner.metadata.annotations.clone().unwrap_or_default()
    }

    /// Pick up scope recorded by earlier passes, possibly from other processes.
    async fn refresh_owner(&mut self) -> Result<(), ApplySetError> {
        let live = self
            .bounded(
                || "reading owner".to_string(),
                self.store.get(&self.owner_mapping, self.owner_namespace(), self.owner_name()),
            )
            .await?
            .map_err(|source| ApplySetError::Remote { context: "reading owner".into(), source })?;
        match live {
            Some(obj) => self.owner = obj,
            None => debug!(owner = %self.owner_key(), "owner not found remotely; using local copy"),
        }
        Ok(())
    }

    fn owner_key(&self) -> ObjectKey {
        ObjectKey {
            group_kind: self.owner_mapping.group_kind(),
            namespace: self.owner_namespace().map(str::to_string),
            name: self.owner_name().to_string(),
        }
    }

    async fn update_owner(&mut self, mode: UpdateMode) -> Result<(), ApplySetError> {
        let current_annotations = self.owner_annotations();
        let mut annotations =
            desired_owner_annotations(&current_annotations, &self.desired_scope, mode == UpdateMode::Superset);
        annotations.insert(TOOLING_ANNOTATION.to_string(), self.config.tooling.to_string());

        let current_labels = self.owner.metadata.labels.clone().unwrap_or_default();
        let id_current = current_labels.get(PARENT_ID_LABEL).map(String::as_str) == Some(self.set_id.as_str());
        let annotations_current = annotations.iter().all(|(k, v)| current_annotations.get(k) == Some(v));
        if id_current && annotations_current {
            debug!(owner = %self.owner_key(), ?mode, "owner already up to date");
            return Ok(());
        }

        let mut body = json!({
            "apiVersion": self.owner_mapping.api_version(),
            "kind": self.owner_mapping.kind,
            "metadata": {
                "name": self.owner_name(),
                "labels": { PARENT_ID_LABEL: self.set_id },
                "annotations": annotations,
            },
        });
        if let Some(ns) = self.owner_namespace() {
            body["metadata"]["namespace"] = Json::String(ns.to_string());
        }

        let opts = ApplyOptions { field_manager: PARENT_FIELD_MANAGER.to_string(), force: true, dry_run: false };
        let updated = self
            .bounded(
                || "updating owner".to_string(),
                self.store.apply(&self.owner_mapping, self.owner_namespace(), self.owner_name(), &body, &opts),
            )
            .await?
            .map_err(|source| ApplySetError::OwnerUpdate { source })?;
        info!(owner = %self.owner_key(), ?mode, set_id = %self.set_id, "owner updated");
        self.owner = updated;
        Ok(())
    }
}

impl std::fmt::Debug for ApplySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplySet")
            .field("owner", &self.owner_key())
            .field("set_id", &self.set_id)
            .field("desired", &self.desired.len())
            .field("desired_scope", &self.desired_scope)
            .finish()
    }
}

fn format_gvk(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{version}, Kind={kind}")
    } else {
        format!("{group}/{version}, Kind={kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_rendering_matches_server_messages() {
        assert_eq!(format_gvk("apps", "v1", "Deployment"), "apps/v1, Kind=Deployment");
        assert_eq!(format_gvk("", "v1", "Pod"), "v1, Kind=Pod");
    }
}
