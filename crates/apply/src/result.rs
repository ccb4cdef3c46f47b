use std::sync::Arc;

use konverge_core::{parse_uid, ResourceMapping, Uid};
use konverge_kubehub::StoreError;
use kube::core::DynamicObject;
use rustc_hash::FxHashSet;

use crate::error::AggregateError;
use crate::object::ApplyableObject;

/// Outcome of converging one desired object.
#[derive(Debug)]
pub struct AppliedObject {
    pub object: Arc<ApplyableObject>,
    /// resourceVersion the engine last saw for this object before the apply.
    pub previous_revision: Option<String>,
    /// Object as returned by the store; `None` on failure.
    pub last_applied: Option<DynamicObject>,
    pub error: Option<StoreError>,
}

impl AppliedObject {
    /// True when the apply succeeded and moved the object's resourceVersion.
    pub fn has_cluster_mutation(&self) -> bool {
        if self.error.is_some() {
            return false;
        }
        match &self.last_applied {
            Some(live) => live.metadata.resource_version != self.previous_revision,
            None => false,
        }
    }

    pub fn uid(&self) -> Option<Uid> {
        self.last_applied
            .as_ref()
            .and_then(|o| o.metadata.uid.as_deref())
            .and_then(|u| parse_uid(u).ok())
    }
}

/// A remote object found carrying the membership label but no longer desired.
#[derive(Debug, Clone)]
pub struct PruneObject {
    pub mapping: ResourceMapping,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Uid,
    pub object: DynamicObject,
}

#[derive(Debug)]
pub struct PrunedObject {
    pub object: PruneObject,
    pub error: Option<StoreError>,
}

impl PrunedObject {
    fn describe(&self) -> String {
        let o = &self.object;
        match &o.namespace {
            Some(ns) => format!("{} {}/{}", o.mapping.group_kind(), ns, o.name),
            None => format!("{} {}", o.mapping.group_kind(), o.name),
        }
    }
}

/// Report of one pass.
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub desired: usize,
    pub applied_objects: Vec<AppliedObject>,
    pub pruned_objects: Vec<PrunedObject>,
}

impl ApplyResult {
    pub fn new(desired: usize) -> Self {
        Self { desired, ..Default::default() }
    }

    /// Fails if fewer objects were recorded than desired, or any apply failed.
    pub fn apply_errors(&self) -> Result<(), AggregateError> {
        let mut errors = Vec::new();
        if self.applied_objects.len() != self.desired {
            errors.push(format!(
                "expected {} applied objects, got {}",
                self.desired,
                self.applied_objects.len()
            ));
        }
        for applied in &self.applied_objects {
            if let Some(e) = &applied.error {
                errors.push(format!("apply {}: {}", applied.object.key(), e));
            }
        }
        AggregateError::check(errors)
    }

    pub fn prune_errors(&self) -> Result<(), AggregateError> {
        let errors = self
            .pruned_objects
            .iter()
            .filter_map(|p| p.error.as_ref().map(|e| format!("prune {}: {}", p.describe(), e)))
            .collect();
        AggregateError::check(errors)
    }

    /// Uids of every successfully applied object; prune never touches these.
    pub fn applied_uids(&self) -> FxHashSet<Uid> {
        self.applied_objects
            .iter()
            .filter(|a| a.error.is_none())
            .filter_map(AppliedObject::uid)
            .collect()
    }

    pub fn has_cluster_mutation(&self) -> bool {
        self.applied_objects.iter().any(AppliedObject::has_cluster_mutation)
    }

    pub fn failed_count(&self) -> usize {
        self.applied_objects.iter().filter(|a| a.error.is_some()).count()
    }

    pub fn pruned_count(&self) -> usize {
        self.pruned_objects.iter().filter(|p| p.error.is_none()).count()
    }

    pub(crate) fn record_applied(
        &mut self,
        object: Arc<ApplyableObject>,
        previous_revision: Option<String>,
        last_applied: Option<DynamicObject>,
        error: Option<StoreError>,
    ) -> &AppliedObject {
        self.applied_objects.push(AppliedObject { object, previous_revision, last_applied, error });
        &self.applied_objects[self.applied_objects.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Tracker;
    use kube::core::{ObjectMeta, TypeMeta};

    fn cm(name: &str, uid: Option<&str>, rv: Option<&str>) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: "v1".into(), kind: "ConfigMap".into() }),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                uid: uid.map(str::to_string),
                resource_version: rv.map(str::to_string),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    fn tracked(name: &str) -> Arc<ApplyableObject> {
        Tracker::new().add(ApplyableObject::new(name, cm(name, None, None))).unwrap()
    }

    fn rev(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    const UID_A: &str = "11111111-1111-1111-1111-111111111111";
    const UID_B: &str = "22222222-2222-2222-2222-222222222222";

    #[test]
    fn mutation_detection_compares_revisions() {
        let mut r = ApplyResult::new(3);
        r.record_applied(tracked("same"), rev("5"), Some(cm("same", Some(UID_A), Some("5"))), None);
        assert!(!r.has_cluster_mutation());
        r.record_applied(tracked("new"), None, Some(cm("new", Some(UID_B), Some("6"))), None);
        assert!(r.has_cluster_mutation());
        assert!(r.applied_objects[1].has_cluster_mutation());
    }

    #[test]
    fn mutation_is_judged_against_the_recorded_previous_revision() {
        let mut r = ApplyResult::new(2);
        let obj = tracked("a");
        r.record_applied(Arc::clone(&obj), rev("5"), Some(cm("a", Some(UID_A), Some("7"))), None);
        r.record_applied(obj, rev("7"), Some(cm("a", Some(UID_A), Some("7"))), None);
        assert!(r.applied_objects[0].has_cluster_mutation());
        assert!(!r.applied_objects[1].has_cluster_mutation());
    }

    #[test]
    fn failed_apply_is_never_a_mutation() {
        let mut r = ApplyResult::new(1);
        let err = StoreError::Api { code: 500, message: "boom".into() };
        let a = r.record_applied(tracked("x"), None, None, Some(err));
        assert!(!a.has_cluster_mutation());
    }

    #[test]
    fn apply_errors_reports_count_mismatch_and_each_failure() {
        let mut r = ApplyResult::new(3);
        r.record_applied(tracked("ok"), None, Some(cm("ok", Some(UID_A), Some("1"))), None);
        r.record_applied(tracked("bad"), None, None, Some(StoreError::Api { code: 422, message: "invalid spec".into() }));
        let err = r.apply_errors().unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(err.errors[0].contains("expected 3 applied objects, got 2"));
        assert!(err.to_string().contains("invalid spec"));
        assert!(err.to_string().contains("ConfigMap ns/bad"));
    }

    #[test]
    fn apply_errors_is_ok_when_everything_applied() {
        let mut r = ApplyResult::new(1);
        r.record_applied(tracked("ok"), None, Some(cm("ok", Some(UID_A), Some("1"))), None);
        assert!(r.apply_errors().is_ok());
        assert!(r.prune_errors().is_ok());
    }

    #[test]
    fn applied_uids_skip_failures() {
        let mut r = ApplyResult::new(2);
        r.record_applied(tracked("ok"), None, Some(cm("ok", Some(UID_A), Some("1"))), None);
        r.record_applied(tracked("bad"), None, None, Some(StoreError::Api { code: 500, message: "x".into() }));
        let uids = r.applied_uids();
        assert_eq!(uids.len(), 1);
        assert!(uids.contains(&parse_uid(UID_A).unwrap()));
    }

    #[test]
    fn prune_errors_name_the_object() {
        let mut r = ApplyResult::new(0);
        let mapping = ResourceMapping::new("", "v1", "ConfigMap", "configmaps", konverge_core::Scope::Namespaced);
        r.pruned_objects.push(PrunedObject {
            object: PruneObject {
                mapping,
                namespace: Some("ns".into()),
                name: "old".into(),
                uid: parse_uid(UID_B).unwrap(),
                object: cm("old", Some(UID_B), Some("3")),
            },
            error: Some(StoreError::Api { code: 403, message: "forbidden".into() }),
        });
        let err = r.prune_errors().unwrap_err();
        assert_eq!(err.to_string(), "prune ConfigMap ns/old: api error (403): forbidden");
        assert_eq!(r.pruned_count(), 0);
    }
}
