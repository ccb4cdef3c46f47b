use std::sync::Arc;

use konverge_core::ObjectKey;
use rustc_hash::FxHashSet;

use crate::error::ApplySetError;
use crate::object::ApplyableObject;

/// Desired objects of one pass, in caller order.
#[derive(Debug, Default)]
pub struct Tracker {
    objects: Vec<Arc<ApplyableObject>>,
    server_ids: FxHashSet<ObjectKey>,
    client_ids: FxHashSet<String>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `obj`, serializing its body once. A rejected object leaves the
    /// tracker unchanged.
    pub fn add(&mut self, mut obj: ApplyableObject) -> Result<Arc<ApplyableObject>, ApplySetError> {
        self.check(&mut obj)?;
        Ok(self.commit(obj))
    }

    /// Reject duplicates and cache the serialized body without tracking `obj`.
    pub(crate) fn check(&self, obj: &mut ApplyableObject) -> Result<(), ApplySetError> {
        let key = obj.key();
        if self.server_ids.contains(&key) {
            return Err(ApplySetError::DuplicateRemoteIdentity { key });
        }
        if self.client_ids.contains(obj.id()) {
            return Err(ApplySetError::DuplicateCallerId { id: obj.id().to_string(), key });
        }
        obj.marshalled = obj
            .serialize_body()
            .map_err(|source| ApplySetError::NotSerializable { key, source })?;
        Ok(())
    }

    /// Track an object that already passed [`Tracker::check`].
    pub(crate) fn commit(&mut self, obj: ApplyableObject) -> Arc<ApplyableObject> {
        self.server_ids.insert(obj.key());
        self.client_ids.insert(obj.id().to_string());
        let obj = Arc::new(obj);
        self.objects.push(Arc::clone(&obj));
        obj
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ApplyableObject>> {
        self.objects.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Applyable;
    use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
    use std::collections::BTreeMap;

    fn cm(ns: &str, name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: "v1".into(), kind: "ConfigMap".into() }),
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
            data: serde_json::json!({ "data": { "k": "v" } }),
        }
    }

    #[derive(Debug)]
    struct Unserializable;

    impl Applyable for Unserializable {
        fn group_version_kind(&self) -> GroupVersionKind {
            GroupVersionKind::gvk("", "v1", "ConfigMap")
        }
        fn namespace(&self) -> Option<&str> {
            Some("ns")
        }
        fn name(&self) -> &str {
            "broken"
        }
        fn labels(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
        fn set_labels(&mut self, _labels: BTreeMap<String, String>) {}
        fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
            Err(<serde_json::Error as serde::ser::Error>::custom("body cannot be encoded"))
        }
    }

    #[test]
    fn keeps_caller_order_and_caches_body() {
        let mut t = Tracker::new();
        t.add(ApplyableObject::new("b", cm("ns", "b"))).unwrap();
        t.add(ApplyableObject::new("a", cm("ns", "a"))).unwrap();
        let ids: Vec<_> = t.iter().map(|o| o.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(t.len(), 2);
        let first = t.iter().next().unwrap();
        assert_eq!(first.body()["metadata"]["name"], "b");
    }

    #[test]
    fn rejects_duplicate_remote_identity() {
        let mut t = Tracker::new();
        t.add(ApplyableObject::new("one", cm("ns", "a"))).unwrap();
        let err = t.add(ApplyableObject::new("two", cm("ns", "a"))).unwrap_err();
        assert!(matches!(err, ApplySetError::DuplicateRemoteIdentity { .. }), "{err}");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn same_name_in_other_namespace_is_distinct() {
        let mut t = Tracker::new();
        t.add(ApplyableObject::new("one", cm("ns1", "a"))).unwrap();
        t.add(ApplyableObject::new("two", cm("ns2", "a"))).unwrap();
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn rejects_duplicate_caller_id() {
        let mut t = Tracker::new();
        t.add(ApplyableObject::new("same", cm("ns", "a"))).unwrap();
        let err = t.add(ApplyableObject::new("same", cm("ns", "b"))).unwrap_err();
        assert!(matches!(err, ApplySetError::DuplicateCallerId { ref id, .. } if id == "same"), "{err}");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn rejects_unserializable_body_without_tracking_it() {
        let mut t = Tracker::new();
        let err = t.add(ApplyableObject::new("x", Unserializable)).unwrap_err();
        assert!(matches!(err, ApplySetError::NotSerializable { .. }), "{err}");
        assert!(t.is_empty());
        // the key was not reserved by the failed attempt
        t.add(ApplyableObject::new("x", cm("ns", "broken"))).unwrap();
    }

    #[test]
    fn check_alone_reserves_nothing() {
        let mut t = Tracker::new();
        let mut obj = ApplyableObject::new("a", cm("ns", "a"));
        t.check(&mut obj).unwrap();
        assert!(t.is_empty());
        assert_eq!(obj.body()["metadata"]["name"], "a");
        // same id and key still free until committed
        t.add(ApplyableObject::new("a", cm("ns", "a"))).unwrap();
        assert_eq!(t.len(), 1);
    }
}
