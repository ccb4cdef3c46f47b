use std::collections::BTreeMap;
use std::fmt;

use konverge_core::{split_api_version, GroupKind, ObjectKey};
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value as Json;

/// What the engine needs from a desired resource body.
pub trait Applyable: fmt::Debug + Send + Sync {
    fn group_version_kind(&self) -> GroupVersionKind;
    /// `None` for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;
    fn labels(&self) -> BTreeMap<String, String>;
    fn set_labels(&mut self, labels: BTreeMap<String, String>);
    fn to_json(&self) -> Result<Json, serde_json::Error>;
}

impl Applyable for DynamicObject {
    fn group_version_kind(&self) -> GroupVersionKind {
        match &self.types {
            Some(t) => {
                let (group, version) = split_api_version(&t.api_version);
                GroupVersionKind::gvk(&group, &version, &t.kind)
            }
            None => GroupVersionKind::gvk("", "", ""),
        }
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref().filter(|s| !s.is_empty())
    }

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.metadata.labels = Some(labels);
    }

    fn to_json(&self) -> Result<Json, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// One desired resource for a pass.
#[derive(Debug)]
pub struct ApplyableObject {
    object: Box<dyn Applyable>,
    id: String,
    external_ref: bool,
    decorate: bool,
    pub(crate) last_read_revision: Option<String>,
    pub(crate) marshalled: Json,
}

impl ApplyableObject {
    /// `id` is the caller's handle for the object and must be unique per pass.
    pub fn new(id: impl Into<String>, object: impl Applyable + 'static) -> Self {
        Self {
            object: Box::new(object),
            id: id.into(),
            external_ref: false,
            decorate: false,
            last_read_revision: None,
            marshalled: Json::Null,
        }
    }

    /// Mark as an external reference: read, never labeled, never pruned.
    pub fn external(mut self) -> Self {
        self.external_ref = true;
        self
    }

    pub fn decorated(mut self) -> Self {
        self.decorate = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_external_ref(&self) -> bool {
        self.external_ref
    }

    pub fn is_decorate(&self) -> bool {
        self.decorate
    }

    pub fn gvk(&self) -> GroupVersionKind {
        self.object.group_version_kind()
    }

    pub fn group_kind(&self) -> GroupKind {
        let gvk = self.gvk();
        GroupKind::new(gvk.group, gvk.kind)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object.namespace()
    }

    pub fn name(&self) -> &str {
        self.object.name()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            group_kind: self.group_kind(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.object.labels()
    }

    pub(crate) fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.object.set_labels(labels);
    }

    /// resourceVersion seen when the object was added, if it existed.
    pub fn last_read_revision(&self) -> Option<&str> {
        self.last_read_revision.as_deref()
    }

    /// Serialized body; `Null` until accepted by the tracker.
    pub fn body(&self) -> &Json {
        &self.marshalled
    }

    pub(crate) fn serialize_body(&self) -> Result<Json, serde_json::Error> {
        self.object.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ObjectMeta, TypeMeta};

    fn deployment() -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: "apps/v1".into(), kind: "Deployment".into() }),
            metadata: ObjectMeta { name: Some("web".into()), namespace: Some("prod".into()), ..Default::default() },
            data: serde_json::json!({ "spec": { "replicas": 2 } }),
        }
    }

    #[test]
    fn dynamic_object_exposes_identity() {
        let obj = ApplyableObject::new("web", deployment());
        let gvk = obj.gvk();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("apps", "v1", "Deployment"));
        assert_eq!(obj.key().to_string(), "Deployment.apps prod/web");
        assert!(!obj.is_external_ref());
        assert_eq!(obj.body(), &Json::Null);
    }

    #[test]
    fn empty_namespace_reads_as_cluster_scoped() {
        let mut d = deployment();
        d.metadata.namespace = Some(String::new());
        assert_eq!(ApplyableObject::new("x", d).namespace(), None);
    }

    #[test]
    fn builder_flags() {
        let obj = ApplyableObject::new("x", deployment()).external().decorated();
        assert!(obj.is_external_ref());
        assert!(obj.is_decorate());
    }
}
