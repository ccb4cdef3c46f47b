//! In-memory store with server-side-apply-like behavior.
//!
//! Semantics kept close enough to an API server for the engine:
//! - uids are assigned on create and never change;
//! - `resourceVersion` moves only when the stored content changes;
//! - apply merges labels/annotations into the stored maps and drops only the
//!   keys the same field manager set before but no longer sends;
//! - top-level fields in the body replace the stored ones;
//! - dry-run computes the outcome without persisting it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::Value as Json;
use tracing::debug;
use uuid::Uuid;

use crate::{
    resource_label, ApplyOptions, DeleteOptions, GroupKind, MappingResolver, ResourceMapping,
    ResourceStore, StoreError,
};

type Key = (GroupKind, Option<String>, String);
type StringMap = BTreeMap<String, String>;

/// Metadata keys last sent by one field manager for one object.
#[derive(Debug, Default, Clone)]
struct Owned {
    labels: BTreeSet<String>,
    annotations: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    mappings: Vec<ResourceMapping>,
    objects: BTreeMap<Key, DynamicObject>,
    revision: u64,
    mutations: u64,
    failing_applies: HashSet<(String, String)>,
    failing_deletes: HashSet<(String, String)>,
    owned: BTreeMap<(Key, String), Owned>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a served kind. The first mapping registered for a group-kind
    /// is its preferred version.
    pub fn with_mapping(self, mapping: ResourceMapping) -> Self {
        self.lock().mappings.push(mapping);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object directly, assigning uid and resourceVersion when absent.
    pub fn insert(&self, mut obj: DynamicObject) -> DynamicObject {
        let mut inner = self.lock();
        inner.revision += 1;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(inner.revision.to_string());
        let key = key_of(&obj);
        inner.objects.insert(key, obj.clone());
        obj
    }

    /// Look up a stored object by group-kind, namespace and name.
    pub fn object(&self, gk: &GroupKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let key = (gk.clone(), namespace.map(str::to_string), name.to_string());
        self.lock().objects.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of persisted (non dry-run) applies and deletes.
    pub fn mutations(&self) -> u64 {
        self.lock().mutations
    }

    pub fn fail_apply(&self, kind: &str, name: &str) {
        self.lock().failing_applies.insert((kind.to_string(), name.to_string()));
    }

    pub fn fail_delete(&self, kind: &str, name: &str) {
        self.lock().failing_deletes.insert((kind.to_string(), name.to_string()));
    }
}

fn key_of(obj: &DynamicObject) -> Key {
    let (group, kind) = match &obj.types {
        Some(t) => (konverge_core::split_api_version(&t.api_version).0, t.kind.clone()),
        None => (String::new(), String::new()),
    };
    (
        GroupKind::new(group, kind),
        obj.metadata.namespace.clone().filter(|s| !s.is_empty()),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

fn key_for(mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> Key {
    let ns = if mapping.namespaced() { namespace.map(str::to_string) } else { None };
    (mapping.group_kind(), ns, name.to_string())
}

fn injected(mapping: &ResourceMapping, name: &str) -> StoreError {
    StoreError::Api { code: 500, message: format!("injected failure for {} {}", mapping.kind, name) }
}

fn string_map(v: Option<&Json>) -> Result<StringMap, StoreError> {
    match v {
        None | Some(Json::Null) => Ok(StringMap::new()),
        Some(v) => Ok(serde_json::from_value(v.clone())?),
    }
}

fn merge_owned(current: Option<StringMap>, previously_owned: &BTreeSet<String>, given: &StringMap) -> Option<StringMap> {
    let mut out = current.unwrap_or_default();
    for k in previously_owned.iter().filter(|k| !given.contains_key(*k)) {
        out.remove(k);
    }
    out.extend(given.iter().map(|(k, v)| (k.clone(), v.clone())));
    Some(out).filter(|m| !m.is_empty())
}

fn same_map(a: &Option<StringMap>, b: &Option<StringMap>) -> bool {
    a.as_ref().filter(|m| !m.is_empty()) == b.as_ref().filter(|m| !m.is_empty())
}

/// Equality-only selector: `k=v[,k=v]`.
fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl MappingResolver for MemoryStore {
    async fn resolve(
        &self,
        group_kind: &GroupKind,
        version: Option<&str>,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .mappings
            .iter()
            .find(|m| {
                m.group == group_kind.group
                    && m.kind == group_kind.kind
                    && version.map_or(true, |v| m.version == v)
            })
            .cloned())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.lock().objects.get(&key_for(mapping, namespace, name)).cloned())
    }

    async fn apply(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        body: &Json,
        opts: &ApplyOptions,
    ) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        if inner.failing_applies.contains(&(mapping.kind.clone(), name.to_string())) {
            return Err(injected(mapping, name));
        }
        let key = key_for(mapping, namespace, name);
        let existing = inner.objects.get(&key).cloned();
        let mut next = existing.clone().unwrap_or_else(|| DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: key.1.clone(),
                uid: Some(Uuid::new_v4().to_string()),
                ..Default::default()
            },
            data: Json::Object(Default::default()),
        });
        next.types = Some(TypeMeta { api_version: mapping.api_version(), kind: mapping.kind.clone() });

        let meta = body.get("metadata");
        let labels = string_map(meta.and_then(|m| m.get("labels")))?;
        let annotations = string_map(meta.and_then(|m| m.get("annotations")))?;
        let owner_key = (key.clone(), opts.field_manager.clone());
        let prev_owned = inner.owned.get(&owner_key).cloned().unwrap_or_default();
        next.metadata.labels = merge_owned(next.metadata.labels.take(), &prev_owned.labels, &labels);
        next.metadata.annotations = merge_owned(next.metadata.annotations.take(), &prev_owned.annotations, &annotations);
        if let Some(fields) = body.as_object() {
            if !next.data.is_object() {
                next.data = Json::Object(Default::default());
            }
            if let Some(data) = next.data.as_object_mut() {
                for (k, v) in fields {
                    if matches!(k.as_str(), "apiVersion" | "kind" | "metadata") {
                        continue;
                    }
                    data.insert(k.clone(), v.clone());
                }
            }
        }

        let changed = match &existing {
            Some(prev) => {
                !same_map(&prev.metadata.labels, &next.metadata.labels)
                    || !same_map(&prev.metadata.annotations, &next.metadata.annotations)
                    || prev.data != next.data
            }
            None => true,
        };
        if changed {
            let rv = inner.revision + 1;
            next.metadata.resource_version = Some(rv.to_string());
            if !opts.dry_run {
                inner.revision = rv;
            }
        }
        if !opts.dry_run {
            inner.mutations += 1;
            inner.objects.insert(key, next.clone());
            let owned = Owned { labels: labels.into_keys().collect(), annotations: annotations.into_keys().collect() };
            inner.owned.insert(owner_key, owned);
        }
        debug!(resource = %resource_label(mapping), name, changed, dry_run = opts.dry_run, manager = %opts.field_manager, "memory apply");
        Ok(next)
    }

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_deletes.contains(&(mapping.kind.clone(), name.to_string())) {
            return Err(injected(mapping, name));
        }
        let key = key_for(mapping, namespace, name);
        if !inner.objects.contains_key(&key) {
            return Err(StoreError::NotFound { resource: resource_label(mapping), name: name.to_string() });
        }
        if !opts.dry_run {
            inner.objects.remove(&key);
            inner.owned.retain(|(k, _), _| *k != key);
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn list(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.lock();
        let gk = mapping.group_kind();
        Ok(inner
            .objects
            .iter()
            .filter(|((k_gk, k_ns, _), _)| {
                *k_gk == gk
                    && (!mapping.namespaced() || namespace.map_or(true, |ns| k_ns.as_deref() == Some(ns)))
            })
            .filter(|(_, obj)| matches_selector(obj, label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}
