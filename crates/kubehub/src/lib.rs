//! konverge kubehub: the remote-store boundary.
//!
//! The engine talks to the API server only through [`ResourceStore`] and
//! [`MappingResolver`]. [`KubeStore`] backs both with kube-rs; [`MemoryStore`]
//! is an in-process stand-in with server-side-apply-like semantics.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

pub use konverge_core::{GroupKind, ResourceMapping, Scope};

mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{resource} {name:?} not found")]
    NotFound { resource: String, name: String },
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("discovery error: {0}")]
    Discovery(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Kube(kube::Error::Api(ae)) => ae.code == 404,
            StoreError::Api { code, .. } => *code == 404,
            _ => false,
        }
    }
}

/// Options for a server-side apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub dry_run: bool,
}

/// Object operations against one resolved resource mapping.
///
/// `namespace` is ignored for cluster-scoped mappings. For `list`, `None`
/// on a namespaced mapping means all namespaces.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    async fn apply(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        body: &serde_json::Value,
        opts: &ApplyOptions,
    ) -> Result<DynamicObject, StoreError>;

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), StoreError>;

    async fn list(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError>;
}

/// Maps a group-kind to the resource that serves it.
#[async_trait]
pub trait MappingResolver: Send + Sync {
    /// `version: None` picks the server's preferred version.
    /// `Ok(None)` means the kind is not served.
    async fn resolve(
        &self,
        group_kind: &GroupKind,
        version: Option<&str>,
    ) -> Result<Option<ResourceMapping>, StoreError>;
}

/// Human readable `plural[.group]` used in errors and logs.
pub fn resource_label(mapping: &ResourceMapping) -> String {
    if mapping.group.is_empty() {
        mapping.plural.clone()
    } else {
        format!("{}.{}", mapping.plural, mapping.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_classified_across_variants() {
        assert!(StoreError::NotFound { resource: "configmaps".into(), name: "x".into() }.is_not_found());
        assert!(StoreError::Api { code: 404, message: "gone".into() }.is_not_found());
        assert!(!StoreError::Api { code: 409, message: "conflict".into() }.is_not_found());
        assert!(!StoreError::Discovery("boom".into()).is_not_found());
    }

    #[test]
    fn resource_label_includes_group() {
        let m = ResourceMapping::new("apps", "v1", "Deployment", "deployments", Scope::Namespaced);
        assert_eq!(resource_label(&m), "deployments.apps");
        let m = ResourceMapping::new("", "v1", "ConfigMap", "configmaps", Scope::Namespaced);
        assert_eq!(resource_label(&m), "configmaps");
    }
}
