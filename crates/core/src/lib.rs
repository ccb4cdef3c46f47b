//! konverge core types: plain values shared by the store boundary and the engine.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Binary form of a remote object's `metadata.uid`.
pub type Uid = [u8; 16];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    GvkKey(String),
    #[error("invalid uid {0:?}")]
    Uid(String),
    #[error("invalid group-kind {0:?}")]
    GroupKind(String),
}

/// Kind plus API group, version-less.
///
/// Renders as `Kind` for the core group and `Kind.group` otherwise, which is
/// the encoding stored in owner annotations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

impl FromStr for GroupKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, group) = match s.split_once('.') {
            Some((k, g)) => (k, g),
            None => (s, ""),
        };
        if kind.is_empty() {
            return Err(CoreError::GroupKind(s.to_string()));
        }
        Ok(Self::new(group, kind))
    }
}

/// Server-side identity of an object within one pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group_kind: GroupKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.group_kind, ns, self.name),
            None => write!(f, "{} {}", self.group_kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// How a kind is served by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name, e.g. `deployments`.
    pub plural: String,
    pub scope: Scope,
}

impl ResourceMapping {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, scope: Scope) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            scope,
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn namespaced(&self) -> bool {
        matches!(self.scope, Scope::Namespaced)
    }
}

/// Split an `apiVersion` string into `(group, version)`.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Parse `v1/Kind` or `group/v1/Kind` into `(group, version, kind)`.
pub fn parse_gvk_key(key: &str) -> Result<(String, String, String), CoreError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok((String::new(), (*version).to_string(), (*kind).to_string()))
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(((*group).to_string(), (*version).to_string(), (*kind).to_string()))
        }
        _ => Err(CoreError::GvkKey(key.to_string())),
    }
}

pub fn parse_uid(uid_str: &str) -> Result<Uid, CoreError> {
    let u = Uuid::parse_str(uid_str).map_err(|_| CoreError::Uid(uid_str.to_string()))?;
    Ok(*u.as_bytes())
}

pub fn format_uid(uid: &Uid) -> String {
    Uuid::from_bytes(*uid).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_kind_renders_core_and_named_groups() {
        assert_eq!(GroupKind::new("", "ConfigMap").to_string(), "ConfigMap");
        assert_eq!(GroupKind::new("apps", "Deployment").to_string(), "Deployment.apps");
        assert_eq!(
            GroupKind::new("cert-manager.io", "Certificate").to_string(),
            "Certificate.cert-manager.io"
        );
    }

    #[test]
    fn group_kind_parses_back() {
        let gk: GroupKind = "Certificate.cert-manager.io".parse().unwrap();
        assert_eq!(gk, GroupKind::new("cert-manager.io", "Certificate"));
        let core: GroupKind = "Secret".parse().unwrap();
        assert_eq!(core, GroupKind::new("", "Secret"));
        assert!("".parse::<GroupKind>().is_err());
        assert!(".apps".parse::<GroupKind>().is_err());
    }

    #[test]
    fn object_key_display_includes_namespace_when_present() {
        let k = ObjectKey { group_kind: GroupKind::new("apps", "Deployment"), namespace: Some("ns".into()), name: "web".into() };
        assert_eq!(k.to_string(), "Deployment.apps ns/web");
        let c = ObjectKey { group_kind: GroupKind::new("", "Namespace"), namespace: None, name: "ns".into() };
        assert_eq!(c.to_string(), "Namespace ns");
    }

    #[test]
    fn mapping_api_version() {
        let m = ResourceMapping::new("", "v1", "ConfigMap", "configmaps", Scope::Namespaced);
        assert_eq!(m.api_version(), "v1");
        assert!(m.namespaced());
        let m = ResourceMapping::new("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", Scope::Cluster);
        assert_eq!(m.api_version(), "rbac.authorization.k8s.io/v1");
        assert!(!m.namespaced());
    }

    #[test]
    fn parse_gvk_key_parses_core_and_group() {
        assert_eq!(parse_gvk_key("v1/ConfigMap").unwrap(), (String::new(), "v1".into(), "ConfigMap".into()));
        assert_eq!(parse_gvk_key("apps/v1/Deployment").unwrap(), ("apps".into(), "v1".into(), "Deployment".into()));
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn uid_round_trips_through_text() {
        let s = "6f1d7a9e-2b7c-4c1e-9d0a-3f5b8e2c1a40";
        let uid = parse_uid(s).unwrap();
        assert_eq!(format_uid(&uid), s);
        assert!(parse_uid("not-a-uid").is_err());
    }

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(split_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
    }
}
