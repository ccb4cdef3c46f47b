//! Set identity and the labels/annotations that record set membership.
//!
//! Keys and value encodings are shared with kubectl's ApplySet; anything that
//! reads or writes the same objects must use them verbatim.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use konverge_core::GroupKind;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Stamped on every owned child; value is the set id.
pub const PART_OF_LABEL: &str = "applyset.kubernetes.io/part-of";
/// Stamped on the owner; value is the set id.
pub const PARENT_ID_LABEL: &str = "applyset.kubernetes.io/id";
pub const TOOLING_ANNOTATION: &str = "applyset.kubernetes.io/tooling";
pub const GROUP_KINDS_ANNOTATION: &str = "applyset.kubernetes.io/contains-group-kinds";
pub const NAMESPACES_ANNOTATION: &str = "applyset.kubernetes.io/additional-namespaces";

/// Field manager for owner label/annotation commits.
pub const PARENT_FIELD_MANAGER: &str = "konverge-parent-labeller";

const ID_PART_DELIMITER: &str = ".";

/// `applyset-<base64url(sha256(name.namespace.kind.group))>-v1`.
///
/// Label values must start and end alphanumeric, hence the fixed prefix and suffix.
pub fn compute_set_id(name: &str, namespace: &str, kind: &str, group: &str) -> String {
    let unencoded = [name, namespace, kind, group].join(ID_PART_DELIMITER);
    let hashed = Sha256::digest(unencoded.as_bytes());
    format!("applyset-{}-v1", URL_SAFE_NO_PAD.encode(hashed))
}

/// Tool labels win on conflict.
pub fn inject_tool_labels(labels: &mut BTreeMap<String, String>, tool_labels: &BTreeMap<String, String>) {
    for (k, v) in tool_labels {
        labels.insert(k.clone(), v.clone());
    }
}

pub fn inject_membership_label(labels: &mut BTreeMap<String, String>, set_id: &str) {
    labels.insert(PART_OF_LABEL.to_string(), set_id.to_string());
}

/// Group-kinds and namespaces a set has touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerScope {
    pub group_kinds: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
}

fn split_list(v: Option<&String>) -> BTreeSet<String> {
    v.map(|s| s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

impl OwnerScope {
    /// Read the scope recorded in owner annotations. Empty fragments are ignored.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            group_kinds: split_list(annotations.get(GROUP_KINDS_ANNOTATION)),
            namespaces: split_list(annotations.get(NAMESPACES_ANNOTATION)),
        }
    }

    pub fn insert_group_kind(&mut self, gk: &GroupKind) {
        self.group_kinds.insert(gk.to_string());
    }

    pub fn insert_namespace(&mut self, ns: &str) {
        if !ns.is_empty() {
            self.namespaces.insert(ns.to_string());
        }
    }

    pub fn union(&self, other: &OwnerScope) -> OwnerScope {
        OwnerScope {
            group_kinds: self.group_kinds.union(&other.group_kinds).cloned().collect(),
            namespaces: self.namespaces.union(&other.namespaces).cloned().collect(),
        }
    }

    /// Recorded group-kinds, skipping entries that do not parse.
    pub fn parsed_group_kinds(&self) -> Vec<GroupKind> {
        self.group_kinds
            .iter()
            .filter_map(|s| match s.parse::<GroupKind>() {
                Ok(gk) => Some(gk),
                Err(e) => {
                    warn!(value = %s, error = %e, "ignoring malformed group-kind in owner scope");
                    None
                }
            })
            .collect()
    }

    pub fn group_kinds_value(&self) -> String {
        self.group_kinds.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }

    pub fn namespaces_value(&self) -> String {
        self.namespaces.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }
}

/// Scope annotations for the owner.
///
/// With `include_current` (superset mode) the result is the union of what is
/// recorded in `current` and `desired`; otherwise (latest mode) exactly `desired`.
/// Both values are sorted, comma-joined lists.
pub fn desired_owner_annotations(
    current: &BTreeMap<String, String>,
    desired: &OwnerScope,
    include_current: bool,
) -> BTreeMap<String, String> {
    let scope = if include_current {
        OwnerScope::from_annotations(current).union(desired)
    } else {
        desired.clone()
    };
    let mut out = BTreeMap::new();
    out.insert(GROUP_KINDS_ANNOTATION.to_string(), scope.group_kinds_value());
    out.insert(NAMESPACES_ANNOTATION.to_string(), scope.namespaces_value());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_id_matches_pinned_encoding() {
        assert_eq!(
            compute_set_id("app", "ns1", "Foo", "g"),
            "applyset-z_wNIjVGojznounzRV_Ac5T97_em6GsHvEhSzaJkQGM-v1"
        );
        assert_eq!(
            compute_set_id("app", "", "Foo", "g"),
            "applyset-FZGfsnfmjwRmd7KUiAzB1j4LcbzLPsbz35aWFbbGTb0-v1"
        );
    }

    #[test]
    fn set_id_is_pure_and_sensitive_to_every_field() {
        let base = compute_set_id("app", "ns1", "Foo", "g");
        assert_eq!(base, compute_set_id("app", "ns1", "Foo", "g"));
        let variants = [
            compute_set_id("app2", "ns1", "Foo", "g"),
            compute_set_id("app", "ns2", "Foo", "g"),
            compute_set_id("app", "ns1", "Bar", "g"),
            compute_set_id("app", "ns1", "Foo", "h"),
        ];
        let mut seen = BTreeSet::new();
        seen.insert(base.clone());
        for v in variants {
            assert!(v.starts_with("applyset-") && v.ends_with("-v1"));
            assert!(seen.insert(v), "collision in tested corpus");
        }
    }

    #[test]
    fn tool_labels_overwrite_and_membership_is_set() {
        let mut labels = BTreeMap::from([("team".to_string(), "a".to_string()), ("keep".to_string(), "x".to_string())]);
        let tool = BTreeMap::from([("team".to_string(), "platform".to_string())]);
        inject_tool_labels(&mut labels, &tool);
        inject_membership_label(&mut labels, "applyset-abc-v1");
        assert_eq!(labels["team"], "platform");
        assert_eq!(labels["keep"], "x");
        assert_eq!(labels[PART_OF_LABEL], "applyset-abc-v1");
    }

    #[test]
    fn superset_mode_unions_recorded_and_new_scope() {
        let current = BTreeMap::from([
            (GROUP_KINDS_ANNOTATION.to_string(), "X.g".to_string()),
            (NAMESPACES_ANNOTATION.to_string(), "old".to_string()),
        ]);
        let mut desired = OwnerScope::default();
        desired.insert_group_kind(&GroupKind::new("", "ConfigMap"));
        desired.insert_namespace("new");
        let out = desired_owner_annotations(&current, &desired, true);
        assert_eq!(out[GROUP_KINDS_ANNOTATION], "ConfigMap,X.g");
        assert_eq!(out[NAMESPACES_ANNOTATION], "new,old");
    }

    #[test]
    fn latest_mode_drops_recorded_scope() {
        let current = BTreeMap::from([
            (GROUP_KINDS_ANNOTATION.to_string(), "X.g".to_string()),
            (NAMESPACES_ANNOTATION.to_string(), "old".to_string()),
        ]);
        let mut desired = OwnerScope::default();
        desired.insert_group_kind(&GroupKind::new("g", "Y"));
        desired.insert_namespace("new");
        let out = desired_owner_annotations(&current, &desired, false);
        assert_eq!(out[GROUP_KINDS_ANNOTATION], "Y.g");
        assert_eq!(out[NAMESPACES_ANNOTATION], "new");
    }

    #[test]
    fn empty_annotation_values_yield_empty_scope() {
        let current = BTreeMap::from([
            (GROUP_KINDS_ANNOTATION.to_string(), "".to_string()),
            (NAMESPACES_ANNOTATION.to_string(), ",".to_string()),
        ]);
        let scope = OwnerScope::from_annotations(&current);
        assert!(scope.group_kinds.is_empty());
        assert!(scope.namespaces.is_empty());
        let out = desired_owner_annotations(&current, &OwnerScope::default(), true);
        assert_eq!(out[GROUP_KINDS_ANNOTATION], "");
    }

    #[test]
    fn parsed_group_kinds_round_trip() {
        let mut s = OwnerScope::default();
        s.insert_group_kind(&GroupKind::new("apps", "Deployment"));
        s.insert_group_kind(&GroupKind::new("", "Secret"));
        assert_eq!(s.parsed_group_kinds(), vec![GroupKind::new("apps", "Deployment"), GroupKind::new("", "Secret")]);
    }
}
