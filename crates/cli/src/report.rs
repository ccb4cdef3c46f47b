//! Rendering of pass results for the terminal.

use konverge_apply::ApplyResult;
use konverge_core::format_uid;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct AppliedRow {
    pub object: String,
    pub uid: Option<String>,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PrunedRow {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PassReport {
    pub set_id: String,
    pub dry_run: bool,
    pub applied: Vec<AppliedRow>,
    pub pruned: Vec<PrunedRow>,
}

impl PassReport {
    pub fn new(set_id: &str, dry_run: bool, result: &ApplyResult) -> Self {
        let applied = result
            .applied_objects
            .iter()
            .map(|a| AppliedRow {
                object: a.object.key().to_string(),
                uid: a.uid().map(|u| format_uid(&u)),
                changed: a.has_cluster_mutation(),
                error: a.error.as_ref().map(ToString::to_string),
            })
            .collect();
        let pruned = result
            .pruned_objects
            .iter()
            .map(|p| PrunedRow {
                kind: p.object.mapping.group_kind().to_string(),
                namespace: p.object.namespace.clone(),
                name: p.object.name.clone(),
                uid: format_uid(&p.object.uid),
                error: p.error.as_ref().map(ToString::to_string),
            })
            .collect();
        Self { set_id: set_id.to_string(), dry_run, applied, pruned }
    }

    pub fn human_lines(&self) -> Vec<String> {
        let suffix = if self.dry_run { " (dry run)" } else { "" };
        let mut lines = Vec::with_capacity(self.applied.len() + self.pruned.len());
        for a in &self.applied {
            let line = match (&a.error, a.changed) {
                (Some(e), _) => format!("{} failed: {}", a.object, e),
                (None, true) => format!("{} configured{}", a.object, suffix),
                (None, false) => format!("{} unchanged{}", a.object, suffix),
            };
            lines.push(line);
        }
        for p in &self.pruned {
            let target = match &p.namespace {
                Some(ns) => format!("{} {}/{}", p.kind, ns, p.name),
                None => format!("{} {}", p.kind, p.name),
            };
            match &p.error {
                Some(e) => lines.push(format!("{target} prune failed: {e}")),
                None => lines.push(format!("{target} pruned{suffix}")),
            }
        }
        lines
    }
}
