//! Manifest loading: multi-document YAML into desired objects.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::Value as Json;

/// Size guards for manifest input.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl Limits {
    /// `KONVERGE_MAX_YAML_BYTES` and `KONVERGE_MAX_YAML_NODES` override the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_bytes: env_usize("KONVERGE_MAX_YAML_BYTES").unwrap_or(d.max_bytes),
            max_nodes: env_usize("KONVERGE_MAX_YAML_NODES").unwrap_or(d.max_nodes),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok())
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Expand `paths` into manifest files: directories contribute their
/// `.yaml`/`.yml`/`.json` entries in name order.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for p in paths {
        if p.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(p)
                .with_context(|| format!("reading directory {}", p.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|e| matches!(e.extension().and_then(|x| x.to_str()), Some("yaml" | "yml" | "json")))
                .collect();
            entries.sort();
            out.extend(entries);
        } else {
            out.push(p.clone());
        }
    }
    Ok(out)
}

pub fn load_file(path: &Path, limits: Limits) -> Result<Vec<DynamicObject>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_documents(&text, limits).with_context(|| format!("parsing {}", path.display()))
}

/// Parse every non-empty YAML document in `text`.
pub fn parse_documents(text: &str, limits: Limits) -> Result<Vec<DynamicObject>> {
    if text.len() > limits.max_bytes {
        return Err(anyhow!("YAML payload too large (>{} bytes)", limits.max_bytes));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {idx}: parsing YAML"))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("document {idx}: converting YAML to JSON"))?;
        out.push(to_object(json, limits).with_context(|| format!("document {idx}"))?);
    }
    Ok(out)
}

fn to_object(json: Json, limits: Limits) -> Result<DynamicObject> {
    if node_budget_exceeded(&json, limits.max_nodes) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", limits.max_nodes));
    }
    let field = |path: &[&str]| {
        path.iter().try_fold(&json, |v, k| v.get(*k)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    };
    field(&["apiVersion"]).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    field(&["kind"]).ok_or_else(|| anyhow!("YAML missing kind"))?;
    field(&["metadata", "name"]).ok_or_else(|| anyhow!("YAML missing metadata.name"))?;
    serde_json::from_value(json).context("decoding object")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_input_skips_empty_documents() {
        let y = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: ns\ndata:\n  k: v\n---\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n";
        let objs = parse_documents(y, Limits::default()).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].metadata.name.as_deref(), Some("a"));
        assert_eq!(objs[0].data["data"]["k"], "v");
        assert_eq!(objs[1].types.as_ref().unwrap().api_version, "apps/v1");
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let e1 = parse_documents("kind: Foo\nmetadata:\n  name: x\n", Limits::default()).unwrap_err();
        assert!(format!("{e1:#}").contains("missing apiVersion"), "{e1:#}");
        let e2 = parse_documents("apiVersion: v1\nmetadata:\n  name: x\n", Limits::default()).unwrap_err();
        assert!(format!("{e2:#}").contains("missing kind"), "{e2:#}");
        let e3 = parse_documents("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", Limits::default()).unwrap_err();
        assert!(format!("{e3:#}").contains("missing metadata.name"), "{e3:#}");
    }

    #[test]
    fn size_guards_apply() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  a: b\n  c: d\n";
        let tiny = Limits { max_bytes: 10, max_nodes: 100 };
        assert!(parse_documents(y, tiny).unwrap_err().to_string().contains("too large"));
        let shallow = Limits { max_bytes: 1_000, max_nodes: 4 };
        assert!(format!("{:#}", parse_documents(y, shallow).unwrap_err()).contains("too complex"));
    }
}
