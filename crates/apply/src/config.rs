use std::collections::BTreeMap;
use std::fmt;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::error::ApplySetError;
use crate::object::ApplyableObject;
use crate::result::{AppliedObject, PrunedObject};

/// Name and version of the tool writing the set, recorded on the owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySetTooling {
    pub name: String,
    pub version: String,
}

impl ApplySetTooling {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into() }
    }
}

impl fmt::Display for ApplySetTooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Called from `add` with the tracked object and its live state, if any.
pub type LoadCallback =
    Box<dyn Fn(&ApplyableObject, Option<&DynamicObject>) -> anyhow::Result<()> + Send + Sync>;
/// Called after every successful apply.
pub type AfterApplyCallback = Box<dyn Fn(&AppliedObject) -> anyhow::Result<()> + Send + Sync>;
/// Called before each prune delete.
pub type BeforePruneCallback = Box<dyn Fn(&PrunedObject) -> anyhow::Result<()> + Send + Sync>;

/// Engine configuration. Any callback error aborts the current pass.
#[derive(Default)]
pub struct ApplySetConfig {
    /// Labels stamped on every child.
    pub tool_labels: BTreeMap<String, String>,
    pub field_manager: String,
    pub tooling: ApplySetTooling,
    pub load_callback: Option<LoadCallback>,
    pub after_apply_callback: Option<AfterApplyCallback>,
    pub before_prune_callback: Option<BeforePruneCallback>,
}

impl ApplySetConfig {
    pub fn new(field_manager: impl Into<String>, tooling: ApplySetTooling) -> Self {
        Self { field_manager: field_manager.into(), tooling, ..Default::default() }
    }

    pub fn with_tool_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tool_labels.insert(key.into(), value.into());
        self
    }

    pub fn on_load<F>(mut self, f: F) -> Self
    where
        F: Fn(&ApplyableObject, Option<&DynamicObject>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.load_callback = Some(Box::new(f));
        self
    }

    pub fn after_apply<F>(mut self, f: F) -> Self
    where
        F: Fn(&AppliedObject) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.after_apply_callback = Some(Box::new(f));
        self
    }

    pub fn before_prune<F>(mut self, f: F) -> Self
    where
        F: Fn(&PrunedObject) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_prune_callback = Some(Box::new(f));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ApplySetError> {
        if self.tooling.name.is_empty() || self.tooling.version.is_empty() {
            return Err(ApplySetError::ConfigInvalid("tooling name and version are required".into()));
        }
        if self.field_manager.is_empty() {
            return Err(ApplySetError::ConfigInvalid("field manager is required".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ApplySetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplySetConfig")
            .field("tool_labels", &self.tool_labels)
            .field("field_manager", &self.field_manager)
            .field("tooling", &self.tooling)
            .field("load_callback", &self.load_callback.is_some())
            .field("after_apply_callback", &self.after_apply_callback.is_some())
            .field("before_prune_callback", &self.before_prune_callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tooling_renders_name_slash_version() {
        assert_eq!(ApplySetTooling::new("konvergectl", "0.1.0").to_string(), "konvergectl/0.1.0");
    }

    #[test]
    fn validate_requires_manager_and_tooling() {
        assert!(ApplySetConfig::new("mgr", ApplySetTooling::new("t", "v1")).validate().is_ok());
        let err = ApplySetConfig::new("", ApplySetTooling::new("t", "v1")).validate().unwrap_err();
        assert!(err.to_string().contains("field manager"));
        let err = ApplySetConfig::new("mgr", ApplySetTooling::new("t", "")).validate().unwrap_err();
        assert!(err.to_string().contains("tooling"));
    }
}
