use std::fmt;

use konverge_core::ObjectKey;
use konverge_kubehub::StoreError;

use crate::result::ApplyResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPhase {
    Load,
    AfterApply,
    BeforePrune,
}

impl fmt::Display for CallbackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackPhase::Load => "load",
            CallbackPhase::AfterApply => "after-apply",
            CallbackPhase::BeforePrune => "before-prune",
        })
    }
}

/// Errors that stop an `add` call or a whole pass.
///
/// Per-object apply and delete failures are not here; they are recorded in
/// [`ApplyResult`] and surfaced through [`ApplyResult::apply_errors`] and
/// [`ApplyResult::prune_errors`].
#[derive(Debug, thiserror::Error)]
pub enum ApplySetError {
    #[error("invalid applyset config: {0}")]
    ConfigInvalid(String),

    #[error("duplicate object {key}")]
    DuplicateRemoteIdentity { key: ObjectKey },

    #[error("duplicate object id {id:?} ({key})")]
    DuplicateCallerId { id: String, key: ObjectKey },

    #[error("object {key} is not json serializable: {source}")]
    NotSerializable {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("rest mapping not found for {gvk}")]
    MappingNotFound { gvk: String },

    #[error("{reason}: {key}")]
    ScopeMismatch { key: ObjectKey, reason: &'static str },

    #[error("{context}: {source}")]
    Remote {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("unable to update owner: {source}")]
    OwnerUpdate {
        #[source]
        source: StoreError,
    },

    #[error("listing prune candidates for {group_kind}: {source}")]
    PruneDiscovery {
        group_kind: String,
        #[source]
        source: StoreError,
    },

    #[error("pass deadline exceeded {during}")]
    DeadlineExceeded { during: String },

    #[error("error from {phase} callback: {source}")]
    Callback {
        phase: CallbackPhase,
        #[source]
        source: anyhow::Error,
    },
}

/// Every per-object failure of one phase, joined.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .errors.join("\n"))]
pub struct AggregateError {
    pub errors: Vec<String>,
}

impl AggregateError {
    pub(crate) fn check(errors: Vec<String>) -> Result<(), AggregateError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { errors })
        }
    }
}

/// A pass that stopped on a fatal error, with whatever was recorded before it.
#[derive(Debug, thiserror::Error)]
#[error(
    "apply pass aborted ({} applied, {} pruned)",
    .result.applied_objects.len(),
    .result.pruned_objects.len()
)]
pub struct Aborted {
    pub result: ApplyResult,
    #[source]
    pub error: ApplySetError,
}
