//! konverge apply: set-based server-side apply with label-driven pruning.
//!
//! An [`ApplySet`] is anchored on an owner object. Children carry the owner's
//! set id as a label; the owner records which group-kinds and namespaces the
//! set has touched, so a later pass can find and delete children it no longer
//! wants.

#![forbid(unsafe_code)]

mod applyset;
mod config;
mod error;
pub mod labels;
mod object;
mod prune;
mod result;
mod tracker;

pub use applyset::ApplySet;
pub use config::{AfterApplyCallback, ApplySetConfig, ApplySetTooling, BeforePruneCallback, LoadCallback};
pub use error::{Aborted, AggregateError, ApplySetError, CallbackPhase};
pub use labels::{compute_set_id, OwnerScope};
pub use object::{Applyable, ApplyableObject};
pub use result::{AppliedObject, ApplyResult, PruneObject, PrunedObject};
pub use tracker::Tracker;

pub use konverge_kubehub::{
    ApplyOptions, DeleteOptions, KubeStore, MappingResolver, MemoryStore, ResourceStore, StoreError,
};
