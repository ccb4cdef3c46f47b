use konverge_core::{parse_uid, GroupKind, ResourceMapping, Uid};
use konverge_kubehub::{MappingResolver, ResourceStore};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::error::ApplySetError;
use crate::labels::{OwnerScope, PART_OF_LABEL};
use crate::result::PruneObject;

/// List every object labeled as a member of `set_id` within `scope`, minus `keep`.
///
/// Namespaced kinds are listed once per scope namespace, cluster-scoped kinds
/// once. Kinds the server no longer serves are skipped.
pub(crate) async fn find_prune_candidates(
    resolver: &dyn MappingResolver,
    store: &dyn ResourceStore,
    known: &FxHashMap<GroupKind, ResourceMapping>,
    scope: &OwnerScope,
    set_id: &str,
    keep: &FxHashSet<Uid>,
) -> Result<Vec<PruneObject>, ApplySetError> {
    let selector = format!("{PART_OF_LABEL}={set_id}");
    let mut seen: FxHashSet<Uid> = FxHashSet::default();
    let mut out = Vec::new();

    for gk in scope.parsed_group_kinds() {
        let mapping = match known.get(&gk) {
            Some(m) => m.clone(),
            None => match resolver.resolve(&gk, None).await {
                Ok(Some(m)) => m,
                Ok(None) => {
                    warn!(gk = %gk, "kind recorded in owner scope is no longer served; skipping");
                    continue;
                }
                Err(source) => {
                    return Err(ApplySetError::PruneDiscovery { group_kind: gk.to_string(), source })
                }
            },
        };

        let namespaces: Vec<Option<&str>> = if mapping.namespaced() {
            scope.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        } else {
            vec![None]
        };

        for ns in namespaces {
            let items = store
                .list(&mapping, ns, &selector)
                .await
                .map_err(|source| ApplySetError::PruneDiscovery { group_kind: gk.to_string(), source })?;
            debug!(gk = %gk, ns = ?ns, listed = items.len(), "listed set members");
            for obj in items {
                let Some(uid) = obj.metadata.uid.as_deref().and_then(|u| parse_uid(u).ok()) else {
                    warn!(gk = %gk, name = ?obj.metadata.name, "listed object has no usable uid; skipping");
                    continue;
                };
                if keep.contains(&uid) || !seen.insert(uid) {
                    continue;
                }
                out.push(PruneObject {
                    mapping: mapping.clone(),
                    namespace: obj.metadata.namespace.clone().filter(|s| !s.is_empty()),
                    name: obj.metadata.name.clone().unwrap_or_default(),
                    uid,
                    object: obj,
                });
            }
        }
    }
    Ok(out)
}
