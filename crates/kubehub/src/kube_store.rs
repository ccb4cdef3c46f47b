use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Discovery},
    Client,
};
use metrics::histogram;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    ApplyOptions, DeleteOptions, GroupKind, MappingResolver, ResourceMapping, ResourceStore,
    Scope, StoreError,
};

/// kube-rs backed store and resolver.
///
/// Discovery runs lazily on first resolve and is cached. A miss re-runs it
/// once so kinds installed after startup (new CRDs) become resolvable.
pub struct KubeStore {
    client: Client,
    discovery: Mutex<Option<Arc<Discovery>>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: Mutex::new(None) }
    }

    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>, StoreError> {
        let mut guard = self.discovery.lock().await;
        if !refresh {
            if let Some(d) = guard.as_ref() {
                return Ok(Arc::clone(d));
            }
        }
        let t0 = std::time::Instant::now();
        let d = Arc::new(Discovery::new(self.client.clone()).run().await?);
        histogram!("kubehub_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(groups = d.groups().count(), refresh, "discovery completed");
        *guard = Some(Arc::clone(&d));
        Ok(d)
    }

    fn api(&self, mapping: &ResourceMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(mapping);
        match (mapping.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_resource(mapping: &ResourceMapping) -> ApiResource {
    ApiResource {
        group: mapping.group.clone(),
        version: mapping.version.clone(),
        api_version: mapping.api_version(),
        kind: mapping.kind.clone(),
        plural: mapping.plural.clone(),
    }
}

fn lookup(d: &Discovery, gk: &GroupKind, version: Option<&str>) -> Option<ResourceMapping> {
    let found = match version {
        Some(v) => d.resolve_gvk(&GroupVersionKind::gvk(&gk.group, v, &gk.kind)),
        None => d.get(&gk.group).and_then(|g| g.recommended_kind(&gk.kind)),
    };
    found.map(|(ar, caps)| ResourceMapping {
        group: ar.group,
        version: ar.version,
        kind: ar.kind,
        plural: ar.plural,
        scope: match caps.scope {
            discovery::Scope::Namespaced => Scope::Namespaced,
            discovery::Scope::Cluster => Scope::Cluster,
        },
    })
}

#[async_trait]
impl MappingResolver for KubeStore {
    async fn resolve(
        &self,
        group_kind: &GroupKind,
        version: Option<&str>,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let d = self.discovery(false).await?;
        if let Some(m) = lookup(&d, group_kind, version) {
            return Ok(Some(m));
        }
        debug!(gk = %group_kind, ?version, "kind not in cached discovery; refreshing");
        let d = self.discovery(true).await?;
        Ok(lookup(&d, group_kind, version))
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.api(mapping, namespace).get_opt(name).await?)
    }

    async fn apply(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        body: &serde_json::Value,
        opts: &ApplyOptions,
    ) -> Result<DynamicObject, StoreError> {
        let mut pp = PatchParams::apply(&opts.field_manager);
        if opts.force {
            pp = pp.force();
        }
        if opts.dry_run {
            pp = pp.dry_run();
        }
        let api = self.api(mapping, namespace);
        Ok(api.patch(name, &pp, &Patch::Apply(body)).await?)
    }

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), StoreError> {
        let dp = DeleteParams { dry_run: opts.dry_run, ..Default::default() };
        self.api(mapping, namespace).delete(name, &dp).await?;
        Ok(())
    }

    async fn list(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let lp = ListParams::default().labels(label_selector);
        let list = self.api(mapping, namespace).list(&lp).await?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_carries_full_api_version() {
        let m = ResourceMapping::new("apps", "v1", "Deployment", "deployments", Scope::Namespaced);
        let ar = api_resource(&m);
        assert_eq!(ar.api_version, "apps/v1");
        assert_eq!(ar.plural, "deployments");
        let core = ResourceMapping::new("", "v1", "Secret", "secrets", Scope::Namespaced);
        assert_eq!(api_resource(&core).api_version, "v1");
    }
}
