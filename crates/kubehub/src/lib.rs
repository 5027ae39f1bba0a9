//! Drover kubehub: kube client, API discovery and the ConfigMap-backed release history store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use drover_core::{labels, KubernetesResourceId};
use drover_persist::{HistoryStore, SaveMode, ScopeKey, StoredDocument, VersionConflict};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared client built from kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(client.clone())
}

/// `apiVersion` + `kind` as found in a manifest.
pub fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind { group: group.into(), version: version.into(), kind: kind.into() },
        None => GroupVersionKind { group: String::new(), version: api_version.into(), kind: kind.into() },
    }
}

/// Resolves kinds to API resources. Discovery runs once per resolver.
pub struct ApiResolver {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: OnceCell::new() }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                let started = std::time::Instant::now();
                let d = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "discovery complete");
                Ok::<_, anyhow::Error>(d)
            })
            .await
    }

    pub async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let discovery = self.discovery().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }

    /// Resolve by kind alone, preferring the core and `apps` groups.
    pub async fn find_by_kind(&self, kind: &str) -> Result<(ApiResource, bool)> {
        let discovery = self.discovery().await?;
        let mut found: Vec<(ApiResource, bool)> = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.kind == kind {
                    found.push((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                }
            }
        }
        found.sort_by_key(|(ar, _)| match ar.group.as_str() {
            "" => 0,
            "apps" => 1,
            _ => 2,
        });
        found.into_iter().next().ok_or_else(|| anyhow!("kind not served by cluster: {}", kind))
    }

    /// Dynamic API handle for one object, namespaced when the kind is.
    pub async fn api_for(&self, id: &KubernetesResourceId, api_version: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = match api_version {
            Some(av) => self.find_api_resource(&gvk_of(av, &id.kind)).await?,
            None => self.find_by_kind(&id.kind).await?,
        };
        if namespaced {
            let ns = id.namespace.as_deref().ok_or_else(|| anyhow!("namespace required for namespaced kind {}", id.kind))?;
            Ok(Api::namespaced_with(self.client.clone(), ns, &ar))
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

pub const HISTORY_DATA_KEY: &str = "releaseHistory";

pub fn history_configmap_name(release_name: &str) -> String {
    format!("{}-release-history", release_name)
}

/// Release history kept in a labelled ConfigMap per release name.
/// The version token is the ConfigMap `resourceVersion`.
pub struct ConfigMapStore {
    client: Client,
}

impl ConfigMapStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ScopeKey) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    fn build(key: &ScopeKey, document: &str, resource_version: Option<String>) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(HISTORY_DATA_KEY.to_string(), document.to_string());
        let mut lbls = BTreeMap::new();
        lbls.insert(labels::RELEASE_HISTORY.to_string(), "true".to_string());
        lbls.insert(labels::RELEASE_NAME.to_string(), key.release_name.clone());
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(history_configmap_name(&key.release_name)),
                namespace: Some(key.namespace.clone()),
                labels: Some(lbls),
                resource_version,
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

fn conflict(key: &ScopeKey, expected: Option<String>, found: Option<String>) -> anyhow::Error {
    VersionConflict { scope: key.to_string(), expected, found }.into()
}

#[async_trait::async_trait]
impl HistoryStore for ConfigMapStore {
    async fn fetch(&self, key: &ScopeKey) -> Result<Option<StoredDocument>> {
        let name = history_configmap_name(&key.release_name);
        let cm = self.api(key).get_opt(&name).await.with_context(|| format!("reading ConfigMap {}/{}", key.namespace, name))?;
        Ok(cm.map(|cm| StoredDocument {
            document: cm.data.and_then(|mut d| d.remove(HISTORY_DATA_KEY)).unwrap_or_default(),
            version: cm.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn save(&self, key: &ScopeKey, document: &str, mode: SaveMode) -> Result<String> {
        let api = self.api(key);
        let name = history_configmap_name(&key.release_name);
        let live = api.get_opt(&name).await.with_context(|| format!("reading ConfigMap {}/{}", key.namespace, name))?;
        let live_rv = live.as_ref().and_then(|cm| cm.metadata.resource_version.clone());
        let pp = PostParams::default();
        let result = match (&mode, live) {
            (SaveMode::IfVersion(Some(expected)), None) => return Err(conflict(key, Some(expected.clone()), None)),
            (SaveMode::IfVersion(None), Some(_)) => return Err(conflict(key, None, live_rv)),
            (_, None) => api.create(&pp, &Self::build(key, document, None)).await,
            (SaveMode::IfVersion(Some(expected)), Some(_)) => {
                // resourceVersion on replace makes the API server reject stale writers
                api.replace(&name, &pp, &Self::build(key, document, Some(expected.clone()))).await
            }
            (SaveMode::Overwrite, Some(_)) => api.replace(&name, &pp, &Self::build(key, document, live_rv.clone())).await,
        };
        match result {
            Ok(cm) => {
                counter!("persist_put_total", 1u64);
                let rv = cm.metadata.resource_version.unwrap_or_default();
                info!(scope = %key, rv = %rv, "release history ConfigMap written");
                Ok(rv)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let expected = match mode {
                    SaveMode::IfVersion(v) => v,
                    SaveMode::Overwrite => live_rv.clone(),
                };
                Err(conflict(key, expected, None))
            }
            Err(e) => Err(anyhow!(e)).with_context(|| format!("writing ConfigMap {}/{}", key.namespace, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_of_splits_api_version() {
        let g = gvk_of("apps/v1", "Deployment");
        assert_eq!(g.group, "apps");
        assert_eq!(g.version, "v1");
        let g = gvk_of("v1", "Service");
        assert!(g.group.is_empty());
    }

    #[test]
    fn history_configmap_is_labelled() {
        let key = ScopeKey::new("prod", "web");
        let cm = ConfigMapStore::build(&key, "version: v1\n", None);
        assert_eq!(cm.metadata.name.as_deref(), Some("web-release-history"));
        let l = cm.metadata.labels.unwrap();
        assert_eq!(l.get(labels::RELEASE_HISTORY).map(String::as_str), Some("true"));
        assert_eq!(cm.data.unwrap().get(HISTORY_DATA_KEY).map(String::as_str), Some("version: v1\n"));
    }
}
