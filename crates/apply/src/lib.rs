//! Drover apply: manifest parsing, the resource versioner and server-side apply.

#![forbid(unsafe_code)]

pub mod versioning;

use anyhow::{anyhow, Context, Result};
use drover_core::{kind_rank, KubernetesResource};
use drover_kubehub::ApiResolver;
use kube::api::{Patch, PatchParams};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub use versioning::{find_managed_workload, mark_versioned, stamp_revision};

fn max_yaml_bytes() -> usize {
    std::env::var("DROVER_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("DROVER_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// Count nodes, stopping as soon as `max` is reached.
fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
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

/// Parse a multi-document YAML stream. Empty documents are skipped; namespaced
/// objects without a namespace get `default_ns`.
pub fn parse_manifests(yaml: &str, default_ns: Option<&str>) -> Result<Vec<KubernetesResource>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("manifests too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    let mut nodes = 0usize;
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes().saturating_sub(nodes)) {
            return Err(anyhow!("manifests too complex (>{} nodes)", max_yaml_nodes()));
        }
        nodes += count_nodes(&json);
        let res = KubernetesResource::from_value(json, default_ns).with_context(|| format!("YAML document {}", idx + 1))?;
        out.push(res);
    }
    if out.is_empty() {
        return Err(anyhow!("no manifests found"));
    }
    Ok(out)
}

fn count_nodes(v: &Json) -> usize {
    1 + match v {
        Json::Object(map) => map.values().map(count_nodes).sum(),
        Json::Array(arr) => arr.iter().map(count_nodes).sum(),
        _ => 0,
    }
}

/// Creation order: namespaces and config first, workloads after services, routing last.
pub fn apply_order(resources: &[KubernetesResource]) -> Vec<&KubernetesResource> {
    let mut out: Vec<&KubernetesResource> = resources.iter().collect();
    out.sort_by_key(|r| kind_rank(r.kind()));
    out
}

/// Drop server-populated fields so a live object can be re-applied.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            obj.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub dry_run: bool,
    pub target: String,
    pub new_rv: Option<String>,
}

/// Server-side apply under one field manager.
pub struct Applier {
    resolver: ApiResolver,
    field_manager: String,
}

impl Applier {
    pub fn new(resolver: ApiResolver, field_manager: impl Into<String>) -> Self {
        Self { resolver, field_manager: field_manager.into() }
    }

    pub fn resolver(&self) -> &ApiResolver {
        &self.resolver
    }

    pub async fn apply(&self, res: &KubernetesResource, dry_run: bool) -> Result<ApplyResult> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let api = self.resolver.api_for(&res.id, Some(res.api_version())).await?;
        let mut pp = PatchParams::apply(&self.field_manager).force();
        if dry_run {
            pp = pp.dry_run();
        }
        match api.patch(res.name(), &pp, &Patch::Apply(&res.value)).await {
            Ok(obj) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                if dry_run {
                    counter!("apply_dry_ok", 1u64);
                } else {
                    counter!("apply_ok", 1u64);
                }
                debug!(target_ref = %res.id, dry_run, "server-side apply ok");
                Ok(ApplyResult { dry_run, target: res.id.kind_name_ref(), new_rv: obj.metadata.resource_version })
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                let what = if dry_run { "dry-run" } else { "server-side apply" };
                Err(anyhow!("{} of {} failed: {}", what, res.id.kind_name_ref(), e))
            }
        }
    }
}
