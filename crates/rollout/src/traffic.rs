//! Traffic controller: rewrites the weighted destinations of a VirtualService.

use drover_apply::strip_noisy;
use drover_core::resource::VIRTUAL_SERVICE_KIND;
use drover_core::{KubernetesResource, KubernetesResourceId, ReleaseHistory};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use crate::error::{Result, RolloutError};
use crate::log::{run_phase, Phase};
use crate::pipeline;
use crate::task::{TaskContext, TaskResult, TaskScope};

/// Destinations resolved to the route's own host with a subset of the same name.
const PLACEHOLDER_DESTINATIONS: &[&str] = &["stable", "canary"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteWeight {
    /// Host, or `stable` / `canary`.
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    pub weight: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitParams {
    /// Routing resource name; when absent the latest release must own exactly one.
    #[serde(default)]
    pub virtual_service: Option<String>,
    pub routes: Vec<RouteWeight>,
}

impl TrafficSplitParams {
    pub fn validate(&self) -> Result<()> {
        if self.routes.is_empty() {
            return Err(RolloutError::Validation("at least one destination weight is required".into()));
        }
        if let Some(bad) = self.routes.iter().find(|r| !(0..=100).contains(&r.weight)) {
            return Err(RolloutError::Validation(format!(
                "weight for {} must be within 0..=100 (got {})",
                bad.destination, bad.weight
            )));
        }
        let total: i32 = self.routes.iter().map(|r| r.weight).sum();
        if total != 100 {
            return Err(RolloutError::Validation(format!("destination weights must sum to 100 (got {})", total)));
        }
        Ok(())
    }
}

fn virtual_service_id(
    params: &TrafficSplitParams,
    history: &ReleaseHistory,
    namespace: &str,
) -> Result<KubernetesResourceId> {
    if let Some(name) = params.virtual_service.as_deref().filter(|n| !n.trim().is_empty()) {
        return Ok(KubernetesResourceId::new(VIRTUAL_SERVICE_KIND, name.trim(), Some(namespace)));
    }
    let found: Vec<&KubernetesResourceId> = history
        .latest_release()
        .map(|r| r.resources.iter().filter(|id| id.kind == VIRTUAL_SERVICE_KIND).collect())
        .unwrap_or_default();
    match found.as_slice() {
        [one] => Ok((*one).clone()),
        [] => Err(RolloutError::TrafficRouting("no VirtualService found in the latest release".into())),
        many => Err(RolloutError::TrafficRouting(format!(
            "more than one VirtualService in the latest release ({}); name the one to update",
            many.iter().map(|id| id.name.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn non_empty_array(spec: &Json, key: &str) -> bool {
    spec.get(key).and_then(|v| v.as_array()).map(|a| !a.is_empty()).unwrap_or(false)
}

/// Replace the single HTTP route's destinations, keeping the host and port of its
/// first existing destination. Nothing else in the object changes.
pub fn rewrite_routes(virtual_service: &mut Json, routes: &[RouteWeight]) -> Result<()> {
    let spec = virtual_service
        .get_mut("spec")
        .ok_or_else(|| RolloutError::TrafficRouting("VirtualService has no spec".into()))?;
    if non_empty_array(spec, "tcp") || non_empty_array(spec, "tls") {
        return Err(RolloutError::TrafficRouting("only HTTP routes are supported; found tcp or tls routes".into()));
    }
    let http = spec
        .get_mut("http")
        .and_then(|h| h.as_array_mut())
        .ok_or_else(|| RolloutError::TrafficRouting("VirtualService has no http routes".into()))?;
    if http.len() != 1 {
        return Err(RolloutError::TrafficRouting(format!("expected exactly one http route, found {}", http.len())));
    }
    let route = &mut http[0];
    let first = route
        .get("route")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .and_then(|r| r.get("destination"))
        .cloned()
        .ok_or_else(|| RolloutError::TrafficRouting("http route has no destination".into()))?;
    let host = first
        .get("host")
        .and_then(|h| h.as_str())
        .ok_or_else(|| RolloutError::TrafficRouting("http route destination has no host".into()))?
        .to_string();
    let port = first.get("port").cloned();

    let rewritten: Vec<Json> = routes
        .iter()
        .map(|r| {
            let mut destination = Map::new();
            let (dest_host, subset) = if PLACEHOLDER_DESTINATIONS.contains(&r.destination.as_str()) {
                (host.clone(), Some(r.destination.clone()))
            } else {
                (r.destination.clone(), r.subset.clone())
            };
            destination.insert("host".into(), Json::String(dest_host));
            if let Some(subset) = subset {
                destination.insert("subset".into(), Json::String(subset));
            }
            if let Some(port) = &port {
                destination.insert("port".into(), port.clone());
            }
            json!({ "destination": Json::Object(destination), "weight": r.weight })
        })
        .collect();
    match route.as_object_mut() {
        Some(obj) => {
            obj.insert("route".into(), Json::Array(rewritten));
            Ok(())
        }
        None => Err(RolloutError::TrafficRouting("http route is not an object".into())),
    }
}

pub async fn run(ctx: &TaskContext, scope: &TaskScope, params: &TrafficSplitParams) -> Result<TaskResult> {
    params.validate()?;
    let mut loaded = ctx.ledger.load(&scope.key()).await?;
    let history = &loaded.history;
    let outcome = run_phase(ctx.sink(), Phase::TrafficSplit, async {
        let id = virtual_service_id(params, history, &scope.namespace)?;
        ctx.sink().info(Phase::TrafficSplit, &format!("Updating {}", id.kind_name_ref()));
        let mut live = ctx
            .ops()
            .get(&id)
            .await
            .map_err(RolloutError::Cluster)?
            .ok_or_else(|| RolloutError::TrafficRouting(format!("{} not found in the cluster", id.kind_name_ref())))?;
        rewrite_routes(&mut live, &params.routes)?;
        let resource = KubernetesResource::from_value(strip_noisy(live), Some(&scope.namespace))
            .map_err(|e| RolloutError::TrafficRouting(e.to_string()))?;
        for r in &params.routes {
            let target = match &r.subset {
                Some(subset) => format!("{} ({})", r.destination, subset),
                None => r.destination.clone(),
            };
            ctx.sink().info(Phase::TrafficSplit, &format!("{}: {}%", target, r.weight));
        }
        let out = ctx.ops().apply(std::slice::from_ref(&resource)).await.map_err(RolloutError::Cluster)?;
        for line in &out.lines {
            ctx.sink().info(Phase::TrafficSplit, line);
        }
        if !out.is_success() {
            return Err(RolloutError::Apply(out.text()));
        }
        Ok(TaskResult::Traffic { virtual_service: id.name, routes: params.routes.clone() })
    })
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}
