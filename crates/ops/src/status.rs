//! Workload convergence, judged from the object's status like `kubectl rollout status`.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutStatus {
    Converged(String),
    Progressing(String),
    Failed(String),
}

impl RolloutStatus {
    pub fn message(&self) -> &str {
        match self {
            RolloutStatus::Converged(m) | RolloutStatus::Progressing(m) | RolloutStatus::Failed(m) => m,
        }
    }
}

fn int(v: &Json, path: &[&str]) -> i64 {
    let mut cur = v;
    for p in path {
        match cur.get(p) {
            Some(next) => cur = next,
            None => return 0,
        }
    }
    cur.as_i64().unwrap_or(0)
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for p in path {
        cur = cur.get(p)?;
    }
    cur.as_str()
}

pub fn evaluate_rollout_status(kind: &str, obj: &Json) -> RolloutStatus {
    let name = str_at(obj, &["metadata", "name"]).unwrap_or("<unknown>");
    let generation = int(obj, &["metadata", "generation"]);
    let observed = int(obj, &["status", "observedGeneration"]);
    if generation > 0 && observed < generation {
        return RolloutStatus::Progressing(format!("Waiting for {} {:?} spec update to be observed...", kind, name));
    }
    match kind {
        "Deployment" | "DeploymentConfig" => deployment_status(name, obj),
        "StatefulSet" => statefulset_status(name, obj),
        "DaemonSet" => daemonset_status(name, obj),
        _ => RolloutStatus::Converged(format!("{} {:?} has no rollout status; treated as ready", kind, name)),
    }
}

fn deployment_status(name: &str, obj: &Json) -> RolloutStatus {
    let deadline_exceeded = obj
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Progressing")
                    && c.get("reason").and_then(|r| r.as_str()) == Some("ProgressDeadlineExceeded")
            })
        })
        .unwrap_or(false);
    if deadline_exceeded {
        return RolloutStatus::Failed(format!("deployment {:?} exceeded its progress deadline", name));
    }
    let desired = obj.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_i64()).unwrap_or(1);
    let updated = int(obj, &["status", "updatedReplicas"]);
    let total = int(obj, &["status", "replicas"]);
    let available = int(obj, &["status", "availableReplicas"]);
    if updated < desired {
        return RolloutStatus::Progressing(format!(
            "Waiting for deployment {:?} rollout to finish: {} out of {} new replicas have been updated...",
            name, updated, desired
        ));
    }
    if total > updated {
        return RolloutStatus::Progressing(format!(
            "Waiting for deployment {:?} rollout to finish: {} old replicas are pending termination...",
            name,
            total - updated
        ));
    }
    if available < updated {
        return RolloutStatus::Progressing(format!(
            "Waiting for deployment {:?} rollout to finish: {} of {} updated replicas are available...",
            name, available, updated
        ));
    }
    RolloutStatus::Converged(format!("deployment {:?} successfully rolled out", name))
}

fn statefulset_status(name: &str, obj: &Json) -> RolloutStatus {
    let desired = obj.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_i64()).unwrap_or(1);
    let ready = int(obj, &["status", "readyReplicas"]);
    if ready < desired {
        return RolloutStatus::Progressing(format!("Waiting for {} pods to be ready...", desired - ready));
    }
    let partitioned = obj
        .get("spec")
        .and_then(|s| s.get("updateStrategy"))
        .and_then(|u| u.get("rollingUpdate"))
        .and_then(|r| r.get("partition"))
        .and_then(|p| p.as_i64())
        .unwrap_or(0)
        > 0;
    let current = str_at(obj, &["status", "currentRevision"]);
    let update = str_at(obj, &["status", "updateRevision"]);
    if !partitioned && update.is_some() && current != update {
        let updated = int(obj, &["status", "updatedReplicas"]);
        return RolloutStatus::Progressing(format!(
            "waiting for statefulset rolling update to complete {} pods at revision {}...",
            updated,
            update.unwrap_or_default()
        ));
    }
    RolloutStatus::Converged(format!("statefulset {:?} rolling update complete {} pods", name, ready))
}

fn daemonset_status(name: &str, obj: &Json) -> RolloutStatus {
    let desired = int(obj, &["status", "desiredNumberScheduled"]);
    let updated = int(obj, &["status", "updatedNumberScheduled"]);
    let available = int(obj, &["status", "numberAvailable"]);
    if updated < desired {
        return RolloutStatus::Progressing(format!(
            "Waiting for daemon set {:?} rollout to finish: {} out of {} new pods have been updated...",
            name, updated, desired
        ));
    }
    if available < desired {
        return RolloutStatus::Progressing(format!(
            "Waiting for daemon set {:?} rollout to finish: {} of {} updated pods are available...",
            name, available, desired
        ));
    }
    RolloutStatus::Converged(format!("daemon set {:?} successfully rolled out", name))
}

/// Short human summary of a workload for the wrap-up log.
pub fn describe_lines(kind: &str, obj: &Json) -> Vec<String> {
    let mut out = vec![
        format!("Name:       {}", str_at(obj, &["metadata", "name"]).unwrap_or("")),
        format!("Namespace:  {}", str_at(obj, &["metadata", "namespace"]).unwrap_or("")),
        format!("Kind:       {}", kind),
    ];
    if let Some(r) = obj.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_i64()) {
        out.push(format!(
            "Replicas:   {} desired | {} updated | {} ready | {} available",
            r,
            int(obj, &["status", "updatedReplicas"]),
            int(obj, &["status", "readyReplicas"]),
            int(obj, &["status", "availableReplicas"])
        ));
    }
    if let Some(images) = obj
        .get("spec")
        .and_then(|s| s.get("template"))
        .and_then(|t| t.get("spec"))
        .and_then(|s| s.get("containers"))
        .and_then(|c| c.as_array())
    {
        for c in images {
            out.push(format!(
                "Container:  {} ({})",
                c.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                c.get("image").and_then(|n| n.as_str()).unwrap_or("")
            ));
        }
    }
    if let Some(conds) = obj.get("status").and_then(|s| s.get("conditions")).and_then(|c| c.as_array()) {
        out.push("Conditions:".to_string());
        for c in conds {
            out.push(format!(
                "  {} {} {}",
                c.get("type").and_then(|v| v.as_str()).unwrap_or(""),
                c.get("status").and_then(|v| v.as_str()).unwrap_or(""),
                c.get("reason").and_then(|v| v.as_str()).unwrap_or("")
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(status: Json) -> Json {
        json!({
            "metadata": { "name": "web", "generation": 2 },
            "spec": { "replicas": 3 },
            "status": status
        })
    }

    #[test]
    fn deployment_waits_for_observed_generation() {
        let s = evaluate_rollout_status("Deployment", &deployment(json!({ "observedGeneration": 1 })));
        assert!(matches!(s, RolloutStatus::Progressing(m) if m.contains("spec update")));
    }

    #[test]
    fn deployment_progress_stages() {
        let s = evaluate_rollout_status(
            "Deployment",
            &deployment(json!({ "observedGeneration": 2, "updatedReplicas": 1, "replicas": 3 })),
        );
        assert!(matches!(s, RolloutStatus::Progressing(m) if m.contains("1 out of 3")));
        let s = evaluate_rollout_status(
            "Deployment",
            &deployment(json!({ "observedGeneration": 2, "updatedReplicas": 3, "replicas": 4, "availableReplicas": 3 })),
        );
        assert!(matches!(s, RolloutStatus::Progressing(m) if m.contains("pending termination")));
        let s = evaluate_rollout_status(
            "Deployment",
            &deployment(json!({ "observedGeneration": 2, "updatedReplicas": 3, "replicas": 3, "availableReplicas": 3 })),
        );
        assert!(matches!(s, RolloutStatus::Converged(_)));
    }

    #[test]
    fn deployment_deadline_is_failure() {
        let s = evaluate_rollout_status(
            "Deployment",
            &deployment(json!({
                "observedGeneration": 2,
                "conditions": [{ "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded" }]
            })),
        );
        assert!(matches!(s, RolloutStatus::Failed(_)));
    }

    #[test]
    fn statefulset_waits_for_revision() {
        let obj = json!({
            "metadata": { "name": "db" },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 2, "currentRevision": "db-1", "updateRevision": "db-2", "updatedReplicas": 1 }
        });
        assert!(matches!(evaluate_rollout_status("StatefulSet", &obj), RolloutStatus::Progressing(_)));
    }

    #[test]
    fn describe_includes_replicas_and_containers() {
        let obj = json!({
            "metadata": { "name": "web", "namespace": "prod" },
            "spec": { "replicas": 2, "template": { "spec": { "containers": [{ "name": "app", "image": "nginx:1" }] } } },
            "status": { "readyReplicas": 2 }
        });
        let lines = describe_lines("Deployment", &obj);
        assert!(lines.iter().any(|l| l.contains("2 desired")));
        assert!(lines.iter().any(|l| l.contains("nginx:1")));
    }
}
