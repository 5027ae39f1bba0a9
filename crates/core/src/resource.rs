//! Resource identities and parsed manifest objects.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{annotations, ResourceError};

/// Kinds that can be a strategy's managed workload.
pub const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "DeploymentConfig"];

/// Kinds whose names get a revision suffix alongside the workload.
pub const CONFIG_KINDS: &[&str] = &["ConfigMap", "Secret"];

pub const SERVICE_KIND: &str = "Service";
pub const VIRTUAL_SERVICE_KIND: &str = "VirtualService";

/// Creation order; deletion walks it backwards. Unknown kinds sort last.
const KIND_ORDER: &[&str] = &[
    "Namespace",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "DeploymentConfig",
    "StatefulSet",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
    "DestinationRule",
    "VirtualService",
];

pub fn kind_rank(kind: &str) -> usize {
    KIND_ORDER.iter().position(|k| *k == kind).unwrap_or(KIND_ORDER.len())
}

/// Identifies one cluster object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResourceId {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub versioned: bool,
}

impl KubernetesResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: namespace.map(|s| s.to_string()), versioned: false }
    }

    /// `Kind/name`, the form cluster tooling prints.
    pub fn kind_name_ref(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    pub fn is_workload(&self) -> bool {
        WORKLOAD_KINDS.contains(&self.kind.as_str())
    }

    /// Same object in the cluster, ignoring the versioned flag.
    pub fn same_object(&self, other: &KubernetesResourceId) -> bool {
        self.kind == other.kind && self.name == other.name && self.namespace == other.namespace
    }
}

impl fmt::Display for KubernetesResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl FromStr for KubernetesResourceId {
    type Err = ResourceError;

    /// Accepts `Kind/name` or `namespace/Kind/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => Ok(Self::new(*kind, *name, None)),
            [ns, kind, name] if !ns.is_empty() && !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(*kind, *name, Some(ns)))
            }
            _ => Err(ResourceError::InvalidReference(s.to_string())),
        }
    }
}

/// Sort ids into deletion order (reverse creation order, stable within a kind).
pub fn deletion_order(ids: &[KubernetesResourceId]) -> Vec<KubernetesResourceId> {
    let mut out = ids.to_vec();
    out.sort_by_key(|id| std::cmp::Reverse(kind_rank(&id.kind)));
    out
}

/// One parsed manifest document plus its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct KubernetesResource {
    pub id: KubernetesResourceId,
    pub value: Json,
}

impl KubernetesResource {
    /// Build from a JSON object, taking the namespace from the object or `default_ns`.
    pub fn from_value(mut value: Json, default_ns: Option<&str>) -> Result<Self, ResourceError> {
        if !value.is_object() {
            return Err(ResourceError::NotAnObject);
        }
        if value.get("apiVersion").and_then(|v| v.as_str()).is_none() {
            return Err(ResourceError::MissingField("apiVersion"));
        }
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or(ResourceError::MissingField("kind"))?
            .to_string();
        let name = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or(ResourceError::MissingField("metadata.name"))?
            .to_string();
        let mut namespace = value
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if namespace.is_none() && !is_cluster_scoped(&kind) {
            if let Some(ns) = default_ns {
                object_at(&mut value, &["metadata"]).insert("namespace".into(), Json::String(ns.to_string()));
                namespace = Some(ns.to_string());
            }
        }
        Ok(Self { id: KubernetesResourceId { kind, name, namespace, versioned: false }, value })
    }

    pub fn kind(&self) -> &str {
        &self.id.kind
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn api_version(&self) -> &str {
        self.value.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.value
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
    }

    fn annotation_is_true(&self, key: &str) -> bool {
        self.annotation(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
    }

    /// Applied as-is, never a managed workload candidate.
    pub fn is_direct_apply(&self) -> bool {
        self.annotation_is_true(annotations::DIRECT_APPLY)
    }

    pub fn is_workload(&self) -> bool {
        self.id.is_workload()
    }

    pub fn is_managed_workload(&self) -> bool {
        self.is_workload() && !self.is_direct_apply()
    }

    pub fn is_service(&self) -> bool {
        self.kind() == SERVICE_KIND
    }

    pub fn is_primary_service(&self) -> bool {
        self.is_service() && self.annotation_is_true(annotations::PRIMARY_SERVICE)
    }

    pub fn is_stage_service(&self) -> bool {
        self.is_service() && self.annotation_is_true(annotations::STAGE_SERVICE)
    }

    pub fn is_config(&self) -> bool {
        CONFIG_KINDS.contains(&self.kind())
    }

    /// Rename in both the identity and the object body.
    pub fn set_name(&mut self, name: &str) {
        object_at(&mut self.value, &["metadata"]).insert("name".into(), Json::String(name.to_string()));
        self.id.name = name.to_string();
    }

    /// `spec.replicas`, or `None` when absent or outside the `i32` range.
    pub fn replicas(&self) -> Option<i32> {
        self.value
            .get("spec")
            .and_then(|s| s.get("replicas"))
            .and_then(|v| v.as_i64())
            .and_then(|v| i32::try_from(v).ok())
    }

    pub fn set_replicas(&mut self, replicas: i32) {
        object_at(&mut self.value, &["spec"]).insert("replicas".into(), Json::from(replicas));
    }

    pub fn add_label(&mut self, key: &str, value: &str) {
        object_at(&mut self.value, &["metadata", "labels"]).insert(key.into(), Json::String(value.to_string()));
    }

    pub fn add_pod_template_label(&mut self, key: &str, value: &str) {
        object_at(&mut self.value, &["spec", "template", "metadata", "labels"])
            .insert(key.into(), Json::String(value.to_string()));
    }

    pub fn add_selector_label(&mut self, key: &str, value: &str) {
        object_at(&mut self.value, &["spec", "selector", "matchLabels"])
            .insert(key.into(), Json::String(value.to_string()));
    }

    pub fn pod_template_labels(&self) -> BTreeMap<String, String> {
        string_map(
            self.value
                .get("spec")
                .and_then(|s| s.get("template"))
                .and_then(|t| t.get("metadata"))
                .and_then(|m| m.get("labels")),
        )
    }

    /// `spec.selector` of a Service (a flat label map).
    pub fn service_selector(&self) -> BTreeMap<String, String> {
        service_selector_of(&self.value)
    }

    pub fn set_service_selector_label(&mut self, key: &str, value: &str) {
        object_at(&mut self.value, &["spec", "selector"]).insert(key.into(), Json::String(value.to_string()));
    }

    /// Mutable access to the pod spec of a workload, if it has one.
    pub fn pod_spec_mut(&mut self) -> Option<&mut Map<String, Json>> {
        self.value
            .get_mut("spec")
            .and_then(|s| s.get_mut("template"))
            .and_then(|t| t.get_mut("spec"))
            .and_then(|s| s.as_object_mut())
    }
}

/// Read the flat `spec.selector` label map of a Service object.
pub fn service_selector_of(value: &Json) -> BTreeMap<String, String> {
    string_map(value.get("spec").and_then(|s| s.get("selector")))
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "CustomResourceDefinition"
            | "PersistentVolume"
            | "StorageClass"
            | "PodSecurityPolicy"
            | "APIService"
    )
}

/// Walk `path` creating empty objects as needed and return the object at the end.
pub fn object_at<'a>(root: &'a mut Json, path: &[&str]) -> &'a mut Map<String, Json> {
    let mut cur = root;
    for key in path {
        cur = as_object(cur).entry((*key).to_string()).or_insert_with(|| Json::Object(Map::new()));
    }
    as_object(cur)
}

fn as_object(v: &mut Json) -> &mut Map<String, Json> {
    if !v.is_object() {
        *v = Json::Object(Map::new());
    }
    match v {
        Json::Object(m) => m,
        _ => unreachable!("value was just replaced with an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Json {
        serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": {
                "replicas": 3,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "metadata": { "labels": { "app": "web" } }, "spec": { "containers": [] } }
            }
        })
    }

    #[test]
    fn from_value_defaults_namespace() {
        let r = KubernetesResource::from_value(deployment(), Some("prod")).unwrap();
        assert_eq!(r.id.namespace.as_deref(), Some("prod"));
        assert_eq!(r.value["metadata"]["namespace"], "prod");
        assert_eq!(r.replicas(), Some(3));
        assert!(r.is_managed_workload());
    }

    #[test]
    fn replicas_outside_i32_are_not_truncated() {
        let mut value = deployment();
        value["spec"]["replicas"] = serde_json::json!(i64::from(i32::MAX) + 1);
        let r = KubernetesResource::from_value(value, Some("prod")).unwrap();
        assert_eq!(r.replicas(), None);
    }

    #[test]
    fn from_value_reports_missing_fields() {
        let e = KubernetesResource::from_value(serde_json::json!({"kind": "X"}), None).unwrap_err();
        assert!(e.to_string().contains("apiVersion"), "{}", e);
        let e = KubernetesResource::from_value(serde_json::json!({"apiVersion": "v1", "kind": "X", "metadata": {}}), None)
            .unwrap_err();
        assert!(e.to_string().contains("metadata.name"), "{}", e);
    }

    #[test]
    fn direct_apply_annotation_excludes_workload() {
        let mut v = deployment();
        v["metadata"]["annotations"] = serde_json::json!({ "drover.io/direct-apply": "true" });
        let r = KubernetesResource::from_value(v, None).unwrap();
        assert!(r.is_workload());
        assert!(!r.is_managed_workload());
    }

    #[test]
    fn label_helpers_create_missing_paths() {
        let mut r = KubernetesResource::from_value(
            serde_json::json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "svc"}}),
            None,
        )
        .unwrap();
        r.set_service_selector_label("drover.io/revision", "4");
        assert_eq!(r.service_selector().get("drover.io/revision").map(String::as_str), Some("4"));
        r.set_name("svc-2");
        assert_eq!(r.id.name, "svc-2");
        assert_eq!(r.value["metadata"]["name"], "svc-2");
    }

    #[test]
    fn parses_references() {
        let id: KubernetesResourceId = "Deployment/web".parse().unwrap();
        assert_eq!(id.kind_name_ref(), "Deployment/web");
        assert!(id.namespace.is_none());
        let id: KubernetesResourceId = "prod/StatefulSet/db".parse().unwrap();
        assert_eq!(id.namespace.as_deref(), Some("prod"));
        assert!("web".parse::<KubernetesResourceId>().is_err());
        assert!("a/b/c/d".parse::<KubernetesResourceId>().is_err());
    }

    #[test]
    fn deletion_order_reverses_creation_order() {
        let ids = vec![
            KubernetesResourceId::new("ConfigMap", "cfg", None),
            KubernetesResourceId::new("Deployment", "web", None),
            KubernetesResourceId::new("Service", "svc", None),
        ];
        let kinds: Vec<_> = deletion_order(&ids).into_iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec!["Deployment", "Service", "ConfigMap"]);
    }
}
