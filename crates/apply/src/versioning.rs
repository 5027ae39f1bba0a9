//! Resource versioner: revision labels, suffixed names and config reference rewrites.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use drover_core::resource::SERVICE_KIND;
use drover_core::{annotations, labels, KubernetesResource};
use serde_json::Value as Json;

/// Index of the single managed workload. Zero or several candidates is an error
/// naming the annotation that excludes extra workloads.
pub fn find_managed_workload(resources: &[KubernetesResource]) -> Result<usize> {
    let candidates: Vec<usize> =
        resources.iter().enumerate().filter(|(_, r)| r.is_managed_workload()).map(|(i, _)| i).collect();
    match candidates.as_slice() {
        [one] => Ok(*one),
        [] => Err(anyhow!(
            "no managed workload found in manifests; exactly one Deployment, StatefulSet, DaemonSet or DeploymentConfig without the {}: \"true\" annotation is required",
            annotations::DIRECT_APPLY
        )),
        many => {
            let names: Vec<String> = many.iter().map(|i| resources[*i].id.kind_name_ref()).collect();
            Err(anyhow!(
                "more than one workload found in manifests ({}); only one can be managed, annotate the others with {}: \"true\"",
                names.join(", "),
                annotations::DIRECT_APPLY
            ))
        }
    }
}

/// Flag resources that take part in revision stamping.
pub fn mark_versioned(resources: &mut [KubernetesResource], include_services: bool) {
    for r in resources.iter_mut() {
        r.id.versioned = r.is_managed_workload() || r.is_config() || (include_services && r.kind() == SERVICE_KIND);
    }
}

/// Stamp revision `revision` onto every versioned resource.
///
/// ConfigMaps and Secrets always get a `-<revision>` suffix so each release owns its
/// own copy; workloads and services are suffixed only when `append_revision_to_name`.
/// Workload pod specs referencing a renamed ConfigMap/Secret are rewritten to the new
/// name. Versioned workloads get the revision label on their pod template; the matching
/// selector clause is only added to renamed workloads, since an existing workload's
/// selector cannot change.
pub fn stamp_revision(resources: &mut [KubernetesResource], revision: u32, append_revision_to_name: bool) {
    let rev = revision.to_string();
    let mut renamed: HashMap<(String, String), String> = HashMap::new();
    for r in resources.iter_mut().filter(|r| r.id.versioned && r.is_config()) {
        let new_name = format!("{}-{}", r.name(), rev);
        renamed.insert((r.kind().to_string(), r.name().to_string()), new_name.clone());
        r.set_name(&new_name);
    }
    for r in resources.iter_mut() {
        if r.is_workload() {
            if let Some(pod) = r.pod_spec_mut() {
                rewrite_config_refs(pod, &renamed);
            }
        }
        if !r.id.versioned || r.is_config() {
            continue;
        }
        r.add_label(labels::REVISION, &rev);
        if append_revision_to_name {
            let new_name = format!("{}-{}", r.name(), rev);
            r.set_name(&new_name);
        }
        if r.is_workload() {
            r.add_pod_template_label(labels::REVISION, &rev);
            if append_revision_to_name {
                r.add_selector_label(labels::REVISION, &rev);
            }
        }
    }
}

fn rewrite_config_refs(pod: &mut serde_json::Map<String, Json>, renamed: &HashMap<(String, String), String>) {
    if renamed.is_empty() {
        return;
    }
    let rename = |slot: Option<&mut Json>, kind: &str| {
        if let Some(v) = slot {
            if let Some(old) = v.as_str() {
                if let Some(new) = renamed.get(&(kind.to_string(), old.to_string())) {
                    *v = Json::String(new.clone());
                }
            }
        }
    };
    for key in ["containers", "initContainers"] {
        let Some(containers) = pod.get_mut(key).and_then(|c| c.as_array_mut()) else { continue };
        for c in containers.iter_mut() {
            if let Some(env_from) = c.get_mut("envFrom").and_then(|e| e.as_array_mut()) {
                for src in env_from.iter_mut() {
                    rename(src.get_mut("configMapRef").and_then(|r| r.get_mut("name")), "ConfigMap");
                    rename(src.get_mut("secretRef").and_then(|r| r.get_mut("name")), "Secret");
                }
            }
            if let Some(env) = c.get_mut("env").and_then(|e| e.as_array_mut()) {
                for var in env.iter_mut() {
                    let Some(from) = var.get_mut("valueFrom") else { continue };
                    rename(from.get_mut("configMapKeyRef").and_then(|r| r.get_mut("name")), "ConfigMap");
                    rename(from.get_mut("secretKeyRef").and_then(|r| r.get_mut("name")), "Secret");
                }
            }
        }
    }
    if let Some(volumes) = pod.get_mut("volumes").and_then(|v| v.as_array_mut()) {
        for vol in volumes.iter_mut() {
            rename(vol.get_mut("configMap").and_then(|c| c.get_mut("name")), "ConfigMap");
            rename(vol.get_mut("secret").and_then(|s| s.get_mut("secretName")), "Secret");
            if let Some(sources) =
                vol.get_mut("projected").and_then(|p| p.get_mut("sources")).and_then(|s| s.as_array_mut())
            {
                for src in sources.iter_mut() {
                    rename(src.get_mut("configMap").and_then(|c| c.get_mut("name")), "ConfigMap");
                    rename(src.get_mut("secret").and_then(|s| s.get_mut("name")), "Secret");
                }
            }
        }
    }
}
