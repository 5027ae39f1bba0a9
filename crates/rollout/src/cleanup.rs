//! Best-effort deletion of resources left behind by stale releases.

use drover_core::{deletion_order, KubernetesResourceId, ReleaseHistory};
use drover_ops::ClusterOps;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::log::{LogSink, Phase};

/// Per-resource outcome of a cleanup pass. Failures never fail the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: Vec<KubernetesResourceId>,
    pub failed: Vec<(KubernetesResourceId, String)>,
    pub pruned_releases: Vec<u32>,
}

/// Delete `candidates` in reverse creation order, skipping anything in `keep`.
pub async fn delete_resources(
    ops: &dyn ClusterOps,
    sink: &dyn LogSink,
    phase: Phase,
    candidates: &[KubernetesResourceId],
    keep: &[KubernetesResourceId],
    report: &mut CleanupReport,
) {
    for id in deletion_order(candidates) {
        if keep.iter().any(|k| k.same_object(&id))
            || report.deleted.iter().any(|d| d.same_object(&id))
            || report.failed.iter().any(|(f, _)| f.same_object(&id))
        {
            continue;
        }
        let message = match ops.delete(&id).await {
            Ok(out) if out.is_success() => {
                sink.info(phase, &format!("Deleted {}", id.kind_name_ref()));
                report.deleted.push(id);
                continue;
            }
            Ok(out) => out.text(),
            Err(e) => format!("{:#}", e),
        };
        counter!("cleanup_delete_failed_total", 1u64);
        warn!(resource = %id, error = %message, "cleanup delete failed");
        sink.warn(phase, &format!("Failed to delete {}: {}", id.kind_name_ref(), message));
        report.failed.push((id, message));
    }
}

/// Delete the versioned resources of every release not in `retain`, newest first, then
/// drop those releases from `history`. Resources still owned by a retained release are
/// left alone.
pub async fn sweep(
    ops: &dyn ClusterOps,
    sink: &dyn LogSink,
    phase: Phase,
    history: &mut ReleaseHistory,
    retain: &[u32],
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let keep: Vec<KubernetesResourceId> = history
        .releases
        .iter()
        .filter(|r| retain.contains(&r.number))
        .flat_map(|r| r.resources.iter().cloned())
        .collect();
    let stale: Vec<(u32, Vec<KubernetesResourceId>)> = history
        .iter_newest_first()
        .filter(|r| !retain.contains(&r.number))
        .map(|r| (r.number, r.versioned_resources().cloned().collect()))
        .collect();
    if stale.is_empty() {
        return report;
    }
    sink.info(phase, "Cleaning up older releases");
    for (number, versioned) in stale {
        delete_resources(ops, sink, phase, &versioned, &keep, &mut report).await;
        report.pruned_releases.push(number);
    }
    history.retain(|r| retain.contains(&r.number));
    if !report.failed.is_empty() {
        sink.warn(phase, &format!("{} resource(s) could not be deleted; continuing", report.failed.len()));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemorySink;
    use drover_core::ReleaseStatus;
    use drover_ops::MockOps;

    fn versioned(kind: &str, name: &str) -> KubernetesResourceId {
        KubernetesResourceId { versioned: true, ..KubernetesResourceId::new(kind, name, Some("prod")) }
    }

    fn history() -> ReleaseHistory {
        let mut h = ReleaseHistory::new();
        for (n, status) in [(1, ReleaseStatus::Succeeded), (2, ReleaseStatus::Succeeded), (3, ReleaseStatus::InProgress)] {
            let r = h.create_new_release(vec![
                versioned("ConfigMap", &format!("cfg-{}", n)),
                versioned("Deployment", &format!("web-{}", n)),
                KubernetesResourceId::new("Service", "web", Some("prod")),
            ]);
            r.status = status;
        }
        h
    }

    #[tokio::test]
    async fn sweep_deletes_stale_versioned_resources_and_prunes() {
        let ops = MockOps::new();
        let sink = MemorySink::new();
        let mut h = history();
        let report = sweep(&ops, &sink, Phase::Prepare, &mut h, &[3]).await;
        let names: Vec<String> = report.deleted.iter().map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["web-2", "cfg-2", "web-1", "cfg-1"]);
        assert_eq!(report.pruned_releases, vec![2, 1]);
        assert!(report.failed.is_empty());
        assert_eq!(h.releases.iter().map(|r| r.number).collect::<Vec<_>>(), vec![3]);
        assert!(ops.deleted().iter().all(|d| d.kind != "Service"));
    }

    #[tokio::test]
    async fn delete_failures_are_reported_not_fatal() {
        let ops = MockOps::new();
        ops.fail_delete("web-1");
        let sink = MemorySink::new();
        let mut h = history();
        let report = sweep(&ops, &sink, Phase::Prepare, &mut h, &[3]).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.name, "web-1");
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(h.releases.len(), 1);
        assert!(sink.contains("Failed to delete Deployment/web-1"));
    }

    #[tokio::test]
    async fn objects_shared_with_retained_releases_survive() {
        let ops = MockOps::new();
        let sink = MemorySink::new();
        let mut h = ReleaseHistory::new();
        h.create_new_release(vec![versioned("Deployment", "web"), versioned("ConfigMap", "cfg-1")]).status =
            ReleaseStatus::Failed;
        h.create_new_release(vec![versioned("Deployment", "web"), versioned("ConfigMap", "cfg-2")]);
        let report = sweep(&ops, &sink, Phase::Prepare, &mut h, &[2]).await;
        assert_eq!(report.deleted, vec![versioned("ConfigMap", "cfg-1")]);
    }

    #[tokio::test]
    async fn nothing_stale_means_no_calls() {
        let ops = MockOps::new();
        let sink = MemorySink::new();
        let mut h = history();
        let report = sweep(&ops, &sink, Phase::Prepare, &mut h, &[1, 2, 3]).await;
        assert_eq!(report, CleanupReport::default());
        assert!(ops.calls().is_empty());
    }
}
