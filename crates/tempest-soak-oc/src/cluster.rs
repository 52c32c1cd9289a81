//! `ClusterClient` over the `oc` command line.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tempest_soak_core::{
    ClusterClient, ClusterError, ClusterResult, CrId, CrManifest, CrStatus, PodLog, PodMatcher,
    PodStatus, PodUsage,
};
use tracing::{debug, warn};

use crate::command::{classify_failure, CommandOutput, OcRunner};
use crate::parse::{aggregate_phase, is_metrics_unavailable, parse_pod_list, parse_top_line};

pub const DEFAULT_OC_BINARY: &str = "oc";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Talks to the cluster by running `oc`.
#[derive(Debug, Clone)]
pub struct OcCluster {
    runner: OcRunner,

    /// Label whose value is the CR name on every pod the CR creates.
    pod_label: String,
}

impl OcCluster {
    pub fn new(runner: OcRunner, pod_label: impl Into<String>) -> Self {
        Self {
            runner,
            pod_label: pod_label.into(),
        }
    }

    async fn cr_pods(&self, id: &CrId) -> ClusterResult<Vec<PodStatus>> {
        let selector = format!("{}={}", self.pod_label, id.name);
        let out = self
            .runner
            .run(
                "get_status",
                &["get", "pods", "-n", id.namespace.as_str(), "-l", selector.as_str(), "-o", "json"],
                None,
            )
            .await?;
        if !out.success() {
            return Err(classify_failure("get_status", ("pods", selector.as_str()), &out));
        }
        parse_json(&out, "get_status")
    }

    async fn cr_exists(&self, id: &CrId) -> ClusterResult<bool> {
        let kind = id.kind.to_lowercase();
        let out = self
            .runner
            .run(
                "get_status",
                &["get", kind.as_str(), id.name.as_str(), "-n", id.namespace.as_str(), "-o", "name"],
                None,
            )
            .await?;
        if out.success() {
            return Ok(true);
        }
        match classify_failure("get_status", (kind.as_str(), id.name.as_str()), &out) {
            ClusterError::NotFound { .. } => Ok(false),
            other => Err(other),
        }
    }

    async fn logs(&self, operation: &str, namespace: &str, pod: &str, since: Option<&str>) -> ClusterResult<String> {
        let since_arg = since.map(|ts| format!("--since-time={ts}"));
        let mut args = vec!["logs", pod, "-n", namespace];
        if let Some(arg) = &since_arg {
            args.push(arg.as_str());
        }
        let out = self.runner.run(operation, &args, None).await?;
        if !out.success() {
            return Err(classify_failure(operation, ("pod", pod), &out));
        }
        Ok(out.stdout)
    }
}

fn parse_json(out: &CommandOutput, operation: &str) -> ClusterResult<Vec<PodStatus>> {
    parse_pod_list(&out.stdout)
        .map_err(|e| ClusterError::transient(operation, format!("unreadable pod list: {e}")))
}

#[async_trait]
impl ClusterClient for OcCluster {
    async fn apply(&self, manifest: &CrManifest) -> ClusterResult<CrId> {
        let body = serde_json::to_vec(&manifest.to_json())
            .map_err(|e| ClusterError::terminal("apply", e.to_string()))?;
        let out = self
            .runner
            .run(
                "apply",
                &["apply", "-n", manifest.namespace.as_str(), "-f", "-"],
                Some(body.as_slice()),
            )
            .await?;
        if out.success() {
            debug!(cr = %manifest.name, output = %out.stdout.trim(), "CR applied");
            return Ok(manifest.id());
        }
        match classify_failure("apply", (manifest.template.kind.as_str(), manifest.name.as_str()), &out) {
            err @ ClusterError::Terminal { .. } => Err(err),
            _ => Err(ClusterError::ApplyRejected {
                name: manifest.name.clone(),
                message: out.stderr.trim().to_string(),
            }),
        }
    }

    async fn get_status(&self, id: &CrId) -> ClusterResult<CrStatus> {
        let pods = self.cr_pods(id).await?;
        if pods.is_empty() && !self.cr_exists(id).await? {
            return Err(ClusterError::NotFound {
                kind: id.kind.clone(),
                name: id.name.clone(),
            });
        }

        let phase = aggregate_phase(&pods);
        let message = (!pods.is_empty()).then(|| {
            pods.iter()
                .map(|p| format!("{}={}", p.name, p.phase))
                .collect::<Vec<_>>()
                .join(",")
        });
        Ok(CrStatus { phase, message })
    }

    async fn get_logs(&self, id: &CrId) -> ClusterResult<Vec<PodLog>> {
        let pods = self.cr_pods(id).await?;
        let mut logs = Vec::with_capacity(pods.len());
        for pod in pods {
            match self.logs("get_logs", &id.namespace, &pod.name, None).await {
                Ok(text) => logs.push(PodLog {
                    pod_name: pod.name,
                    text,
                }),
                Err(e) => warn!(cr = %id.name, pod = %pod.name, error = %e, "Skipping pod log"),
            }
        }
        Ok(logs)
    }

    async fn delete(&self, id: &CrId) -> ClusterResult<()> {
        let kind = id.kind.to_lowercase();
        let out = self
            .runner
            .run(
                "delete",
                &["delete", kind.as_str(), id.name.as_str(), "-n", id.namespace.as_str(), "--wait=false"],
                None,
            )
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_failure("delete", (kind.as_str(), id.name.as_str()), &out))
        }
    }

    async fn list_pods(&self, namespace: &str, matcher: &PodMatcher) -> ClusterResult<Vec<PodStatus>> {
        let out = self
            .runner
            .run("list_pods", &["get", "pods", "-n", namespace, "-o", "json"], None)
            .await?;
        if !out.success() {
            return Err(classify_failure("list_pods", ("pods", namespace), &out));
        }
        let pods = parse_json(&out, "list_pods")?;
        Ok(pods.into_iter().filter(|p| matcher.is_match(&p.name)).collect())
    }

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> ClusterResult<PodUsage> {
        let out = self
            .runner
            .run(
                "get_pod_metrics",
                &["adm", "top", "pod", pod, "-n", namespace, "--no-headers"],
                None,
            )
            .await?;
        if !out.success() {
            if is_metrics_unavailable(&out.stderr) {
                return Err(ClusterError::MetricsUnavailable {
                    pod: pod.to_string(),
                    message: out.stderr.trim().to_string(),
                });
            }
            return Err(classify_failure("get_pod_metrics", ("pod", pod), &out));
        }
        parse_top_line(&out.stdout).ok_or_else(|| ClusterError::MetricsUnavailable {
            pod: pod.to_string(),
            message: format!("unreadable top output: {}", out.stdout.trim()),
        })
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, since: DateTime<Utc>) -> ClusterResult<String> {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.logs("pod_logs", namespace, pod, Some(&since)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempest_soak_core::{CrPhase, RunConfig};

    /// Write a shell stand-in for `oc` that prints `stdout`, writes
    /// `stderr` and exits with `code`, recording its arguments.
    fn fake_oc(dir: &tempfile::TempDir, stdout: &str, stderr: &str, code: i32) -> String {
        let path = dir.path().join("oc.sh");
        let args_log = dir.path().join("args");
        let script = format!(
            "echo \"$@\" >> '{}'\ncat > /dev/null\nprintf '%s' '{}'\nprintf '%s' '{}' >&2\nexit {}\n",
            args_log.display(),
            stdout,
            stderr,
            code
        );
        std::fs::write(&path, script).unwrap();
        path.display().to_string()
    }

    fn recorded_args(dir: &tempfile::TempDir) -> String {
        std::fs::read_to_string(dir.path().join("args")).unwrap_or_default()
    }

    fn cluster(script: String) -> OcCluster {
        let runner = OcRunner::new("sh", Duration::from_secs(10)).with_global_args([script]);
        OcCluster::new(runner, "instanceName")
    }

    fn manifest() -> CrManifest {
        CrManifest::for_attempt(&RunConfig::default(), 1, 0)
    }

    #[tokio::test]
    async fn test_apply_success() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(&dir, "tempest.test.openstack.org/tempest-soak-1-0 created", "", 0));
        let id = oc.apply(&manifest()).await.unwrap();
        assert_eq!(id.name, "tempest-soak-1-0");
        assert!(recorded_args(&dir).contains("apply -n openstack -f -"));
    }

    #[tokio::test]
    async fn test_apply_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(&dir, "", "error: validation failed", 1));
        let err = oc.apply(&manifest()).await.unwrap_err();
        assert!(matches!(err, ClusterError::ApplyRejected { .. }));
    }

    #[tokio::test]
    async fn test_apply_forbidden_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(&dir, "", "Error from server (Forbidden): denied", 1));
        let err = oc.apply(&manifest()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Terminal { .. }));
    }

    #[tokio::test]
    async fn test_status_aggregates_pod_phases() {
        let dir = tempfile::tempdir().unwrap();
        let pods = r#"{"items":[{"metadata":{"name":"tempest-soak-1-0-s00"},"status":{"phase":"Succeeded"}}]}"#;
        let oc = cluster(fake_oc(&dir, pods, "", 0));
        let status = oc.get_status(&manifest().id()).await.unwrap();
        assert_eq!(status.phase, CrPhase::Completed);
        assert!(recorded_args(&dir).contains("-l instanceName=tempest-soak-1-0"));
    }

    #[tokio::test]
    async fn test_metrics_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(&dir, "", "error: Metrics API not available", 1));
        let err = oc.get_pod_metrics("openstack", "nova-api-0").await.unwrap_err();
        assert!(matches!(err, ClusterError::MetricsUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_metrics_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(&dir, "nova-api-0 15m 300Mi", "", 0));
        let usage = oc.get_pod_metrics("openstack", "nova-api-0").await.unwrap();
        assert_eq!(usage.cpu_millicores, 15);
        assert_eq!(usage.memory_mib, 300);
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(
            &dir,
            "",
            "Error from server (NotFound): tempests.test.openstack.org not found",
            1,
        ));
        let err = oc.delete(&manifest().id()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(recorded_args(&dir).contains("delete tempest tempest-soak-1-0 -n openstack --wait=false"));
    }

    #[tokio::test]
    async fn test_pod_logs_pass_since_time() {
        let dir = tempfile::tempdir().unwrap();
        let oc = cluster(fake_oc(&dir, "log text", "", 0));
        let since = DateTime::parse_from_rfc3339("2025-11-06T13:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let text = oc.pod_logs("openstack", "nova-api-0", since).await.unwrap();
        assert_eq!(text, "log text");
        assert!(recorded_args(&dir).contains("--since-time=2025-11-06T13:00:00Z"));
    }
}
