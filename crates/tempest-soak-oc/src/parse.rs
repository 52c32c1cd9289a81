//! Parsers for `oc` output.

use serde::Deserialize;
use tempest_soak_core::{CrPhase, PodStatus, PodUsage};

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
struct PodItem {
    metadata: Metadata,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodItemStatus,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodItemStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    restart_count: u32,
}

/// Parse `oc get pods -o json`.
pub fn parse_pod_list(json: &str) -> Result<Vec<PodStatus>, serde_json::Error> {
    let list: PodList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let statuses = &item.status.container_statuses;
            let total = item.spec.containers.len().max(statuses.len()) as u32;
            PodStatus {
                name: item.metadata.name,
                phase: item.status.phase.clone().unwrap_or_else(|| "Unknown".to_string()),
                ready: statuses.iter().filter(|c| c.ready).count() as u32,
                total,
                restarts: statuses.iter().map(|c| c.restart_count).sum(),
            }
        })
        .collect())
}

/// CR phase from the phases of its pods.
///
/// Any failed pod means `Error`; all succeeded means `Completed`; any
/// running pod means `Running`; anything else is still `Pending`.
pub fn aggregate_phase(pods: &[PodStatus]) -> CrPhase {
    if pods.is_empty() {
        return CrPhase::Pending;
    }
    if pods.iter().any(|p| p.phase == "Failed") {
        CrPhase::Error
    } else if pods.iter().all(|p| p.phase == "Succeeded") {
        CrPhase::Completed
    } else if pods.iter().any(|p| p.phase == "Running") {
        CrPhase::Running
    } else {
        CrPhase::Pending
    }
}

/// Whether `oc adm top` stderr says no metrics backend answered.
pub fn is_metrics_unavailable(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("metrics not available") || lower.contains("metrics api not available")
}

/// Parse one `oc adm top pod <pod> --no-headers` line:
/// `nova-api-0   12m   256Mi`.
pub fn parse_top_line(text: &str) -> Option<PodUsage> {
    let line = text.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split_whitespace();
    let _name = fields.next()?;
    let cpu = parse_cpu_millicores(fields.next()?)?;
    let memory = parse_memory_mib(fields.next()?)?;
    Some(PodUsage {
        cpu_millicores: cpu,
        memory_mib: memory,
    })
}

fn parse_cpu_millicores(raw: &str) -> Option<u64> {
    if let Some(milli) = raw.strip_suffix('m') {
        return milli.parse().ok();
    }
    if let Some(nano) = raw.strip_suffix('n') {
        return nano.parse::<u64>().ok().map(|n| n / 1_000_000);
    }
    raw.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as u64)
}

fn parse_memory_mib(raw: &str) -> Option<u64> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: u64 = value.parse().ok()?;
    let mib = match unit {
        "Ki" => value / 1024,
        "Mi" => value,
        "Gi" => value * 1024,
        "Ti" => value * 1024 * 1024,
        "" => value / (1024 * 1024),
        "k" => value * 1000 / (1024 * 1024),
        "M" => value * 1_000_000 / (1024 * 1024),
        "G" => value * 1_000_000_000 / (1024 * 1024),
        _ => return None,
    };
    Some(mib)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PODS: &str = r#"{
        "items": [
            {
                "metadata": {"name": "nova-api-0"},
                "spec": {"containers": [{"name": "log"}, {"name": "api"}]},
                "status": {
                    "phase": "Running",
                    "containerStatuses": [
                        {"ready": true, "restartCount": 1},
                        {"ready": false, "restartCount": 2}
                    ]
                }
            },
            {
                "metadata": {"name": "tempest-tests-s00"},
                "spec": {"containers": [{"name": "tempest"}]},
                "status": {"phase": "Pending"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_pod_list() {
        let pods = parse_pod_list(PODS).unwrap();
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].name, "nova-api-0");
        assert_eq!(pods[0].ready, 1);
        assert_eq!(pods[0].total, 2);
        assert_eq!(pods[0].restarts, 3);
        assert_eq!(pods[1].phase, "Pending");
        assert_eq!(pods[1].total, 1);
    }

    #[test]
    fn test_parse_pod_list_rejects_garbage() {
        assert!(parse_pod_list("not json").is_err());
    }

    fn pod(phase: &str) -> PodStatus {
        PodStatus {
            name: "p".into(),
            phase: phase.into(),
            ready: 0,
            total: 1,
            restarts: 0,
        }
    }

    #[test]
    fn test_aggregate_phase() {
        assert_eq!(aggregate_phase(&[]), CrPhase::Pending);
        assert_eq!(aggregate_phase(&[pod("Pending")]), CrPhase::Pending);
        assert_eq!(
            aggregate_phase(&[pod("Running"), pod("Pending")]),
            CrPhase::Running
        );
        assert_eq!(
            aggregate_phase(&[pod("Succeeded"), pod("Succeeded")]),
            CrPhase::Completed
        );
        assert_eq!(
            aggregate_phase(&[pod("Succeeded"), pod("Failed")]),
            CrPhase::Error
        );
    }

    #[test]
    fn test_parse_top_line() {
        let usage = parse_top_line("nova-api-0   12m   256Mi\n").unwrap();
        assert_eq!(usage.cpu_millicores, 12);
        assert_eq!(usage.memory_mib, 256);

        let usage = parse_top_line("octavia-worker-1 2 1Gi").unwrap();
        assert_eq!(usage.cpu_millicores, 2000);
        assert_eq!(usage.memory_mib, 1024);
    }

    #[test]
    fn test_parse_top_line_rejects_partial() {
        assert!(parse_top_line("nova-api-0 12m").is_none());
        assert!(parse_top_line("").is_none());
        assert!(parse_top_line("nova-api-0 12m 3Zi").is_none());
    }

    #[test]
    fn test_metrics_unavailable_detection() {
        assert!(is_metrics_unavailable(
            "error: Metrics API not available"
        ));
        assert!(is_metrics_unavailable(
            "error: metrics not available yet"
        ));
        assert!(!is_metrics_unavailable("error: pods \"x\" not found"));
    }
}
