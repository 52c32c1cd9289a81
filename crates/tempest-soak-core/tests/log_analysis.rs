//! Integration tests for result extraction and error deduplication.

use chrono::Utc;
use tempest_soak_core::dedup::{collect_errors, parse_anchored_line};
use tempest_soak_core::extractor::{extract_pod, parse_result_line};
use tempest_soak_core::fakes::{running_pod, FakeCluster};
use tempest_soak_core::{
    ErrorDeduplicator, ExtractionContext, PodClassifier, PodKind, PodMatcher, PodStatus,
    TestStatus,
};
use tempest_soak_core::model::Reconciliation;

fn ctx() -> ExtractionContext<'static> {
    ExtractionContext {
        iteration: 2,
        cr_name: "tempest-soak-2-0",
        pod_name: "tempest-tests-s00-xyz",
    }
}

fn result_lines(n: usize) -> String {
    (0..n)
        .map(|i| {
            format!(
                "{{{}}} tempest.api.compute.test_servers.ServersTest.test_{} [{}.{:02}s] ... ok",
                i % 4,
                i,
                i,
                i
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Test: N result lines cut off right after the last one give N events
#[test]
fn test_interrupted_log_yields_every_finished_test() {
    for n in [1, 5, 40] {
        let text = format!("setting up workers\n{}", result_lines(n));
        let extraction = extract_pod(ctx(), &text);
        assert_eq!(extraction.events.len(), n);
        assert_eq!(extraction.reconciliation, Reconciliation::NotPresent);
        assert!(extraction
            .events
            .windows(2)
            .all(|w| w[0].ordinal < w[1].ordinal));
    }
}

/// Test: a consistent Totals block agrees with line counts
#[test]
fn test_consistent_totals_match_line_counts() {
    let text = "\
{0} tempest.api.identity.v3.test_tokens.TokensTest.test_create [0.51s] ... ok
{1} tempest.api.identity.v3.test_users.UsersTest.test_update [1.20s] ... FAILED
{0} tempest.api.identity.v3.test_domains.DomainsTest.test_list ... SKIPPED: not enabled
{1} tempest.api.identity.v3.test_roles.RolesTest.test_grant [0.05s] ... ok

======
Totals
======
Ran: 4 tests in 12.3456 sec.
 - Passed: 2
 - Skipped: 1
 - Expected Fail: 0
 - Unexpected Success: 0
 - Failed: 1
Sum of execute time for each test: 1.76 sec.
";
    let extraction = extract_pod(ctx(), text);
    assert_eq!(extraction.reconciliation, Reconciliation::Consistent);
    assert_eq!(extraction.counts.total, 4);
    assert_eq!(extraction.counts.passed, 2);
    assert_eq!(extraction.counts.failed, 1);
    assert_eq!(extraction.counts.skipped, 1);

    let failed = &extraction.events[1];
    assert_eq!(failed.status, TestStatus::Failed);
    assert!(failed.raw_line.as_deref().unwrap().ends_with("FAILED"));
    assert!(extraction.events[0].raw_line.is_none());
}

/// Test: a disagreeing Totals block is recorded but line counts win
#[test]
fn test_mismatched_totals_keep_line_counts() {
    let text = format!("{}\nTotals\nRan: 9\n - Passed: 9\n", result_lines(3));
    let extraction = extract_pod(ctx(), &text);
    assert_eq!(extraction.counts.total, 3);
    assert!(matches!(
        extraction.reconciliation,
        Reconciliation::Mismatch { .. }
    ));
}

/// Test: extraction over the same text is repeatable
#[test]
fn test_extraction_is_idempotent() {
    let text = format!("{}\n{{7}} broken.test [abc", result_lines(6));
    assert_eq!(extract_pod(ctx(), &text), extract_pod(ctx(), &text));
}

/// Test: a truncated result line becomes an UNKNOWN event
#[test]
fn test_malformed_line_recovered_as_unknown() {
    let text = "{3} tempest.api.network.test_ports.PortsTest.test_create [1.";
    let extraction = extract_pod(ctx(), text);
    assert_eq!(extraction.events.len(), 1);
    assert_eq!(extraction.events[0].status, TestStatus::Unknown);
    assert_eq!(extraction.malformed.len(), 1);
    assert_eq!(extraction.events[0].raw_line.as_deref(), Some(text));
}

/// Test: the canonical failed line parses field by field
#[test]
fn test_failed_line_fields() {
    let line = parse_result_line("{3} pkg.mod.Test.test_x [12.34s] ... FAILED", 1)
        .unwrap()
        .unwrap();
    assert_eq!(line.sequence, 3);
    assert_eq!(line.test_name, "pkg.mod.Test.test_x");
    assert_eq!(line.duration, Some(12.34));
    assert_eq!(line.status, TestStatus::Failed);
}

/// Test: only the level field qualifies a line as an error
#[test]
fn test_anchored_error_capture() {
    assert!(parse_anchored_line(
        "2025-11-06T13:16:34.123456 42 ERROR nova.compute Instance spawn failed"
    )
    .is_some());
    assert!(parse_anchored_line("status: ERROR").is_none());
}

fn classifier() -> PodClassifier {
    PodClassifier::new(
        PodMatcher::new(&["nova-*", "neutron-*"]).unwrap(),
        PodMatcher::new(&["tempest-*"]).unwrap(),
    )
}

/// Test: the same error repeated K times collapses into one cluster
#[test]
fn test_repeated_error_is_one_cluster() {
    let pod = classifier().classify("nova-conductor-0").unwrap();
    let mut dedup = ErrorDeduplicator::new(0.85);
    let k = 12;
    let log: String = (0..k)
        .map(|i| {
            format!(
                "2025-11-06 13:{:02}:00.{:03} {} ERROR nova.conductor.manager [req-{:08x}-aaaa] Failed to schedule instance {:08x}-1111-2222-3333-444455556666\n",
                i, i * 7, 100 + i, i, i
            )
        })
        .collect();

    assert_eq!(dedup.ingest_log(&pod, &log), k);
    let report = dedup.into_report(Utc::now());
    assert_eq!(report.unique_count, 1);
    assert_eq!(report.clusters[0].occurrence_count, k as u64);
    assert_eq!(report.clusters[0].pod_kind, PodKind::Service);
}

/// Test: collection reads only analyzable pods and ranks CRITICAL first
#[tokio::test]
async fn test_collect_errors_from_cluster() {
    let fake = FakeCluster::new();
    fake.set_pods(vec![
        running_pod("nova-api-0"),
        running_pod("neutron-server-0"),
        PodStatus {
            name: "nova-cell1-compute-0".into(),
            phase: "Pending".into(),
            ready: 0,
            total: 1,
            restarts: 0,
        },
        running_pod("rabbitmq-server-0"),
    ])
    .set_pod_logs(
        "nova-api-0",
        "2025-11-06 13:16:34.1 7 ERROR nova.api.openstack Unexpected exception in API method\n\
         2025-11-06 13:16:35.1 7 ERROR nova.api.openstack Unexpected exception in API method\n",
    )
    .set_pod_logs(
        "neutron-server-0",
        "2025-11-06 13:16:36.1 9 CRITICAL neutron.plugins.ml2 Database connection lost\n\
         2025-11-06 13:16:37.1 9 INFO neutron.wsgi status: ERROR handled\n",
    )
    .set_pod_logs(
        "nova-cell1-compute-0",
        "2025-11-06 13:16:34.1 7 ERROR nova.compute never read\n",
    );

    let report = collect_errors(&fake, "openstack", &classifier(), Utc::now(), 0.85).await;
    assert_eq!(report.total_errors, 3);
    assert_eq!(report.unique_count, 2);
    assert_eq!(report.critical_count, 1);
    assert_eq!(report.clusters[0].service, "neutron");
    assert_eq!(report.clusters[1].occurrence_count, 2);
    assert_eq!(
        report.pods_analyzed,
        vec!["neutron-server-0".to_string(), "nova-api-0".to_string()]
    );
}
