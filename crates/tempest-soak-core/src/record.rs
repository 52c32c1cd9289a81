use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::api_requests::ApiReport;
use crate::dedup::ErrorReport;
use crate::error::Result;
use crate::model::{CrJob, CrPhase, PodSnapshot, TestCounts, TestEvent};

/// Why the run stopped starting new iterations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Deadline,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Deadline => "deadline",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

/// Everything a run produced, handed to exporters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub iterations: u32,
    pub reason: Option<TerminationReason>,
    pub snapshots: Vec<PodSnapshot>,
    pub jobs: Vec<CrJob>,
    pub events: Vec<TestEvent>,
    pub errors: Option<ErrorReport>,
    pub api: Option<ApiReport>,
}

impl RunRecord {
    /// Aggregate test counts over every event of the run.
    pub fn test_counts(&self) -> TestCounts {
        TestCounts::from_events(&self.events)
    }

    pub fn jobs_in_phase(&self, phase: CrPhase) -> usize {
        self.jobs.iter().filter(|j| j.phase == phase).count()
    }
}

/// Write run_record.json in pretty JSON format.
pub fn write_run_record_json(path: &Path, record: &RunRecord) -> Result<()> {
    let content = serde_json::to_string_pretty(record)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Render a short markdown summary of a run.
pub fn render_run_summary_md(record: &RunRecord) -> String {
    let counts = record.test_counts();
    let mut out = String::new();
    out.push_str("# Soak Run Summary\n\n");
    out.push_str(&format!(
        "- run: `{}`\n- namespace: {}\n- iterations: {}\n- stopped by: {}\n\n",
        record.run_id,
        record.namespace,
        record.iterations,
        record.reason.map(|r| r.as_str()).unwrap_or("running"),
    ));

    out.push_str("## CRs\n");
    for phase in [
        CrPhase::Completed,
        CrPhase::Error,
        CrPhase::TimedOut,
    ] {
        out.push_str(&format!("- {}: {}\n", phase, record.jobs_in_phase(phase)));
    }
    let failed_infra: Vec<_> = record.jobs.iter().filter(|j| j.failure.is_some()).collect();
    if !failed_infra.is_empty() {
        out.push_str("\n### Infrastructure Failures\n");
        for job in failed_infra {
            out.push_str(&format!(
                "- `{}`: {}\n",
                job.name,
                job.failure.as_deref().unwrap_or_default()
            ));
        }
    }

    out.push_str("\n## Tests\n");
    out.push_str(&format!(
        "- total: {}\n- passed: {}\n- failed: {}\n- skipped: {}\n- unknown: {}\n",
        counts.total, counts.passed, counts.failed, counts.skipped, counts.unknown
    ));
    let mismatched: Vec<_> = record
        .jobs
        .iter()
        .filter(|j| j.summary.has_mismatch())
        .map(|j| format!("`{}`", j.name))
        .collect();
    if !mismatched.is_empty() {
        out.push_str(&format!(
            "- totals mismatch (line counts kept): {}
",
            mismatched.join(", ")
        ));
    }

    if let Some(errors) = &record.errors {
        out.push_str("\n## Errors\n");
        out.push_str(&format!(
            "- total: {}\n- unique: {}\n- critical: {}\n",
            errors.total_errors, errors.unique_count, errors.critical_count
        ));
        for cluster in errors.clusters.iter().take(10) {
            out.push_str(&format!(
                "- {:?} x{} `{}` ({})\n",
                cluster.severity, cluster.occurrence_count, cluster.signature, cluster.service
            ));
        }
    }

    if let Some(api) = &record.api {
        out.push_str("\n## API Requests\n");
        out.push_str(&format!(
            "- total: {}\n- errors: {}\n- success rate: {:.2}%\n- avg response: {:.3}s\n",
            api.total_requests, api.error_requests, api.success_rate, api.avg_response_time
        ));
    }
    out
}

/// Write run_summary.md.
pub fn write_run_summary_md(path: &Path, record: &RunRecord) -> Result<()> {
    std::fs::write(path, render_run_summary_md(record))?;
    Ok(())
}
