//! Run data model: CR jobs, pod snapshots and test events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a submitted CR.
///
/// `Completed`, `Error` and `TimedOut` are terminal. `Error` means the
/// operator ran the tests and reported a failure; it is a test outcome,
/// not an infrastructure fault.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CrPhase {
    Pending,
    Running,
    Completed,
    Error,
    TimedOut,
}

impl CrPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CrPhase::Completed | CrPhase::Error | CrPhase::TimedOut)
    }

    fn rank(self) -> u8 {
        match self {
            CrPhase::Pending => 0,
            CrPhase::Running => 1,
            CrPhase::Completed | CrPhase::Error | CrPhase::TimedOut => 2,
        }
    }

    /// Phase after observing `next`. Never regresses and never leaves a
    /// terminal phase.
    pub fn advance(self, next: CrPhase) -> CrPhase {
        if self.is_terminal() || next.rank() < self.rank() {
            self
        } else {
            next
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CrPhase::Pending => "Pending",
            CrPhase::Running => "Running",
            CrPhase::Completed => "Completed",
            CrPhase::Error => "Error",
            CrPhase::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for CrPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test as reported on a result line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Unknown,
}

impl TestStatus {
    /// Map a raw status token. `ok` means passed; anything unrecognized is
    /// kept as `Unknown` rather than dropped.
    pub fn from_token(token: &str) -> Self {
        match token.trim_end_matches(':') {
            "ok" => TestStatus::Passed,
            "FAILED" => TestStatus::Failed,
            "SKIPPED" => TestStatus::Skipped,
            _ => TestStatus::Unknown,
        }
    }
}

/// One structured test result recovered from pod log text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestEvent {
    pub iteration: u32,
    pub cr_name: String,
    pub pod_name: String,

    /// The `{n}` token of the result line.
    pub sequence: u32,

    /// Position of this event within its pod's scan, starting at zero.
    pub ordinal: u32,

    pub test_name: String,

    /// Duration in seconds, when the line carried one.
    pub duration: Option<f64>,

    pub status: TestStatus,

    /// Verbatim matched line; kept for failed and unknown results.
    pub raw_line: Option<String>,
}

/// Whether the summary block agreed with the line-level counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Reconciliation {
    /// No Totals block in the log (e.g. interrupted run).
    #[default]
    NotPresent,
    Consistent,
    Mismatch {
        totals: TotalsBlock,
        lines: TestCounts,
    },
}

/// Counts as printed in a Totals block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TotalsBlock {
    pub ran: u32,
    pub passed: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Per-status aggregate of line-level test events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TestCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub unknown: u32,
}

impl TestCounts {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TestEvent>) -> Self {
        let mut counts = TestCounts::default();
        for event in events {
            counts.record(event.status);
        }
        counts
    }

    pub fn record(&mut self, status: TestStatus) {
        self.total += 1;
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
            TestStatus::Unknown => self.unknown += 1,
        }
    }

    pub fn merge(&mut self, other: &TestCounts) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.unknown += other.unknown;
    }
}

/// Test summary attached to a finished CR.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TestSummary {
    pub counts: TestCounts,

    /// Reconciliation outcome per pod, in log order.
    pub reconciliation: Vec<(String, Reconciliation)>,
}

impl TestSummary {
    pub fn has_mismatch(&self) -> bool {
        self.reconciliation
            .iter()
            .any(|(_, r)| matches!(r, Reconciliation::Mismatch { .. }))
    }
}

/// Result of one CR attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrJob {
    pub name: String,
    pub iteration: u32,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: CrPhase,
    pub summary: TestSummary,

    /// Infrastructure failure (submit rejected, status unreachable). Kept
    /// apart from `phase` so an operator-reported `Error` stays a test
    /// outcome.
    pub failure: Option<String>,
}

impl CrJob {
    pub fn new(name: String, iteration: u32) -> Self {
        Self {
            name,
            iteration,
            submitted_at: Utc::now(),
            finished_at: None,
            phase: CrPhase::Pending,
            summary: TestSummary::default(),
            failure: None,
        }
    }

    /// A CR whose submission never reached the operator.
    pub fn submit_failed(name: String, iteration: u32, failure: String) -> Self {
        let mut job = Self::new(name, iteration);
        job.phase = CrPhase::Error;
        job.finished_at = Some(job.submitted_at);
        job.failure = Some(failure);
        job
    }

    pub fn observe(&mut self, phase: CrPhase) {
        self.phase = self.phase.advance(phase);
        if self.phase.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// One sample of a pod's state and resource usage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodSnapshot {
    pub timestamp: DateTime<Utc>,
    pub pod_name: String,
    pub phase: String,
    pub ready: u32,
    pub total: u32,
    pub restarts: u32,

    /// CPU usage in millicores; `None` when metrics were unavailable.
    pub cpu_millicores: Option<u64>,

    /// Memory usage in MiB; `None` when metrics were unavailable.
    pub memory_mib: Option<u64>,
}

impl PodSnapshot {
    /// Ready containers over total containers, 0.0 for pods without any.
    pub fn ready_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.ready as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_never_regresses() {
        assert_eq!(CrPhase::Running.advance(CrPhase::Pending), CrPhase::Running);
        assert_eq!(CrPhase::Pending.advance(CrPhase::Running), CrPhase::Running);
        assert_eq!(
            CrPhase::Running.advance(CrPhase::Completed),
            CrPhase::Completed
        );
    }

    #[test]
    fn test_terminal_phase_is_sticky() {
        for terminal in [CrPhase::Completed, CrPhase::Error, CrPhase::TimedOut] {
            for next in [
                CrPhase::Pending,
                CrPhase::Running,
                CrPhase::Completed,
                CrPhase::Error,
                CrPhase::TimedOut,
            ] {
                assert_eq!(terminal.advance(next), terminal);
            }
        }
    }

    #[test]
    fn test_status_token_mapping() {
        assert_eq!(TestStatus::from_token("ok"), TestStatus::Passed);
        assert_eq!(TestStatus::from_token("FAILED"), TestStatus::Failed);
        assert_eq!(TestStatus::from_token("SKIPPED:"), TestStatus::Skipped);
        assert_eq!(TestStatus::from_token("ERROR"), TestStatus::Unknown);
        assert_eq!(TestStatus::from_token("inprogress"), TestStatus::Unknown);
    }

    #[test]
    fn test_counts_aggregate() {
        let mut counts = TestCounts::default();
        counts.record(TestStatus::Passed);
        counts.record(TestStatus::Passed);
        counts.record(TestStatus::Failed);
        counts.record(TestStatus::Unknown);

        assert_eq!(counts.total, 4);
        assert_eq!(counts.passed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.unknown, 1);

        let mut merged = TestCounts::default();
        merged.merge(&counts);
        merged.merge(&counts);
        assert_eq!(merged.total, 8);
    }

    #[test]
    fn test_job_observe_sets_finished_once() {
        let mut job = CrJob::new("tempest-soak-1-0".to_string(), 1);
        job.observe(CrPhase::Running);
        assert!(job.finished_at.is_none());

        job.observe(CrPhase::Error);
        let finished = job.finished_at;
        assert!(finished.is_some());

        job.observe(CrPhase::Completed);
        assert_eq!(job.phase, CrPhase::Error);
        assert_eq!(job.finished_at, finished);
    }

    #[test]
    fn test_submit_failed_job() {
        let job = CrJob::submit_failed("cr".into(), 2, "rejected".into());
        assert_eq!(job.phase, CrPhase::Error);
        assert_eq!(job.failure.as_deref(), Some("rejected"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_ready_ratio() {
        let snap = PodSnapshot {
            timestamp: Utc::now(),
            pod_name: "nova-api-0".to_string(),
            phase: "Running".to_string(),
            ready: 1,
            total: 2,
            restarts: 0,
            cpu_millicores: None,
            memory_mib: None,
        };
        assert!((snap.ready_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reconciliation_serde_tag() {
        let json = serde_json::to_value(Reconciliation::Consistent).expect("serialize");
        assert_eq!(json["state"], "consistent");
    }
}
