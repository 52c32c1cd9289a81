//! Test result extraction from pod log text.
//!
//! Two methods run over the same text:
//!
//! 1. **Result lines** (authoritative): every
//!    `{<seq>} <test> [<secs>s] ... <STATUS>` line becomes a [`TestEvent`]
//!    as soon as it is seen, so a run interrupted before its summary still
//!    yields every finished test.
//! 2. **Totals block** (validation): when the stestr `Totals` summary is
//!    present its counts are compared with the line-level aggregate. A
//!    mismatch is logged and recorded; line-level counts are kept.
//!
//! Extraction is a pure function of the text and is safe to re-run.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::cluster::PodLog;
use crate::error::ParseError;
use crate::metrics::METRICS;
use crate::model::{
    Reconciliation, TestCounts, TestEvent, TestStatus, TestSummary, TotalsBlock,
};
use crate::obs::emit_extraction_reconciled;

fn result_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\{(\d+)\}\s+(.+?)\s+(?:\[(\d+(?:\.\d+)?)s\]\s+)?\.\.\.\s+(\S+)")
            .expect("result line regex")
    })
}

fn result_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\{(\d+)\}\s*(\S*)").expect("result prefix regex"))
}

fn totals_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Totals\s*$").expect("totals header regex"))
}

fn totals_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:-\s*)?(Ran|Passed|Skipped|Failed):\s*(\d+)")
            .expect("totals field regex")
    })
}

/// Where the scanned text came from.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub iteration: u32,
    pub cr_name: &'a str,
    pub pod_name: &'a str,
}

/// Everything recovered from one pod's log.
#[derive(Debug, Clone, PartialEq)]
pub struct PodExtraction {
    pub events: Vec<TestEvent>,
    pub counts: TestCounts,
    pub reconciliation: Reconciliation,

    /// Lines that looked like results but could not be parsed.
    pub malformed: Vec<ParseError>,
}

/// One parsed `{<seq>} <test> [<secs>s] ... <STATUS>` line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultLine {
    pub sequence: u32,
    pub test_name: String,
    pub duration: Option<f64>,
    pub status: TestStatus,
}

/// Parse one result line. `Ok(None)` means the line is not a result line.
pub fn parse_result_line(line: &str, line_no: usize) -> Result<Option<ResultLine>, ParseError> {
    let malformed = |reason: &str| ParseError::MalformedResultLine {
        line_no,
        reason: reason.to_string(),
    };

    if let Some(caps) = result_line_re().captures(line) {
        let sequence = caps[1]
            .parse::<u32>()
            .map_err(|_| malformed("sequence out of range"))?;
        let name = caps[2].to_string();
        let duration = match caps.get(3) {
            Some(m) => Some(
                m.as_str()
                    .parse::<f64>()
                    .map_err(|_| malformed("bad duration"))?,
            ),
            None => None,
        };
        return Ok(Some(ResultLine {
            sequence,
            test_name: name,
            duration,
            status: TestStatus::from_token(&caps[4]),
        }));
    }

    if result_prefix_re().is_match(line) {
        return Err(malformed("incomplete result line"));
    }

    Ok(None)
}

/// Parse the stestr `Totals` block, if present.
pub fn parse_totals(text: &str) -> Result<Option<TotalsBlock>, ParseError> {
    let Some(header) = totals_header_re().find(text) else {
        return Ok(None);
    };

    let mut totals = TotalsBlock::default();
    let mut saw_ran = false;
    for caps in totals_field_re().captures_iter(&text[header.end()..]) {
        let value = caps[2]
            .parse::<u32>()
            .map_err(|_| ParseError::MalformedTotals(format!("bad count for {}", &caps[1])))?;
        match &caps[1] {
            "Ran" => {
                totals.ran = value;
                saw_ran = true;
            }
            "Passed" => totals.passed = value,
            "Skipped" => totals.skipped = value,
            "Failed" => totals.failed = value,
            _ => {}
        }
    }

    if !saw_ran {
        return Err(ParseError::MalformedTotals("missing Ran line".to_string()));
    }
    Ok(Some(totals))
}

/// Compare a Totals block with line-level counts.
pub fn reconcile(totals: Option<TotalsBlock>, lines: TestCounts) -> Reconciliation {
    match totals {
        None => Reconciliation::NotPresent,
        Some(t)
            if t.passed == lines.passed
                && t.failed == lines.failed
                && t.skipped == lines.skipped
                && t.ran == lines.total =>
        {
            Reconciliation::Consistent
        }
        Some(t) => Reconciliation::Mismatch { totals: t, lines },
    }
}

/// Extract test events from one pod's log text.
pub fn extract_pod(ctx: ExtractionContext<'_>, text: &str) -> PodExtraction {
    let mut events = Vec::new();
    let mut malformed = Vec::new();
    let mut counts = TestCounts::default();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let parsed = match parse_result_line(line, line_no) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(err) => {
                debug!(pod = %ctx.pod_name, error = %err, "Unparseable result line");
                malformed.push(err);
                // Keep what can be recovered so the test is not lost.
                match recover_partial(line) {
                    Some(partial) => partial,
                    None => continue,
                }
            }
        };
        let ResultLine {
            sequence,
            test_name,
            duration,
            status,
        } = parsed;

        let raw_line = matches!(status, TestStatus::Failed | TestStatus::Unknown)
            .then(|| line.to_string());
        counts.record(status);
        events.push(TestEvent {
            iteration: ctx.iteration,
            cr_name: ctx.cr_name.to_string(),
            pod_name: ctx.pod_name.to_string(),
            sequence,
            ordinal: events.len() as u32,
            test_name,
            duration,
            status,
            raw_line,
        });
    }

    let totals = match parse_totals(text) {
        Ok(totals) => totals,
        Err(err) => {
            warn!(pod = %ctx.pod_name, error = %err, "Ignoring unreadable Totals block");
            malformed.push(err);
            None
        }
    };
    let reconciliation = reconcile(totals, counts);
    if let Reconciliation::Mismatch { totals, lines } = &reconciliation {
        warn!(
            cr = %ctx.cr_name,
            pod = %ctx.pod_name,
            totals_ran = totals.ran,
            totals_passed = totals.passed,
            totals_failed = totals.failed,
            totals_skipped = totals.skipped,
            lines_total = lines.total,
            lines_passed = lines.passed,
            lines_failed = lines.failed,
            lines_skipped = lines.skipped,
            "Totals block disagrees with result lines; keeping line counts"
        );
    }
    emit_extraction_reconciled(ctx.cr_name, ctx.pod_name, counts.total, &reconciliation);
    METRICS.add_test_events(events.len() as u64);

    PodExtraction {
        events,
        counts,
        reconciliation,
        malformed,
    }
}

fn recover_partial(line: &str) -> Option<ResultLine> {
    let caps = result_prefix_re().captures(line)?;
    // An out-of-range worker id loses the id, not the test.
    let sequence = caps[1].parse::<u32>().unwrap_or(0);
    let name = caps.get(2)?.as_str();
    if name.is_empty() {
        return None;
    }
    Some(ResultLine {
        sequence,
        test_name: name.to_string(),
        duration: None,
        status: TestStatus::Unknown,
    })
}

/// Extract events from every pod log of one CR and summarize them.
pub fn extract_cr_logs(
    iteration: u32,
    cr_name: &str,
    logs: &[PodLog],
) -> (Vec<TestEvent>, TestSummary) {
    let mut events = Vec::new();
    let mut summary = TestSummary::default();

    for log in logs {
        let ctx = ExtractionContext {
            iteration,
            cr_name,
            pod_name: &log.pod_name,
        };
        let extraction = extract_pod(ctx, &log.text);
        summary.counts.merge(&extraction.counts);
        summary
            .reconciliation
            .push((log.pod_name.clone(), extraction.reconciliation));
        events.extend(extraction.events);
    }

    (events, summary)
}
