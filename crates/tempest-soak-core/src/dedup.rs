//! ERROR/CRITICAL log deduplication.
//!
//! Only lines whose *level field* is ERROR or CRITICAL are considered:
//!
//! ```text
//! 2025-11-17 11:19:19.758 15 ERROR designate.api [req-...] message
//! ^timestamp              ^pid ^level
//! ```
//!
//! A line that merely mentions "ERROR" in its message never qualifies.
//! Each retained record gets a normalized signature and is fuzzy-matched
//! against the clusters seen so far in the current log window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, TextDiff};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::metrics::METRICS;
use crate::pods::{ClassifiedPod, PodClassifier, PodKind};

/// Pod phases whose logs are worth reading.
const ANALYZED_PHASES: &[&str] = &["Running", "Succeeded", "Failed"];

/// Concurrent log fetches during collection.
const LOG_FETCH_CONCURRENCY: usize = 4;

/// Upper bound on a single similarity computation.
const DIFF_DEADLINE: Duration = Duration::from_millis(50);

fn anchored_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?)\s+(\d+)\s+(ERROR|CRITICAL)\s+(\S+)(.*)$",
        )
        .expect("anchored error line regex")
    })
}

struct Normalizer {
    rules: Vec<(Regex, &'static str)>,
    numbers: Regex,
    spaces: Regex,
}

fn normalizer() -> &'static Normalizer {
    static N: OnceLock<Normalizer> = OnceLock::new();
    N.get_or_init(|| {
        let rule = |re: &str, with: &'static str| {
            (Regex::new(re).expect("normalization regex"), with)
        };
        Normalizer {
            rules: vec![
                rule(
                    r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:[+-]\d{2}:?\d{2}|z)?",
                    "<ts>",
                ),
                rule(r"\d{2}/[a-z]{3}/\d{4}:\d{2}:\d{2}:\d{2}", "<ts>"),
                rule(
                    r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
                    "<uuid>",
                ),
                rule(r"req-[0-9a-f-]+", "<req>"),
                rule(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b", "<ip>"),
                rule(r"0x[0-9a-f]+", "<addr>"),
                rule(r"\b[0-9a-f]{8,}\b", "<hex>"),
            ],
            numbers: Regex::new(r"\b\d+(?:\.\d+)?\b").expect("number regex"),
            spaces: Regex::new(r"\s+").expect("whitespace regex"),
        }
    })
}

/// Level of a retained log record. Recorded verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Error,
}

impl Severity {
    fn from_level(level: &str) -> Option<Self> {
        match level {
            "ERROR" => Some(Severity::Error),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// One anchored ERROR/CRITICAL line, split into its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchoredLine<'a> {
    pub timestamp: NaiveDateTime,
    pub pid: &'a str,
    pub severity: Severity,
    pub module: &'a str,

    /// Module plus message: everything after the level token.
    pub remainder: &'a str,
}

/// Parse a line whose level field is ERROR or CRITICAL.
pub fn parse_anchored_line(line: &str) -> Option<AnchoredLine<'_>> {
    let caps = anchored_line_re().captures(line)?;
    let raw_ts = caps.get(1)?.as_str();
    let timestamp = parse_log_timestamp(raw_ts)?;
    let severity = Severity::from_level(caps.get(3)?.as_str())?;
    let module = caps.get(4)?;
    let remainder = &line[module.start()..];
    Some(AnchoredLine {
        timestamp,
        pid: caps.get(2)?.as_str(),
        severity,
        module: module.as_str(),
        remainder: remainder.trim_end(),
    })
}

fn parse_log_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.replacen(' ', "T", 1).replace(',', ".");
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

/// Normalize error text so records differing only in volatile tokens
/// (timestamps, ids, addresses, numbers) compare equal.
pub fn normalize_signature(text: &str) -> String {
    let n = normalizer();
    let mut out = text.to_lowercase();
    for (re, with) in &n.rules {
        out = re.replace_all(&out, *with).into_owned();
    }
    out = n.numbers.replace_all(&out, "").into_owned();
    n.spaces.replace_all(&out, " ").trim().to_string()
}

/// Character-level similarity ratio in [0, 1].
pub fn similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la + lb == 0 {
        return 1.0;
    }
    TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_DEADLINE)
        .diff_chars(a, b)
        .ratio()
}

/// Best similarity two texts of these lengths could reach.
fn similarity_upper_bound(a: &str, b: &str) -> f32 {
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la + lb == 0 {
        return 1.0;
    }
    2.0 * la.min(lb) as f32 / (la + lb) as f32
}

/// A single error occurrence, possibly spanning a whole traceback.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub pod_name: String,
    pub service: String,
    pub pod_kind: PodKind,
    pub timestamp: NaiveDateTime,
    pub severity: Severity,
    pub raw_text: String,
    pub signature: String,
    pub has_traceback: bool,
}

/// Split a pod log into error records.
///
/// An anchored line containing `Traceback (most recent call last)` opens a
/// block; the following anchored lines with the same timestamp, pid, level
/// and module belong to that block.
pub fn extract_error_records(pod: &ClassifiedPod, text: &str) -> Vec<ErrorRecord> {
    let mut records = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(head) = parse_anchored_line(line) else {
            continue;
        };

        let mut raw = vec![line.trim_end()];
        let mut remainders = vec![head.remainder];
        let has_traceback = head.remainder.contains("Traceback (most recent call last)");

        if has_traceback {
            while let Some(&next) = lines.peek() {
                match parse_anchored_line(next) {
                    Some(cont)
                        if cont.timestamp == head.timestamp
                            && cont.pid == head.pid
                            && cont.severity == head.severity
                            && cont.module == head.module =>
                    {
                        raw.push(next.trim_end());
                        remainders.push(cont.remainder);
                        lines.next();
                    }
                    _ => break,
                }
            }
        }

        records.push(ErrorRecord {
            pod_name: pod.name.clone(),
            service: pod.service.clone(),
            pod_kind: pod.kind,
            timestamp: head.timestamp,
            severity: head.severity,
            raw_text: raw.join("\n"),
            signature: normalize_signature(&remainders.join(" ")),
            has_traceback,
        });
    }

    records
}

/// A group of similar error records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorCluster {
    pub signature: String,
    pub severity: Severity,

    /// Pod where the first occurrence was seen.
    pub pod_name: String,
    pub service: String,
    pub pod_kind: PodKind,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub occurrence_count: u64,
    pub representative: String,
    pub has_traceback: bool,
}

impl ErrorCluster {
    fn from_record(record: ErrorRecord) -> Self {
        Self {
            signature: record.signature,
            severity: record.severity,
            pod_name: record.pod_name,
            service: record.service,
            pod_kind: record.pod_kind,
            first_seen: record.timestamp,
            last_seen: record.timestamp,
            occurrence_count: 1,
            representative: record.raw_text,
            has_traceback: record.has_traceback,
        }
    }

    fn record_occurrence(&mut self, at: NaiveDateTime) {
        self.occurrence_count += 1;
        if at > self.last_seen {
            self.last_seen = at;
        }
    }
}

/// Incremental clustering over one log window.
#[derive(Debug, Clone)]
pub struct ErrorDeduplicator {
    threshold: f32,
    clusters: Vec<ErrorCluster>,
    total_errors: u64,
    by_service: BTreeMap<String, u64>,
    pods_analyzed: BTreeSet<String>,
}

impl ErrorDeduplicator {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            clusters: Vec::new(),
            total_errors: 0,
            by_service: BTreeMap::new(),
            pods_analyzed: BTreeSet::new(),
        }
    }

    /// Add one record, merging it into the first sufficiently similar
    /// cluster of the same severity.
    pub fn ingest(&mut self, record: ErrorRecord) {
        self.total_errors += 1;
        *self.by_service.entry(record.service.clone()).or_default() += 1;
        self.pods_analyzed.insert(record.pod_name.clone());

        let threshold = self.threshold;
        let matched = self.clusters.iter_mut().find(|c| {
            c.severity == record.severity
                && similarity_upper_bound(&c.signature, &record.signature) >= threshold
                && similarity(&c.signature, &record.signature) >= threshold
        });

        match matched {
            Some(cluster) => cluster.record_occurrence(record.timestamp),
            None => self.clusters.push(ErrorCluster::from_record(record)),
        }
    }

    /// Scan one pod's log text and ingest every record found. Returns the
    /// number of records.
    pub fn ingest_log(&mut self, pod: &ClassifiedPod, text: &str) -> usize {
        let records = extract_error_records(pod, text);
        let n = records.len();
        for record in records {
            self.ingest(record);
        }
        n
    }

    pub fn clusters(&self) -> &[ErrorCluster] {
        &self.clusters
    }

    pub fn into_report(self, window_start: DateTime<Utc>) -> ErrorReport {
        let mut clusters = self.clusters;
        clusters.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(b.occurrence_count.cmp(&a.occurrence_count))
        });
        let critical_count = clusters
            .iter()
            .filter(|c| c.severity == Severity::Critical)
            .count();

        ErrorReport {
            window_start,
            total_errors: self.total_errors,
            unique_count: clusters.len(),
            critical_count,
            by_service: self.by_service,
            pods_analyzed: self.pods_analyzed.into_iter().collect(),
            clusters,
        }
    }
}

/// Deduplicated errors of one log window, CRITICAL first then by count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub window_start: DateTime<Utc>,
    pub total_errors: u64,
    pub unique_count: usize,
    pub critical_count: usize,
    pub by_service: BTreeMap<String, u64>,
    pub pods_analyzed: Vec<String>,
    pub clusters: Vec<ErrorCluster>,
}

impl ErrorReport {
    pub fn empty(window_start: DateTime<Utc>) -> Self {
        ErrorDeduplicator::new(1.0).into_report(window_start)
    }
}

/// Collect and deduplicate errors from every classified pod, reading logs
/// written since `since`.
pub async fn collect_errors(
    cluster: &dyn ClusterClient,
    namespace: &str,
    classifier: &PodClassifier,
    since: DateTime<Utc>,
    threshold: f32,
) -> ErrorReport {
    let pods = match cluster.list_pods(namespace, &classifier.matcher()).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "Could not list pods for error collection");
            return ErrorReport::empty(since);
        }
    };

    let targets: Vec<ClassifiedPod> = pods
        .iter()
        .filter(|p| ANALYZED_PHASES.contains(&p.phase.as_str()))
        .filter_map(|p| classifier.classify(&p.name))
        .collect();

    if targets.is_empty() {
        warn!("No pods to analyze for errors");
        return ErrorReport::empty(since);
    }

    let logs: Vec<(ClassifiedPod, Option<String>)> = stream::iter(targets)
        .map(|pod| async move {
            match cluster.pod_logs(namespace, &pod.name, since).await {
                Ok(text) => (pod, Some(text)),
                Err(e) => {
                    warn!(pod = %pod.name, error = %e, "Failed to get logs");
                    (pod, None)
                }
            }
        })
        .buffered(LOG_FETCH_CONCURRENCY)
        .collect()
        .await;

    let mut dedup = ErrorDeduplicator::new(threshold);
    for (pod, text) in &logs {
        let Some(text) = text else { continue };
        let found = dedup.ingest_log(pod, text);
        if found > 0 {
            debug!(pod = %pod.name, errors = found, "Collected errors");
        }
        METRICS.add_error_lines(found as u64);
    }

    let report = dedup.into_report(since);
    info!(
        total = report.total_errors,
        unique = report.unique_count,
        critical = report.critical_count,
        "Error deduplication complete"
    );
    report
}
