//! tempest-soak core
//!
//! Drives a test-run custom resource repeatedly against a cluster and turns
//! what it leaves behind into structured data:
//! - Submits CRs per iteration and waits for a terminal phase
//! - Samples pod phase, readiness, restarts and resource usage concurrently
//! - Extracts test results from pod log text, even from interrupted runs
//! - Deduplicates ERROR/CRITICAL service log records
//! - Summarizes API request logs

pub mod api_requests;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod error;
pub mod extractor;
pub mod fakes;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod orchestrator;
pub mod pods;
pub mod record;
pub mod sampler;
pub mod telemetry;

// Re-export key types
pub use api_requests::{ApiReport, ApiRequest};
pub use cluster::{ClusterClient, ClusterResult, CrId, CrManifest, CrStatus, PodLog, PodStatus, PodUsage};
pub use config::{CrTemplate, RunConfig};
pub use controller::CrController;
pub use dedup::{ErrorCluster, ErrorDeduplicator, ErrorReport, Severity};
pub use error::{ClusterError, ConfigError, ParseError, Result, SoakError};
pub use extractor::{extract_cr_logs, extract_pod, ExtractionContext};
pub use model::{CrJob, CrPhase, PodSnapshot, TestCounts, TestEvent, TestStatus, TestSummary};
pub use orchestrator::{Orchestrator, RunHandle, RunPhase};
pub use pods::{PodClassifier, PodKind, PodMatcher};
pub use record::{write_run_record_json, write_run_summary_md, RunRecord, TerminationReason};
pub use sampler::{PodSampler, SnapshotStore};
