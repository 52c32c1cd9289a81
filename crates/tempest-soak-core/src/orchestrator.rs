//! Iteration orchestration and run recording.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::api_requests::{collect_api_requests, ApiReport};
use crate::cluster::{ClusterClient, CrId, CrManifest};
use crate::config::RunConfig;
use crate::controller::CrController;
use crate::dedup::{collect_errors, ErrorReport};
use crate::error::ConfigError;
use crate::extractor::extract_cr_logs;
use crate::model::{CrJob, CrPhase, TestEvent};
use crate::obs;
use crate::pods::{PodClassifier, PodMatcher};
use crate::record::{RunRecord, TerminationReason};
use crate::sampler::{PodSampler, SnapshotStore};

/// Where the orchestrator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Running,
    SubmitCrs,
    AwaitCompletion,
    ExtractResults,
    Cleanup,
    Deadline,
    Cancelled,
    Draining,
    Terminated,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Idle => "Idle",
            RunPhase::Running => "Running",
            RunPhase::SubmitCrs => "SubmitCRs",
            RunPhase::AwaitCompletion => "AwaitCompletion",
            RunPhase::ExtractResults => "ExtractResults",
            RunPhase::Cleanup => "Cleanup",
            RunPhase::Deadline => "Deadline",
            RunPhase::Cancelled => "Cancelled",
            RunPhase::Draining => "Draining",
            RunPhase::Terminated => "Terminated",
        }
    }
}

#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    iterations: u32,
    reason: Option<TerminationReason>,
    jobs: Vec<CrJob>,
    events: Vec<TestEvent>,
    errors: Option<ErrorReport>,
    api: Option<ApiReport>,
}

/// Cloneable read access to a run, usable while the run is in progress.
///
/// Jobs and events are only ever appended; [`RunHandle::record`] copies a
/// consistent prefix of everything recorded so far.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: Uuid,
    namespace: String,
    state: Arc<RwLock<RunState>>,
    store: SnapshotStore,
}

impl RunHandle {
    fn new(namespace: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            namespace,
            state: Arc::new(RwLock::new(RunState {
                phase: RunPhase::Idle,
                started_at: Utc::now(),
                finished_at: None,
                iterations: 0,
                reason: None,
                jobs: Vec::new(),
                events: Vec::new(),
                errors: None,
                api: None,
            })),
            store: SnapshotStore::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.read(|s| s.phase)
    }

    /// Copy of everything recorded so far.
    pub fn record(&self) -> RunRecord {
        // Snapshots first: the sampler never waits on the run state lock.
        let snapshots = self.store.snapshot();
        self.read(|s| RunRecord {
            run_id: self.run_id,
            namespace: self.namespace.clone(),
            started_at: s.started_at,
            finished_at: s.finished_at,
            iterations: s.iterations,
            reason: s.reason,
            snapshots,
            jobs: s.jobs.clone(),
            events: s.events.clone(),
            errors: s.errors.clone(),
            api: s.api.clone(),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Repeats CR iterations until the deadline or cancellation, then drains.
pub struct Orchestrator {
    config: RunConfig,
    cluster: Arc<dyn ClusterClient>,
    controller: CrController,
    monitor: PodMatcher,
    classifier: PodClassifier,
    api_pods: PodMatcher,
    handle: RunHandle,
}

impl Orchestrator {
    /// Validate `config` and prepare a run. Nothing touches the cluster yet.
    pub fn new(config: RunConfig, cluster: Arc<dyn ClusterClient>) -> Result<Self, ConfigError> {
        config.validate()?;
        let controller = CrController::from_config(cluster.clone(), &config);
        Ok(Self {
            monitor: config.monitor_matcher()?,
            classifier: config.classifier()?,
            api_pods: config.api_matcher()?,
            handle: RunHandle::new(config.namespace.clone()),
            controller,
            cluster,
            config,
        })
    }

    /// Replace the controller, e.g. to shorten submit backoff.
    pub fn with_controller(mut self, controller: CrController) -> Self {
        self.controller = controller;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.handle.run_id()
    }

    pub fn phase(&self) -> RunPhase {
        self.handle.phase()
    }

    /// Read access for exporters that outlive a borrow of the orchestrator.
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    /// Copy of everything recorded so far.
    pub fn record(&self) -> RunRecord {
        self.handle.record()
    }

    /// Run until the configured duration has passed or `token` is
    /// cancelled. Always returns a record, also after cancellation.
    pub async fn run(&self, token: CancellationToken) -> RunRecord {
        let span = obs::run_span(&self.run_id().to_string());
        self.run_inner(token).instrument(span).await;
        self.record()
    }

    async fn run_inner(&self, token: CancellationToken) {
        let run_id = self.run_id().to_string();
        let started_at = Utc::now();
        self.handle.update(|s| s.started_at = started_at);
        obs::emit_run_started(&run_id, &self.config.namespace, self.config.run_duration_secs);
        self.set_phase(RunPhase::Running);

        let sampler_token = token.child_token();
        let sampler = PodSampler::new(
            self.cluster.clone(),
            self.config.namespace.clone(),
            self.monitor.clone(),
            self.handle.store.clone(),
        )
        .spawn(self.config.sampling_interval(), sampler_token.clone());

        let deadline = Instant::now() + self.config.run_duration();
        let mut window_start = started_at;

        let reason = loop {
            if token.is_cancelled() {
                break TerminationReason::Cancelled;
            }
            if Instant::now() >= deadline {
                break TerminationReason::Deadline;
            }

            window_start = Utc::now();
            self.run_iteration(&token).await;
        };

        self.handle.update(|s| s.reason = Some(reason));
        self.set_phase(match reason {
            TerminationReason::Deadline => RunPhase::Deadline,
            TerminationReason::Cancelled => RunPhase::Cancelled,
        });

        self.set_phase(RunPhase::Draining);
        let errors = collect_errors(
            self.cluster.as_ref(),
            &self.config.namespace,
            &self.classifier,
            window_start,
            self.config.similarity_threshold,
        )
        .await;
        self.handle.update(|s| s.errors = Some(errors));

        if self.api_pods.is_empty() {
            debug!("No API pod patterns configured; skipping request analysis");
        } else {
            let api = collect_api_requests(
                self.cluster.as_ref(),
                &self.config.namespace,
                &self.api_pods,
                window_start,
            )
            .await;
            self.handle.update(|s| s.api = Some(api));
        }

        sampler_token.cancel();
        if let Err(e) = sampler.await {
            warn!(error = %e, "Pod sampler task failed");
        }

        let (iterations, crs, test_events) = self.handle.update(|s| {
            s.finished_at = Some(Utc::now());
            (s.iterations, s.jobs.len(), s.events.len())
        });
        self.set_phase(RunPhase::Terminated);
        obs::emit_run_finished(&run_id, iterations, crs, test_events, reason.as_str());
    }

    /// One SubmitCRs -> AwaitCompletion -> ExtractResults -> Cleanup pass.
    async fn run_iteration(&self, token: &CancellationToken) {
        let iteration = self.handle.update(|s| {
            s.iterations += 1;
            s.iterations
        });
        obs::emit_iteration_started(
            &self.run_id().to_string(),
            iteration,
            self.config.crs_per_iteration,
        );

        self.set_phase(RunPhase::SubmitCrs);
        let mut submitted: Vec<CrId> = Vec::new();
        for index in 0..self.config.crs_per_iteration {
            if token.is_cancelled() {
                info!(iteration, "Cancellation requested; no further CRs submitted");
                break;
            }
            let manifest = CrManifest::for_attempt(&self.config, iteration, index);
            match self.controller.submit(&manifest).await {
                Ok(id) => {
                    obs::emit_cr_submitted(&id.name, iteration);
                    submitted.push(id);
                }
                Err(e) => {
                    warn!(cr = %manifest.name, error = %e, "CR submission failed");
                    let job = CrJob::submit_failed(manifest.name, iteration, e.to_string());
                    self.handle.update(|s| s.jobs.push(job));
                }
            }
        }

        self.set_phase(RunPhase::AwaitCompletion);
        let timeout = self.config.cr_timeout();
        let awaited = join_all(
            submitted
                .iter()
                .map(|id| self.controller.await_terminal(id, iteration, timeout, token)),
        )
        .await;
        let (mut jobs, timeout_logs): (Vec<CrJob>, Vec<_>) = awaited
            .into_iter()
            .map(|a| (a.job, a.timeout_logs))
            .unzip();

        // Timed-out CRs are already deleted; their logs were captured first.
        self.set_phase(RunPhase::ExtractResults);
        let cluster = self.cluster.as_ref();
        let logs = join_all(timeout_logs.into_iter().zip(&submitted).map(
            |(captured, id)| async move {
                match captured {
                    Some(logs) => logs,
                    None => cluster.get_logs(id).await,
                }
            },
        ))
        .await;

        let mut events = Vec::new();
        for ((job, id), logs) in jobs.iter_mut().zip(&submitted).zip(logs) {
            match logs {
                Ok(pod_logs) => {
                    let (cr_events, summary) = extract_cr_logs(iteration, &id.name, &pod_logs);
                    job.summary = summary;
                    events.extend(cr_events);
                }
                Err(e) => {
                    warn!(cr = %id.name, error = %e, "Could not fetch CR logs");
                    job.failure.get_or_insert_with(|| format!("log retrieval failed: {e}"));
                }
            }
        }
        self.handle.update(|s| s.events.extend(events));

        self.set_phase(RunPhase::Cleanup);
        join_all(
            jobs.iter()
                .zip(&submitted)
                .filter(|(job, _)| job.phase != CrPhase::TimedOut)
                .map(|(_, id)| self.controller.delete(id)),
        )
        .await;

        self.handle.update(|s| s.jobs.extend(jobs));

        // Nothing reached the cluster; pause instead of spinning on
        // rejected submissions.
        if submitted.is_empty() && !token.is_cancelled() {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        let changed = self.handle.update(|s| std::mem::replace(&mut s.phase, phase) != phase);
        if changed {
            obs::emit_run_phase(&self.run_id().to_string(), phase.as_str());
        }
    }
}
