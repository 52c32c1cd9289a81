//! CR lifecycle: submit, wait for a terminal phase, delete.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterResult, CrId, CrManifest, PodLog};
use crate::config::RunConfig;
use crate::metrics::METRICS;
use crate::model::{CrJob, CrPhase};
use crate::obs::emit_cr_finished;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Outcome of waiting on one CR.
#[derive(Debug)]
pub struct AwaitedCr {
    pub job: CrJob,

    /// Pod logs read from a timed-out CR just before it was deleted.
    pub timeout_logs: Option<ClusterResult<Vec<PodLog>>>,
}

/// Drives single CRs through the cluster.
#[derive(Clone)]
pub struct CrController {
    cluster: Arc<dyn ClusterClient>,
    poll_interval: Duration,
    submit_retries: u32,
    backoff_base: Duration,
}

impl CrController {
    pub fn new(cluster: Arc<dyn ClusterClient>, poll_interval: Duration, submit_retries: u32) -> Self {
        Self {
            cluster,
            poll_interval,
            submit_retries,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    pub fn from_config(cluster: Arc<dyn ClusterClient>, config: &RunConfig) -> Self {
        Self::new(cluster, config.poll_interval(), config.submit_retries)
    }

    /// Base delay between submit attempts; doubles after each failure.
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Submit a manifest. Transient failures are retried with exponential
    /// backoff; anything else is returned at once.
    pub async fn submit(&self, manifest: &CrManifest) -> ClusterResult<CrId> {
        let max_attempts = self.submit_retries + 1;
        let mut attempt = 1;
        loop {
            match self.cluster.apply(manifest).await {
                Ok(id) => {
                    METRICS.inc_crs_submitted();
                    debug!(cr = %id, attempt, "CR applied");
                    return Ok(id);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        cr = %manifest.name,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "CR submit failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// saturating instead of overflowing.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }

    /// Poll until the CR reaches a terminal phase or `timeout` elapses.
    ///
    /// Cancellation does not cut the wait short: the CR is still awaited so
    /// its results can be extracted. On timeout the logs written so far are
    /// captured, then the CR is deleted.
    pub async fn await_terminal(
        &self,
        id: &CrId,
        iteration: u32,
        timeout: Duration,
        token: &CancellationToken,
    ) -> AwaitedCr {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut job = CrJob::new(id.name.clone(), iteration);
        let mut timeout_logs = None;
        let mut draining = false;

        loop {
            if !draining && token.is_cancelled() {
                info!(cr = %id.name, "Cancellation requested; draining in-flight CR");
                draining = true;
            }

            match self.cluster.get_status(id).await {
                Ok(status) => {
                    if status.phase != job.phase {
                        debug!(cr = %id.name, phase = %status.phase, message = ?status.message, "CR phase observed");
                    }
                    job.observe(status.phase);
                    if job.phase.is_terminal() {
                        break;
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(cr = %id.name, error = %e, "CR status poll failed; will retry");
                }
                Err(e) => {
                    warn!(cr = %id.name, error = %e, "CR status unavailable; giving up");
                    job.failure = Some(e.to_string());
                    job.observe(CrPhase::Error);
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                job.observe(CrPhase::TimedOut);
                METRICS.inc_crs_timed_out();
                timeout_logs = Some(self.cluster.get_logs(id).await);
                self.delete(id).await;
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        emit_cr_finished(&job.name, job.phase, started.elapsed().as_secs());
        AwaitedCr { job, timeout_logs }
    }

    /// Best-effort delete; failures are logged, never returned.
    pub async fn delete(&self, id: &CrId) {
        match self.cluster.delete(id).await {
            Ok(()) => debug!(cr = %id, "CR deleted"),
            Err(e) if e.is_not_found() => debug!(cr = %id, "CR already gone"),
            Err(e) => warn!(cr = %id, error = %e, "Failed to delete CR"),
        }
    }
}
