//! Pod metrics sampling.
//!
//! A [`PodSampler`] runs as its own tokio task for the whole run. Every
//! tick it lists the monitored pods, queries cpu/memory for each and
//! appends one [`PodSnapshot`] per pod to the shared [`SnapshotStore`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::error::ClusterError;
use crate::metrics::METRICS;
use crate::model::PodSnapshot;
use crate::pods::PodMatcher;

#[derive(Debug, Default)]
struct StoreInner {
    snapshots: Vec<PodSnapshot>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// Append-only snapshot log shared between the sampler and readers.
///
/// Timestamps are strictly increasing per pod: a snapshot that would not
/// advance its pod's clock is moved 1µs past the previous one.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, mut snapshot: PodSnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = inner.last_seen.get(&snapshot.pod_name) {
            if snapshot.timestamp <= *prev {
                snapshot.timestamp = *prev + chrono::Duration::microseconds(1);
            }
        }
        inner
            .last_seen
            .insert(snapshot.pod_name.clone(), snapshot.timestamp);
        inner.snapshots.push(snapshot);
    }

    /// Copy of everything appended so far.
    pub fn snapshot(&self) -> Vec<PodSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodic pod phase and resource sampler.
pub struct PodSampler {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    matcher: PodMatcher,
    store: SnapshotStore,
    warned_unavailable: HashSet<String>,
}

impl PodSampler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        matcher: PodMatcher,
        store: SnapshotStore,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            matcher,
            store,
            warned_unavailable: HashSet::new(),
        }
    }

    /// Take one round of snapshots. Returns how many were stored.
    pub async fn sample_once(&mut self) -> usize {
        let pods = match self.cluster.list_pods(&self.namespace, &self.matcher).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Pod listing failed; skipping sample");
                return 0;
            }
        };

        let timestamp = Utc::now();
        let usages = join_all(
            pods.iter()
                .map(|p| self.cluster.get_pod_metrics(&self.namespace, &p.name)),
        )
        .await;

        let count = pods.len();
        for (pod, usage) in pods.into_iter().zip(usages) {
            let (cpu, memory) = match usage {
                Ok(u) => (Some(u.cpu_millicores), Some(u.memory_mib)),
                Err(e) => {
                    self.note_unavailable(&pod.name, &e);
                    (None, None)
                }
            };
            self.store.append(PodSnapshot {
                timestamp,
                pod_name: pod.name,
                phase: pod.phase,
                ready: pod.ready,
                total: pod.total,
                restarts: pod.restarts,
                cpu_millicores: cpu,
                memory_mib: memory,
            });
        }

        METRICS.add_snapshots(count as u64);
        debug!(pods = count, "Pod sample stored");
        count
    }

    fn note_unavailable(&mut self, pod: &str, error: &ClusterError) {
        if self.warned_unavailable.insert(pod.to_string()) {
            warn!(pod = %pod, error = %error, "Pod metrics unavailable; recording nulls");
        } else {
            debug!(pod = %pod, error = %error, "Pod metrics still unavailable");
        }
    }

    /// Sample every `period` until `token` is cancelled.
    pub async fn run(mut self, period: Duration, token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(namespace = %self.namespace, period_secs = period.as_secs(), "Pod sampler started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sample_once().await;
                }
            }
        }

        info!(snapshots = self.store.len(), "Pod sampler stopped");
    }

    pub fn spawn(self, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(period, token))
    }
}
