//! In-memory fake cluster (testing only)
//!
//! `FakeCluster` satisfies the [`ClusterClient`] contract without touching a
//! real cluster. CR phases, logs, pods and metrics are scripted up front and
//! every mutating call is recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cluster::*;
use crate::error::ClusterError;
use crate::model::CrPhase;
use crate::pods::PodMatcher;

#[derive(Debug, Default)]
struct FakeState {
    /// Phases returned by successive `get_status` calls; the last one sticks.
    phases: HashMap<String, VecDeque<CrPhase>>,
    default_phases: Vec<CrPhase>,
    apply_errors: HashMap<String, VecDeque<ClusterError>>,
    status_errors: HashMap<String, VecDeque<ClusterError>>,
    cr_logs: HashMap<String, Vec<PodLog>>,
    default_cr_logs: Vec<PodLog>,
    pods: Vec<PodStatus>,
    list_pods_error: Option<ClusterError>,
    metrics: HashMap<String, PodUsage>,
    pod_logs: HashMap<String, String>,

    applied: Vec<String>,
    deleted: Vec<CrId>,
    status_calls: HashMap<String, usize>,
    metrics_calls: usize,
}

/// Scriptable in-memory cluster.
#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    /// CRs without a script complete on the first poll.
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().default_phases = vec![CrPhase::Completed];
        fake
    }

    /// Phases reported for `cr_name`, one per poll.
    pub fn script_phases(&self, cr_name: &str, phases: Vec<CrPhase>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .phases
            .insert(cr_name.to_string(), phases.into());
        self
    }

    /// Phases reported for every CR without its own script.
    pub fn script_default_phases(&self, phases: Vec<CrPhase>) -> &Self {
        self.state.lock().unwrap().default_phases = phases;
        self
    }

    /// Fail the next `apply` of `cr_name` with `error`. Queued errors are
    /// consumed one per call.
    pub fn fail_apply(&self, cr_name: &str, error: ClusterError) -> &Self {
        self.state
            .lock()
            .unwrap()
            .apply_errors
            .entry(cr_name.to_string())
            .or_default()
            .push_back(error);
        self
    }

    pub fn fail_status(&self, cr_name: &str, error: ClusterError) -> &Self {
        self.state
            .lock()
            .unwrap()
            .status_errors
            .entry(cr_name.to_string())
            .or_default()
            .push_back(error);
        self
    }

    pub fn set_cr_logs(&self, cr_name: &str, logs: Vec<PodLog>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .cr_logs
            .insert(cr_name.to_string(), logs);
        self
    }

    /// Logs returned for every CR without its own logs.
    pub fn set_default_cr_logs(&self, logs: Vec<PodLog>) -> &Self {
        self.state.lock().unwrap().default_cr_logs = logs;
        self
    }

    pub fn set_pods(&self, pods: Vec<PodStatus>) -> &Self {
        self.state.lock().unwrap().pods = pods;
        self
    }

    pub fn fail_list_pods(&self, error: Option<ClusterError>) -> &Self {
        self.state.lock().unwrap().list_pods_error = error;
        self
    }

    /// Usage reported for `pod`. Pods without usage are `MetricsUnavailable`.
    pub fn set_metrics(&self, pod: &str, usage: PodUsage) -> &Self {
        self.state
            .lock()
            .unwrap()
            .metrics
            .insert(pod.to_string(), usage);
        self
    }

    pub fn set_pod_logs(&self, pod: &str, text: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .pod_logs
            .insert(pod.to_string(), text.to_string());
        self
    }

    /// Names of all CRs applied so far, in order.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn deleted(&self) -> Vec<CrId> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn status_calls(&self, cr_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .status_calls
            .get(cr_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn metrics_calls(&self) -> usize {
        self.state.lock().unwrap().metrics_calls
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn apply(&self, manifest: &CrManifest) -> ClusterResult<CrId> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state
            .apply_errors
            .get_mut(&manifest.name)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }
        state.applied.push(manifest.name.clone());
        if !state.phases.contains_key(&manifest.name) {
            let script = state.default_phases.clone().into();
            state.phases.insert(manifest.name.clone(), script);
        }
        Ok(manifest.id())
    }

    async fn get_status(&self, id: &CrId) -> ClusterResult<CrStatus> {
        let mut state = self.state.lock().unwrap();
        *state.status_calls.entry(id.name.clone()).or_default() += 1;
        if let Some(err) = state
            .status_errors
            .get_mut(&id.name)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let script = state
            .phases
            .get_mut(&id.name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: id.kind.clone(),
                name: id.name.clone(),
            })?;
        let phase = if script.len() > 1 {
            script.pop_front().unwrap_or(CrPhase::Pending)
        } else {
            script.front().copied().unwrap_or(CrPhase::Pending)
        };
        Ok(CrStatus::new(phase))
    }

    async fn get_logs(&self, id: &CrId) -> ClusterResult<Vec<PodLog>> {
        let state = self.state.lock().unwrap();
        if state.deleted.iter().any(|d| d.name == id.name) {
            return Err(ClusterError::NotFound {
                kind: id.kind.clone(),
                name: id.name.clone(),
            });
        }
        Ok(state
            .cr_logs
            .get(&id.name)
            .cloned()
            .unwrap_or_else(|| state.default_cr_logs.clone()))
    }

    async fn delete(&self, id: &CrId) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.phases.remove(&id.name).is_none() {
            return Err(ClusterError::NotFound {
                kind: id.kind.clone(),
                name: id.name.clone(),
            });
        }
        state.deleted.push(id.clone());
        Ok(())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        matcher: &PodMatcher,
    ) -> ClusterResult<Vec<PodStatus>> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.list_pods_error {
            return Err(err.clone());
        }
        Ok(state
            .pods
            .iter()
            .filter(|p| matcher.is_match(&p.name))
            .cloned()
            .collect())
    }

    async fn get_pod_metrics(&self, _namespace: &str, pod: &str) -> ClusterResult<PodUsage> {
        let mut state = self.state.lock().unwrap();
        state.metrics_calls += 1;
        state
            .metrics
            .get(pod)
            .copied()
            .ok_or_else(|| ClusterError::MetricsUnavailable {
                pod: pod.to_string(),
                message: "metrics not available yet".to_string(),
            })
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        _since: DateTime<Utc>,
    ) -> ClusterResult<String> {
        let state = self.state.lock().unwrap();
        state
            .pod_logs
            .get(pod)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "pod".to_string(),
                name: pod.to_string(),
            })
    }
}

/// A running pod with all containers ready.
pub fn running_pod(name: &str) -> PodStatus {
    PodStatus {
        name: name.to_string(),
        phase: "Running".to_string(),
        ready: 1,
        total: 1,
        restarts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    fn manifest(name: &str) -> CrManifest {
        let mut m = CrManifest::for_attempt(&RunConfig::default(), 1, 0);
        m.name = name.to_string();
        m
    }

    #[tokio::test]
    async fn test_scripted_phases_advance_then_stick() {
        let fake = FakeCluster::new();
        fake.script_phases("cr", vec![CrPhase::Pending, CrPhase::Running, CrPhase::Completed]);
        let id = fake.apply(&manifest("cr")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(fake.get_status(&id).await.unwrap().phase);
        }
        assert_eq!(
            seen,
            vec![
                CrPhase::Pending,
                CrPhase::Running,
                CrPhase::Completed,
                CrPhase::Completed,
                CrPhase::Completed
            ]
        );
        assert_eq!(fake.status_calls("cr"), 5);
    }

    #[tokio::test]
    async fn test_apply_error_consumed_once() {
        let fake = FakeCluster::new();
        fake.fail_apply("cr", ClusterError::transient("apply", "timeout"));
        assert!(fake.apply(&manifest("cr")).await.is_err());
        assert!(fake.apply(&manifest("cr")).await.is_ok());
        assert_eq!(fake.applied(), vec!["cr".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_twice_is_not_found() {
        let fake = FakeCluster::new();
        let id = fake.apply(&manifest("cr")).await.unwrap();
        fake.delete(&id).await.unwrap();
        assert!(fake.delete(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_metrics_unavailable() {
        let fake = FakeCluster::new();
        let err = fake.get_pod_metrics("ns", "nova-api-0").await.unwrap_err();
        assert!(matches!(err, ClusterError::MetricsUnavailable { .. }));
    }
}
