//! Cluster command interface.
//!
//! Defines the `ClusterClient` async trait the controller, sampler and
//! log collectors talk through, plus the manifest and status types that
//! cross it. The production backend lives in `tempest-soak-oc`; tests use
//! [`crate::fakes::FakeCluster`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CrTemplate, RunConfig};
use crate::error::ClusterError;
use crate::model::CrPhase;
use crate::pods::PodMatcher;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Everything the core needs from the cluster.
///
/// Implementations must bound every call with their own timeout.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a CR manifest.
    async fn apply(&self, manifest: &CrManifest) -> ClusterResult<CrId>;

    /// Current phase of a submitted CR.
    async fn get_status(&self, id: &CrId) -> ClusterResult<CrStatus>;

    /// Log text of every pod that belongs to the CR.
    async fn get_logs(&self, id: &CrId) -> ClusterResult<Vec<PodLog>>;

    /// Delete a CR. `NotFound` is returned, not swallowed.
    async fn delete(&self, id: &CrId) -> ClusterResult<()>;

    /// Pods in `namespace` whose names match `matcher`.
    async fn list_pods(&self, namespace: &str, matcher: &PodMatcher)
        -> ClusterResult<Vec<PodStatus>>;

    /// CPU and memory usage of one pod.
    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> ClusterResult<PodUsage>;

    /// Log text of a pod since `since`.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        since: DateTime<Utc>,
    ) -> ClusterResult<String>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Identity of a submitted CR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrId {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for CrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// A fully rendered CR manifest for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrManifest {
    pub name: String,
    pub namespace: String,
    pub template: CrTemplate,
}

impl CrManifest {
    /// Manifest for CR number `index` of `iteration`.
    pub fn for_attempt(config: &RunConfig, iteration: u32, index: u32) -> Self {
        Self {
            name: format!("{}-{}-{}", config.cr_name_prefix, iteration, index),
            namespace: config.namespace.clone(),
            template: config.cr_template.clone(),
        }
    }

    pub fn id(&self) -> CrId {
        CrId {
            kind: self.template.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// The manifest as the JSON document submitted to the cluster.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": self.template.api_version,
            "kind": self.template.kind,
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": self.template.spec,
        })
    }
}

/// Reported state of a CR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrStatus {
    pub phase: CrPhase,
    pub message: Option<String>,
}

impl CrStatus {
    pub fn new(phase: CrPhase) -> Self {
        Self {
            phase,
            message: None,
        }
    }
}

/// Log text of one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLog {
    pub pod_name: String,
    pub text: String,
}

/// Phase, readiness and restarts of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub phase: String,
    pub ready: u32,
    pub total: u32,
    pub restarts: u32,
}

/// Resource usage of one pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodUsage {
    pub cpu_millicores: u64,
    pub memory_mib: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_naming() {
        let config = RunConfig::default();
        let manifest = CrManifest::for_attempt(&config, 3, 1);
        assert_eq!(manifest.name, "tempest-soak-3-1");
        assert_eq!(manifest.namespace, "openstack");

        let id = manifest.id();
        assert_eq!(id.kind, "Tempest");
        assert_eq!(id.to_string(), "openstack/Tempest/tempest-soak-3-1");
    }

    #[test]
    fn test_manifest_json_shape() {
        let config = RunConfig::default();
        let json = CrManifest::for_attempt(&config, 1, 0).to_json();
        assert_eq!(json["apiVersion"], "test.openstack.org/v1beta1");
        assert_eq!(json["kind"], "Tempest");
        assert_eq!(json["metadata"]["name"], "tempest-soak-1-0");
        assert_eq!(json["spec"]["tempestRun"]["concurrency"], 4);
    }
}
