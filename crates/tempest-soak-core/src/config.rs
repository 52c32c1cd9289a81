//! Run configuration.
//!
//! One immutable [`RunConfig`] is built at startup and shared read-only for
//! the lifetime of the run. [`RunConfig::validate`] must pass before any CR
//! is submitted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pods::{PodClassifier, PodMatcher};

/// Upper bound for `submit_retries`; the tenth retry already waits 17 minutes.
pub const MAX_SUBMIT_RETRIES: u32 = 10;

/// OpenStack control-plane pods whose logs are mined for errors.
pub const DEFAULT_SERVICE_POD_PATTERNS: &[&str] = &[
    "octavia-api-*",
    "octavia-worker-*",
    "octavia-housekeeping-*",
    "octavia-healthmanager-*",
    "designate-api-*",
    "designate-central-*",
    "designate-worker-*",
    "designate-producer-*",
    "designate-mdns-*",
    "neutron-*",
    "nova-api-*",
    "nova-cell*-conductor-*",
    "nova-scheduler-*",
    "nova-cell*-compute-*",
    "cinder-api-*",
    "cinder-scheduler-*",
    "cinder-volume-*",
    "cinder-backup-*",
    "glance-*",
    "keystone-*",
    "placement-*",
    "heat-api-*",
    "heat-engine-*",
    "manila-api-*",
    "manila-scheduler-*",
    "manila-share-*",
    "barbican-api-*",
    "barbican-worker-*",
    "horizon-*",
];

pub const DEFAULT_TEST_POD_PATTERNS: &[&str] = &["tempest-*"];

/// API pods whose request logs are analyzed.
pub const DEFAULT_API_POD_PATTERNS: &[&str] = &[
    "octavia-api-*",
    "designate-api-*",
    "neutron-*",
    "nova-api-*",
    "cinder-api-*",
    "glance-*",
    "keystone-*",
];

/// Template for the CR submitted on every attempt. `metadata` is filled in
/// per attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrTemplate {
    pub api_version: String,
    pub kind: String,

    /// Operator-specific `spec` section, passed through verbatim.
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Default for CrTemplate {
    fn default() -> Self {
        Self {
            api_version: "test.openstack.org/v1beta1".to_string(),
            kind: "Tempest".to_string(),
            spec: serde_json::json!({
                "tempestRun": {
                    "includeList": "tempest.api.identity.v3\n",
                    "concurrency": 4
                }
            }),
        }
    }
}

/// Immutable configuration for one soak run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub namespace: String,

    /// Pods sampled for phase/ready/restart/cpu/memory. Empty means
    /// service + test patterns.
    pub monitor_pod_patterns: Vec<String>,
    pub service_pod_patterns: Vec<String>,
    pub test_pod_patterns: Vec<String>,
    pub api_pod_patterns: Vec<String>,

    pub sampling_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub cr_timeout_secs: u64,
    pub run_duration_secs: u64,

    pub crs_per_iteration: u32,
    pub submit_retries: u32,

    /// Fuzzy-match threshold for error deduplication, in (0, 1].
    pub similarity_threshold: f32,

    /// Label selecting the pods that belong to a CR.
    pub cr_pod_label: String,
    pub cr_name_prefix: String,
    pub cr_template: CrTemplate,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            namespace: "openstack".to_string(),
            monitor_pod_patterns: Vec::new(),
            service_pod_patterns: to_owned(DEFAULT_SERVICE_POD_PATTERNS),
            test_pod_patterns: to_owned(DEFAULT_TEST_POD_PATTERNS),
            api_pod_patterns: to_owned(DEFAULT_API_POD_PATTERNS),
            sampling_interval_secs: 10,
            poll_interval_secs: 15,
            cr_timeout_secs: 7200,
            run_duration_secs: 3600,
            crs_per_iteration: 1,
            submit_retries: 2,
            similarity_threshold: 0.85,
            cr_pod_label: "instanceName".to_string(),
            cr_name_prefix: "tempest-soak".to_string(),
            cr_template: CrTemplate::default(),
        }
    }
}

fn to_owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

impl RunConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Check every field; the first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace", "must not be empty"));
        }
        for (field, value) in [
            ("sampling_interval_secs", self.sampling_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("cr_timeout_secs", self.cr_timeout_secs),
            ("run_duration_secs", self.run_duration_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.crs_per_iteration == 0 {
            return Err(invalid("crs_per_iteration", "must be at least 1"));
        }
        if self.submit_retries > MAX_SUBMIT_RETRIES {
            return Err(invalid(
                "submit_retries",
                format!("must be at most {MAX_SUBMIT_RETRIES}"),
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(invalid(
                "similarity_threshold",
                format!("{} is outside (0, 1]", self.similarity_threshold),
            ));
        }
        if self.cr_name_prefix.trim().is_empty() {
            return Err(invalid("cr_name_prefix", "must not be empty"));
        }
        if self.cr_template.kind.is_empty() || self.cr_template.api_version.is_empty() {
            return Err(invalid("cr_template", "apiVersion and kind are required"));
        }
        if self.service_pod_patterns.is_empty() && self.test_pod_patterns.is_empty() {
            return Err(invalid(
                "service_pod_patterns",
                "at least one service or test pattern is required",
            ));
        }

        self.monitor_matcher()?;
        self.classifier()?;
        self.api_matcher()?;
        Ok(())
    }

    pub fn monitor_matcher(&self) -> Result<PodMatcher, ConfigError> {
        if self.monitor_pod_patterns.is_empty() {
            let mut all = self.service_pod_patterns.clone();
            all.extend(self.test_pod_patterns.iter().cloned());
            PodMatcher::new(&all)
        } else {
            PodMatcher::new(&self.monitor_pod_patterns)
        }
    }

    pub fn classifier(&self) -> Result<PodClassifier, ConfigError> {
        Ok(PodClassifier::new(
            PodMatcher::new(&self.service_pod_patterns)?,
            PodMatcher::new(&self.test_pod_patterns)?,
        ))
    }

    pub fn api_matcher(&self) -> Result<PodMatcher, ConfigError> {
        PodMatcher::new(&self.api_pod_patterns)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cr_timeout(&self) -> Duration {
        Duration::from_secs(self.cr_timeout_secs)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run_duration_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.namespace, "openstack");
        assert_eq!(config.crs_per_iteration, 1);
        assert!((config.similarity_threshold - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = RunConfig {
            sampling_interval_secs: 0,
            ..RunConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sampling_interval_secs"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        for threshold in [0.0, -0.1, 1.5] {
            let config = RunConfig {
                similarity_threshold: threshold,
                ..RunConfig::default()
            };
            assert!(config.validate().is_err(), "threshold {threshold}");
        }
    }

    #[test]
    fn test_excessive_submit_retries_rejected() {
        let config = RunConfig {
            submit_retries: 33,
            ..RunConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("submit_retries"));

        let config = RunConfig {
            submit_retries: MAX_SUBMIT_RETRIES,
            ..RunConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let config = RunConfig {
            monitor_pod_patterns: vec!["nova-[".to_string()],
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Pattern { .. })
        ));
    }

    #[test]
    fn test_monitor_matcher_defaults_to_service_and_test() {
        let matcher = RunConfig::default().monitor_matcher().unwrap();
        assert!(matcher.is_match("nova-api-0"));
        assert!(matcher.is_match("tempest-tests-abcde"));
        assert!(!matcher.is_match("rabbitmq-server-0"));
    }

    #[test]
    fn test_load_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"namespace": "osp", "run_duration_secs": 60, "crs_per_iteration": 2}}"#
        )
        .unwrap();

        let config = RunConfig::from_json_file(file.path()).expect("load");
        assert_eq!(config.namespace, "osp");
        assert_eq!(config.run_duration_secs, 60);
        assert_eq!(config.crs_per_iteration, 2);
        assert_eq!(config.poll_interval_secs, 15);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"namespce": "typo"}}"#).unwrap();
        assert!(matches!(
            RunConfig::from_json_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
