//! Pod name matching and classification.
//!
//! Patterns are glob-style (`nova-api-*`) and compiled once when the
//! matcher is built; ticks and scans reuse the compiled set.

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A compiled set of glob patterns over pod names.
#[derive(Debug, Clone)]
pub struct PodMatcher {
    patterns: Vec<Pattern>,
}

impl PodMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|source| ConfigError::Pattern {
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_match(&self, pod_name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(pod_name))
    }

    /// Index of the first matching pattern.
    pub fn position(&self, pod_name: &str) -> Option<usize> {
        self.patterns.iter().position(|p| p.matches(pod_name))
    }

    pub fn pattern(&self, index: usize) -> Option<&str> {
        self.patterns.get(index).map(|p| p.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Matcher accepting names matched by either set.
    pub fn union(&self, other: &PodMatcher) -> PodMatcher {
        let mut patterns = self.patterns.clone();
        patterns.extend(other.patterns.iter().cloned());
        PodMatcher { patterns }
    }
}

/// What kind of workload a pod belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PodKind {
    Service,
    Test,
}

/// A pod selected for log analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedPod {
    pub name: String,
    pub service: String,
    pub kind: PodKind,
}

/// Sorts pods into service pods and test pods.
#[derive(Debug, Clone)]
pub struct PodClassifier {
    service: PodMatcher,
    test: PodMatcher,
}

impl PodClassifier {
    pub fn new(service: PodMatcher, test: PodMatcher) -> Self {
        Self { service, test }
    }

    /// Classify a pod name. Service patterns take precedence over test
    /// patterns.
    pub fn classify(&self, pod_name: &str) -> Option<ClassifiedPod> {
        if let Some(idx) = self.service.position(pod_name) {
            let pattern = self.service.pattern(idx).unwrap_or(pod_name);
            return Some(ClassifiedPod {
                name: pod_name.to_string(),
                service: leading_segment(pattern),
                kind: PodKind::Service,
            });
        }

        if self.test.is_match(pod_name) {
            // tempest-<service>-<tests>-<hash>
            let service = pod_name
                .split('-')
                .nth(1)
                .filter(|s| !s.is_empty())
                .unwrap_or("tempest")
                .to_string();
            return Some(ClassifiedPod {
                name: pod_name.to_string(),
                service,
                kind: PodKind::Test,
            });
        }

        None
    }

    /// Matcher for every pod this classifier would accept.
    pub fn matcher(&self) -> PodMatcher {
        self.service.union(&self.test)
    }
}

pub(crate) fn leading_segment(pattern: &str) -> String {
    pattern
        .split(|c: char| c == '-' || c == '*' || c == '?' || c == '[')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(pattern)
        .to_string()
}
