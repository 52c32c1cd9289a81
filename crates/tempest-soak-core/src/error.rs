//! Error taxonomy for tempest-soak.
//!
//! Cluster failures are split into retryable and terminal kinds so callers
//! can decide locally whether to try again. Log parsing failures never abort
//! an extraction; they are reported so the offending line can be classified.

/// Errors produced while talking to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Network hiccup, command timeout or a non-specific failure.
    #[error("transient cluster error during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// Unauthorized, forbidden or a required resource type is missing.
    #[error("terminal cluster error during {operation}: {message}")]
    Terminal { operation: String, message: String },

    /// The cluster refused the submitted manifest.
    #[error("manifest for {name} rejected: {message}")]
    ApplyRejected { name: String, message: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// No metrics backend answered for the pod.
    #[error("metrics unavailable for pod {pod}: {message}")]
    MetricsUnavailable { pod: String, message: String },
}

impl ClusterError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ClusterError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn terminal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ClusterError::Terminal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Malformed log segments found while scanning test output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed result line {line_no}: {reason}")]
    MalformedResultLine { line_no: usize, reason: String },

    #[error("malformed totals block: {0}")]
    MalformedTotals(String),
}

/// Invalid run configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid pod pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Umbrella error for tempest-soak operations.
#[derive(Debug, thiserror::Error)]
pub enum SoakError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tempest-soak operations.
pub type Result<T> = std::result::Result<T, SoakError>;
