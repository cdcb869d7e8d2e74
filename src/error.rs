use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems detected while loading a test profile. A run never starts with one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid duration '{0}': expected e.g. 500ms, 10s, 1m30s")]
    Duration(String),

    #[error("negative duration '{0}' is not allowed")]
    NegativeDuration(String),

    #[error("no stages configured")]
    NoStages,

    #[error("stage {index}: {reason}")]
    Stage { index: usize, reason: String },

    #[error("invalid threshold '{expr}' for metric '{metric}': {reason}")]
    Threshold {
        metric: String,
        expr: String,
        reason: String,
    },

    #[error("invalid url '{url}': {reason}")]
    Url { url: String, reason: String },

    #[error("invalid scenario: {0}")]
    Scenario(String),

    #[error("invalid value for {name}: {reason}")]
    Option { name: &'static str, reason: String },
}

/// A single failed HTTP exchange. Recorded as a failed result; never aborts a run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    Build(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RequestError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            RequestError::Timeout(timeout)
        } else if err.is_connect() {
            RequestError::Connect(err.to_string())
        } else if err.is_builder() {
            RequestError::Build(err.to_string())
        } else {
            RequestError::Transport(err.to_string())
        }
    }
}

/// Run-level failures.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
