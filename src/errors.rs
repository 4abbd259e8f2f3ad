//! Error types for the collection pipeline.
//!
//! Failures are contained at the smallest unit that can be retried. Only
//! [`ConfigError`] is fatal, and only at startup. Transport failures feed the
//! fetcher's recovery path, persistence failures are logged per file.

use std::path::PathBuf;
use thiserror::Error;

/// Missing or malformed configuration discovered at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid CSV in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("'query' column not found in {0}")]
    MissingQueryColumn(PathBuf),

    #[error("no contexts configured")]
    NoContexts,

    #[error("duplicate context label: {0}")]
    DuplicateContext(String),

    #[error("context label {0:?} may only contain ASCII letters, digits, '.' and '-'")]
    InvalidContextLabel(String),

    #[error("no execution unit configured for context {0}")]
    MissingUnit(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure invoking a remote execution unit.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unit endpoint answered with status {0}")]
    Status(u16),

    #[error("could not decode unit response: {0}")]
    Decode(String),

    #[error("unit invocation timed out")]
    Timeout,
}

impl TransportError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TransportError::Status(code) => *code == 429 || (500..600).contains(code),
            TransportError::Decode(_) => false,
            TransportError::Timeout => true,
        }
    }
}

/// Failure writing a dataset or report file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("serialization error at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure in the article-content stage.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("no article text extracted from {0}")]
    Empty(String),

    #[error("unsupported url {0}")]
    BadUrl(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ContentError {
    pub fn is_transient(&self) -> bool {
        match self {
            ContentError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ContentError::Status { status, .. } => *status == 429 || *status >= 500,
            ContentError::Empty(_)
            | ContentError::BadUrl(_)
            | ContentError::Persistence(_) => false,
        }
    }
}
