//! Error types for the fleetplane controllers
//!
//! Every reconcile failure is scoped to the object being reconciled. The
//! classification helpers decide how the work queue treats a failure:
//! not-found is converged, conflicts are retried inside the updater,
//! terminal errors are surfaced once and not retried.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("conflict writing {kind} {key}: object was modified")]
    Conflict { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("cidr exhausted: no free address left in {pools} configured pool(s)")]
    CidrExhausted { pools: usize },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid field {path}: {message}")]
    FieldError { path: String, message: String },

    #[error("credential secret {key} not found")]
    MissingSecret { key: String },

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("{} of {total} seed(s) failed: {}", .failures.len(), summarize(.failures))]
    PartialSync {
        total: usize,
        failures: Vec<(String, Error)>,
    },

    #[error("{} migration hook(s) failed: {}", .0.len(), summarize(.0))]
    MigrationErrors(Vec<(String, Error)>),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("watch error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    #[error("operation cancelled")]
    Cancelled,
}

fn summarize(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl Error {
    pub fn not_found(kind: impl Into<String>, key: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn conflict(kind: impl Into<String>, key: impl ToString) -> Self {
        Error::Conflict {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn field(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::FieldError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The target vanished; callers treat this as already converged.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// A write presented a stale version token.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Malformed input that retrying cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_) | Error::FieldError { .. } | Error::YamlError(_)
        )
    }

    /// Whether the queue should retry quickly
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::Conflict { .. }
            | Error::Timeout { .. }
            | Error::PartialSync { .. }
            | Error::MissingSecret { .. }
            | Error::WatchError(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics and event reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::AlreadyExists { .. } => "already_exists",
            Error::CidrExhausted { .. } => "cidr_exhausted",
            Error::ConfigError(_) => "config",
            Error::FieldError { .. } => "field",
            Error::MissingSecret { .. } => "missing_secret",
            Error::Timeout { .. } => "timeout",
            Error::PartialSync { .. } => "partial_sync",
            Error::MigrationErrors(_) => "migration",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::WatchError(_) => "watch",
            Error::Cancelled => "cancelled",
        }
    }
}
