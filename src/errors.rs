//! Typed error hierarchy for the marketscope engine.
//!
//! Four top-level enums cover the four subsystems:
//! - `ProviderError` — a single failed call to one upstream provider
//! - `DispatchError` — the fallback dispatcher ran out of candidates
//! - `StorageError` — checkpoint-store failures (always fatal to a session)
//! - `SessionError` — lifecycle transitions the session manager rejects
//!
//! Every failure observed at a provider or component boundary is classified
//! into an [`ErrorKind`], which is what artifacts and reports carry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification applied to every failure crossing a subsystem boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider returned 429, a quota was exhausted, or a cooldown was signalled
    RateLimited,
    /// Provider rejected credentials (401/403)
    Auth,
    /// A deadline elapsed
    Timeout,
    /// Provider 5xx or otherwise failed upstream
    ServerError,
    /// Call succeeded but returned no usable content
    EmptyResponse,
    /// Response could not be decoded into the expected shape
    Protocol,
    /// Executor returned structurally unacceptable output
    ValidationFailed,
    /// A required predecessor errored (informational)
    DependencyMissing,
    /// Checkpoint write or read failed
    Storage,
    /// Cancellation flag was observed
    Cancelled,
    /// The dispatcher could not find a live provider
    AllProvidersExhausted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::EmptyResponse => "empty_response",
            Self::Protocol => "protocol",
            Self::ValidationFailed => "validation_failed",
            Self::DependencyMissing => "dependency_missing",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::AllProvidersExhausted => "all_providers_exhausted",
        };
        f.write_str(s)
    }
}

/// A single failed attempt against one named provider.
///
/// Adapters perform exactly one attempt and return; all retry and rotation
/// logic lives in the dispatcher.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limited: {message}")]
    RateLimited { message: String },

    #[error("credentials rejected: {message}")]
    Auth { message: String },

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("upstream error: {message}")]
    Server { message: String },

    #[error("provider returned no usable content")]
    Empty,

    #[error("malformed provider response: {message}")]
    Protocol { message: String },

    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Classify this failure for registry bookkeeping and artifacts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Server { .. } => ErrorKind::ServerError,
            Self::Empty => ErrorKind::EmptyResponse,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Map an HTTP status line into the provider error taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            429 => Self::RateLimited { message },
            401 | 403 => Self::Auth { message },
            500..=599 => Self::Server { message },
            _ => Self::Protocol {
                message: format!("unexpected status {status}: {message}"),
            },
        }
    }
}

/// The fallback dispatcher exhausted every live candidate for a class.
///
/// Individual provider failures are absorbed by the dispatcher; this is the
/// only error it surfaces to component executors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no live {class} provider could serve the request (tried: {tried:?})")]
    AllProvidersExhausted { class: String, tried: Vec<String> },

    #[error("request cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllProvidersExhausted { .. } => ErrorKind::AllProvidersExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Checkpoint-store failures. These propagate: a session that cannot
/// checkpoint is marked failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write artifact '{stage}' for session {session}: {source}")]
    WriteFailed {
        session: String,
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode artifact '{stage}': {source}")]
    Encode {
        stage: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no artifact found for stage '{stage}' in session {session}")]
    ArtifactNotFound { session: String, stage: String },

    #[error("session {0} has no persisted artifacts")]
    SessionNotFound(String),
}

/// Lifecycle transitions rejected by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("cannot {action} session {id} from state '{status}'")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: String,
    },

    #[error("session {0} already has an executor running")]
    AlreadyRunning(String),

    #[error("session capacity reached ({0} concurrent sessions)")]
    CapacityExhausted(usize),

    #[error("at least one LLM and one search provider must be configured")]
    ProvidersUnconfigured,

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
