// src/infra/errors.rs — Error types for imgrefine

use thiserror::Error;

/// Typed failure reported by an external collaborator (image, vision, refine).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("'{service}' rejected credentials: {message}")]
    Auth { service: String, message: String },

    #[error("'{service}' rejected the request: {message}")]
    InvalidRequest { service: String, message: String },

    #[error("'{service}' server error: {message}")]
    Server { service: String, message: String },

    #[error("Rate limited by '{service}', retry after {retry_after_ms}ms")]
    RateLimited {
        service: String,
        retry_after_ms: u64,
    },

    #[error("'{service}' did not answer within {after_ms}ms")]
    Timeout { service: String, after_ms: u64 },

    #[error("'{service}' transport failure: {message}")]
    Transport { service: String, message: String },

    #[error("'{service}' returned an unusable response: {message}")]
    MalformedResponse { service: String, message: String },
}

impl ServiceError {
    /// Timeouts, rate limits, 5xx and dropped connections are worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ServiceError::Server { .. }
                | ServiceError::RateLimited { .. }
                | ServiceError::Timeout { .. }
                | ServiceError::Transport { .. }
        )
    }

    /// Rejected credentials or requests: retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ServiceError::Auth { .. } | ServiceError::InvalidRequest { .. }
        )
    }

    pub fn service(&self) -> &str {
        match self {
            ServiceError::Auth { service, .. }
            | ServiceError::InvalidRequest { service, .. }
            | ServiceError::Server { service, .. }
            | ServiceError::RateLimited { service, .. }
            | ServiceError::Timeout { service, .. }
            | ServiceError::Transport { service, .. }
            | ServiceError::MalformedResponse { service, .. } => service,
        }
    }

    /// Short label persisted in the `api_calls` audit table.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Auth { .. } => "auth",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Server { .. } => "server",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::Timeout { .. } => "timeout",
            ServiceError::Transport { .. } => "transport",
            ServiceError::MalformedResponse { .. } => "malformed",
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("No variant of {requested} could be generated: {last_error}")]
    GenerationExhausted { requested: u32, last_error: String },

    #[error("Refinement produced no usable prompt: {reason}")]
    RefinementDegenerate { reason: String },

    // Invariant breaks: never swallowed
    #[error("Lineage integrity violation: {0}")]
    Integrity(String),

    #[error("Claim on prompt version {version_id} is no longer held by {worker}")]
    ClaimLost { version_id: String, worker: String },

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_retriable(&self) -> bool {
        match self {
            PipelineError::Service(e) => e.is_retriable(),
            _ => self.is_busy(),
        }
    }

    /// Another connection held the database lock past the busy timeout.
    pub fn is_busy(&self) -> bool {
        match self {
            PipelineError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Failures that end processing of the current prompt version for good.
    /// `ClaimLost` is excluded: another worker owns the version now.
    pub fn is_permanent(&self) -> bool {
        !self.is_retriable() && !matches!(self, PipelineError::ClaimLost { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
