//! Error classification for the admission pipeline.
//!
//! Every failure carries a stable [`Kind`] for programmatic handling and maps onto one
//! [`Class`], which decides how it surfaces to the pushing user:
//!
//! - [`Class::UserRejectable`] and [`Class::PolicyViolation`] become `Output.error` with a short sentence.
//! - [`Class::Transient`] and [`Class::FatalBug`] propagate as errors and reject the push with a generic message.
//!
//! Post-receive swallows all classes after logging them, as refs are already updated by then.

use std::time::Duration;

/// Stable high-level error classification for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// I/O errors from filesystem, child processes or sockets
    Io,
    /// Malformed hook payloads or git output
    Protocol,
    /// Invalid input such as a ref update with two zero ids
    Validation,
    /// Requested entity not found
    NotFound,
    /// The caller is known but lacks permission
    Permission,
    /// The caller must authenticate first
    Unauthenticated,
    /// The client agent is not admitted
    NotAcceptable,
    /// A uniqueness or optimistic-lock conflict
    Conflict,
    /// Resource limit exceeded (size, count)
    Resource,
    /// Operation was cancelled because the request went away
    Cancelled,
    /// Internal bug or broken invariant
    Bug,
}

impl Kind {
    /// Returns true if this error kind indicates a temporary condition.
    pub fn is_temporary(self) -> bool {
        matches!(self, Kind::Io | Kind::Conflict)
    }

    /// Returns the suggested retry strategy for this error kind.
    pub fn retry_strategy(self) -> RetryStrategy {
        match self {
            Kind::Io => RetryStrategy::ExponentialBackoff { max_attempts: 3 },
            Kind::Conflict => RetryStrategy::Immediate { max_attempts: 5 },
            _ => RetryStrategy::None,
        }
    }
}

/// How an error surfaces to the user and the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    /// Rejected because of what was pushed, reported through `Output.error`.
    UserRejectable,
    /// A quota was exceeded, reported like [`Class::UserRejectable`] but logged distinctly.
    PolicyViolation,
    /// Infrastructure trouble, the push is rejected with a generic message.
    Transient,
    /// A bug or corrupt configuration, logged at error level.
    FatalBug,
}

/// Retry strategy for error recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// No retry should be attempted
    None,
    /// Retry immediately up to max_attempts times
    Immediate { max_attempts: u32 },
    /// Retry with linear backoff (100ms, 200ms, 300ms, ...)
    LinearBackoff { max_attempts: u32 },
    /// Retry with exponential backoff (100ms, 200ms, 400ms, ...)
    ExponentialBackoff { max_attempts: u32 },
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);

impl RetryStrategy {
    /// Total number of attempts including the first one.
    pub fn max_attempts(self) -> u32 {
        match self {
            RetryStrategy::None => 1,
            RetryStrategy::Immediate { max_attempts }
            | RetryStrategy::LinearBackoff { max_attempts }
            | RetryStrategy::ExponentialBackoff { max_attempts } => max_attempts.max(1),
        }
    }

    /// The pause before retry number `attempt` (1-based), or `None` once attempts are exhausted.
    pub fn delay(self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts() {
            return None;
        }
        Some(match self {
            RetryStrategy::None | RetryStrategy::Immediate { .. } => Duration::ZERO,
            RetryStrategy::LinearBackoff { .. } => BACKOFF_BASE * attempt,
            RetryStrategy::ExponentialBackoff { .. } => BACKOFF_BASE * 2u32.saturating_pow(attempt - 1),
        })
    }
}

/// Error type for operations provided by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    NotAcceptable(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0} was modified concurrently")]
    VersionConflict(String),
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("invalid ref update: {0}")]
    InvalidRefUpdate(String),
    #[error("invalid hook payload: {0}")]
    Protocol(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("protection rule \"{rule}\" has an invalid definition: {message}")]
    RuleDefinition { rule: String, message: String },
    #[error("git {command} failed with {status}: {stderr}")]
    Git {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("hook transport broken: {0}")]
    Transport(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invariant violated: {0}")]
    Bug(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<forge_serve_core::Error> for Error {
    fn from(err: forge_serve_core::Error) -> Self {
        match err {
            forge_serve_core::Error::Io(err) => Error::Io(err),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl Error {
    /// Fast classification helper returning a stable error kind.
    pub fn kind(&self) -> Kind {
        match self {
            Error::Unauthorized => Kind::Unauthenticated,
            Error::NotAcceptable(_) => Kind::NotAcceptable,
            Error::Forbidden(_) => Kind::Permission,
            Error::NotFound(_) => Kind::NotFound,
            Error::Conflict(_) | Error::VersionConflict(_) => Kind::Conflict,
            Error::LimitExceeded(_) => Kind::Resource,
            Error::InvalidRefUpdate(_) | Error::BadRequest(_) => Kind::Validation,
            Error::Protocol(_) => Kind::Protocol,
            Error::RuleDefinition { .. } | Error::Config(_) | Error::Bug(_) => Kind::Bug,
            Error::Git { .. } | Error::Transport(_) | Error::Store(_) | Error::Io(_) => Kind::Io,
            Error::Cancelled => Kind::Cancelled,
        }
    }

    /// The surface this error takes towards the user, see the module docs.
    pub fn class(&self) -> Class {
        match self.kind() {
            Kind::Resource => Class::PolicyViolation,
            Kind::Bug => Class::FatalBug,
            Kind::Io | Kind::Protocol | Kind::Cancelled => Class::Transient,
            Kind::Validation
            | Kind::NotFound
            | Kind::Permission
            | Kind::Unauthenticated
            | Kind::NotAcceptable
            | Kind::Conflict => Class::UserRejectable,
        }
    }

    /// Get the suggested retry strategy for this error.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            // A uniqueness conflict will not go away by itself, only lost optimistic locks do.
            Error::Conflict(_) => RetryStrategy::None,
            _ => self.kind().retry_strategy(),
        }
    }

    pub(crate) fn git(command: impl Into<String>, status: impl std::fmt::Display, stderr: &[u8]) -> Self {
        Error::Git {
            command: command.into(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_owned(),
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }
}

/// Run `op` until it succeeds or its error's [`RetryStrategy`] is exhausted, sleeping in between.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match err.retry_strategy().delay(attempt) {
                Some(pause) => {
                    tracing::debug!(attempt, error = %err, "retrying");
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}
