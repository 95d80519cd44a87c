//! Error types for Warden.
//!
//! Two classes of failure exist. Contract violations (programmer errors such as
//! pausing a limiter twice or using a destroyed bucket) panic with a
//! [`LimitError`] payload through [`violation`]; they are meant to be recovered,
//! if at all, at a supervisory boundary with [`catch_violation`]. Expected
//! conditions are returned as ordinary `Result`s.

use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::error;

use crate::limits::LimitKind;

/// Errors raised by limits, registries, buckets and limiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    #[error("token bucket is destroyed")]
    DestroyedTokenBucket,

    #[error("state id not set")]
    StateIdNotSet,

    #[error("state id already set")]
    StateIdAlreadySet,

    #[error("token depletion already paused")]
    TokenDepletionAlreadyPaused,

    #[error("token depletion is not paused")]
    TokenDepletionNotPaused,

    #[error("cannot compare limit '{left}' with limit '{right}': different names")]
    NameMismatch { left: String, right: String },

    #[error("cannot compare limits named '{name}': different kinds ({left:?} and {right:?})")]
    KindMismatch {
        name: String,
        left: LimitKind,
        right: LimitKind,
    },

    #[error("cannot take {count} tokens from bucket ({name}), only {available} token(s) available")]
    InsufficientTokens {
        name: String,
        count: i64,
        available: i64,
    },

    #[error("token count {count} should not exceed the bucket's capacity {capacity}")]
    CountExceedsCapacity { count: i64, capacity: i64 },

    #[error("token count {0} should not be negative")]
    NegativeCount(i64),

    #[error("cannot register the limit '{0}' with a different kind or minimum")]
    ConflictingRegistration(String),

    #[error("'{0}' is not a registered limit")]
    UnregisteredLimit(String),

    #[error("'{0}' is an auto-depleting limit")]
    AutoDepletingLimit(String),

    #[error("value of limit '{name}' does not have the registered kind {expected:?}")]
    WrongKind { name: String, expected: LimitKind },

    #[error("value {value} for limit '{name}' is too low, minimum is {minimum}")]
    BelowMinimum {
        name: String,
        value: i64,
        minimum: i64,
    },

    #[error("value {value} for limit '{name}' is too high, hard maximum is {maximum}")]
    AboveMaximum {
        name: String,
        value: i64,
        maximum: i64,
    },

    #[error("limit '{0}' should have a non-zero total value")]
    ZeroExecutionBudget(String),

    #[error("'{0}' is not a total limit")]
    NotATotalLimit(String),

    #[error("limit not present in context: {0}")]
    LimitNotPresentInContext(String),

    #[error("owning context was cancelled while waiting for tokens")]
    ContextCancelled,

    #[error("token bucket ticker could not be started: {0}")]
    TickerUnavailable(String),
}

/// Recoverable errors of [`crate::context::ExecutionContext`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("context is done: {0}")]
    Done(String),

    #[error("context: non existing limit '{0}'")]
    UnknownLimit(String),

    #[error("context creation: duplicate limit '{0}'")]
    DuplicateLimit(String),

    #[error("parent of context should have less restrictive limits than its child: limit '{0}'")]
    ParentMoreRestrictive(String),

    #[error("limit tokens cannot be set in new context's config if it is a child")]
    TokensForChildContext,

    #[error("context: '{0}' is not a rate")]
    NotARate(String),

    #[error("invalid limit: {0}")]
    Limit(#[from] LimitError),
}

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limit validation errors
    #[error("Limit error: {0}")]
    Limit(#[from] LimitError),

    /// Execution context errors
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// Manifest parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Abort the current computation because a usage contract was broken.
///
/// The payload is the [`LimitError`] itself so that [`catch_violation`] can
/// recover it without parsing a message.
#[track_caller]
pub fn violation(err: LimitError) -> ! {
    let location = panic::Location::caller();
    error!(error = %err, %location, "Limit contract violated");
    panic::panic_any(err)
}

/// Run `f`, turning a contract violation raised inside it into an `Err`.
///
/// Panics that do not carry a [`LimitError`] payload are resumed untouched.
/// Violations are raised before any shared state is mutated, which is why the
/// closure does not need to be `UnwindSafe`.
pub fn catch_violation<F, T>(f: F) -> std::result::Result<T, LimitError>
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<LimitError>() {
            Ok(err) => Err(*err),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_violation_returns_payload() {
        let result: std::result::Result<(), _> =
            catch_violation(|| violation(LimitError::StateIdNotSet));
        assert_eq!(result, Err(LimitError::StateIdNotSet));
    }

    #[test]
    fn test_catch_violation_passes_values_through() {
        let mut calls = 0;
        let result = catch_violation(|| {
            calls += 1;
            42
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_catch_violation_resumes_foreign_panics() {
        let outer = panic::catch_unwind(|| {
            let _ = catch_violation(|| panic!("unrelated"));
        });
        let payload = outer.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"unrelated"));
    }

    #[test]
    fn test_insufficient_tokens_message() {
        let err = LimitError::InsufficientTokens {
            name: "threads/simultaneous-instances".to_string(),
            count: 1,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "cannot take 1 tokens from bucket (threads/simultaneous-instances), only 0 token(s) available"
        );
    }
}
