//! Error types for the memoizer
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Memoize Error Enum ==
/// Errors raised while configuring a memoizer, deriving a cache key or
/// arming an expiry timer.
///
/// Errors produced by the wrapped function itself never pass through this
/// type; they reach the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoizeError {
    /// An option is present but has the wrong shape
    #[error("option.{option} is not {expected}")]
    InvalidOption {
        option: &'static str,
        expected: &'static str,
    },

    /// `maxAge` and `expirationDate` were both supplied
    #[error("Cannot use option.maxAge and option.expirationDate at the same time")]
    ConflictingOptions,

    /// Options document could not be read
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Argument list has no canonical encoding
    #[error("Unsupported argument: {0}")]
    UnsupportedArgument(String),

    /// No timer could be armed for a stored entry
    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
}

impl MemoizeError {
    pub(crate) fn invalid_max_age(expected: &'static str) -> Self {
        MemoizeError::InvalidOption {
            option: "maxAge",
            expected,
        }
    }

    pub(crate) fn invalid_expiration_date() -> Self {
        MemoizeError::InvalidOption {
            option: "expirationDate",
            expected: "a date",
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the memoizer.
pub type Result<T> = std::result::Result<T, MemoizeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_messages() {
        assert_eq!(
            MemoizeError::invalid_max_age("an integer").to_string(),
            "option.maxAge is not an integer"
        );
        assert_eq!(
            MemoizeError::invalid_expiration_date().to_string(),
            "option.expirationDate is not a date"
        );
    }

    #[test]
    fn test_conflicting_options_message() {
        assert_eq!(
            MemoizeError::ConflictingOptions.to_string(),
            "Cannot use option.maxAge and option.expirationDate at the same time"
        );
    }

    #[test]
    fn test_scheduler_unavailable_message() {
        assert_eq!(
            MemoizeError::SchedulerUnavailable("expiry thread not running".to_string()).to_string(),
            "Scheduler unavailable: expiry thread not running"
        );
    }
}
