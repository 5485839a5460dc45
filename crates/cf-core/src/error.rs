//! Unified error types for chainforge.
//!
//! [`Error`] covers every failure that crosses the engine boundary: the
//! pre-execution fatal kinds (malformed definitions, kind mismatches, budget
//! rejections) plus I/O. [`AdapterError`] is what a step adapter reports for a
//! single invocation; the engine turns it into data rather than propagating it.

use std::fmt;

/// Unified error type covering all fatal failure modes in chainforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pipeline definition is malformed or incomplete.
    #[error("Config error: {0}")]
    Config(String),

    /// A step's accepted input kinds do not include what the chain feeds it.
    #[error(
        "Incompatible chain at step {step_index} ({step_type}): expects {expected}, receives {found}"
    )]
    IncompatibleChain {
        /// Index of the offending step in the definition.
        step_index: usize,
        /// Step type tag of the offending step.
        step_type: String,
        /// Human-readable list of accepted kinds.
        expected: String,
        /// Human-readable description of the kind actually reaching the step.
        found: String,
    },

    /// The estimated or actual cost exceeds the configured ceiling.
    #[error("Budget exceeded: estimated ${estimate:.4} exceeds budget ${budget:.4}")]
    BudgetExceeded {
        /// Estimated cost that triggered the rejection.
        estimate: f64,
        /// Budget (or remaining budget) it was compared against.
        budget: f64,
    },

    /// No adapter is registered under the requested `(step_type, model)`.
    #[error("No adapter registered for {step_type} with model '{model}'")]
    UnknownAdapter {
        /// Step type tag that was looked up.
        step_type: String,
        /// Model selector that was looked up.
        model: String,
    },

    /// The cost estimate was not confirmed by the caller.
    #[error("Run declined at cost confirmation")]
    Declined,

    /// The run was cancelled before it could start.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Encoding or decoding an execution record failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to the process exit code the CLI should report.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 2,
            Error::IncompatibleChain { .. } => 2,
            Error::UnknownAdapter { .. } => 2,
            Error::BudgetExceeded { .. } => 3,
            Error::Declined => 4,
            Error::Cancelled(_) => 4,
            Error::Io { .. } => 1,
            Error::Serialization(_) => 1,
            Error::Internal(_) => 1,
        }
    }

    /// Convenience constructor for [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Convenience constructor for [`Error::UnknownAdapter`].
    pub fn unknown_adapter(step_type: impl fmt::Display, model: impl Into<String>) -> Self {
        Error::UnknownAdapter {
            step_type: step_type.to_string(),
            model: model.into(),
        }
    }

    /// Whether the error was raised before any adapter could have been called.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::IncompatibleChain { .. }
                | Error::UnknownAdapter { .. }
                | Error::BudgetExceeded { .. }
                | Error::Declined
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// AdapterError
// ---------------------------------------------------------------------------

/// Classified failure reported by a step adapter for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Network hiccup, rate limit, provider timeout; safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// The params were rejected; retrying cannot help.
    #[error("validation: {0}")]
    Validation(String),

    /// The provider reported a failure of the operation itself.
    #[error("provider: {0}")]
    Provider(String),
}

impl AdapterError {
    /// Convenience constructor for [`AdapterError::Transient`].
    pub fn transient(message: impl Into<String>) -> Self {
        AdapterError::Transient(message.into())
    }

    /// Convenience constructor for [`AdapterError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        AdapterError::Validation(message.into())
    }

    /// Convenience constructor for [`AdapterError::Provider`].
    pub fn provider(message: impl Into<String>) -> Self {
        AdapterError::Provider(message.into())
    }

    /// Only transient failures are eligible for the dispatcher's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    /// The message without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            AdapterError::Transient(m) | AdapterError::Validation(m) | AdapterError::Provider(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_display() {
        let err = Error::config("missing field `name`");
        assert_eq!(err.to_string(), "Config error: missing field `name`");
        assert_eq!(err.exit_code(), 2);
        assert!(err.is_pre_execution());
    }

    #[test]
    fn incompatible_chain_display() {
        let err = Error::IncompatibleChain {
            step_index: 1,
            step_type: "add_audio".into(),
            expected: "video or audio".into(),
            found: "image".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 1"), "got: {msg}");
        assert!(msg.contains("add_audio"));
        assert!(msg.contains("image"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn budget_display() {
        let err = Error::BudgetExceeded {
            estimate: 0.05,
            budget: 0.01,
        };
        assert_eq!(
            err.to_string(),
            "Budget exceeded: estimated $0.0500 exceeds budget $0.0100"
        );
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn unknown_adapter_display() {
        let err = Error::unknown_adapter("text_to_image", "nope");
        assert_eq!(
            err.to_string(),
            "No adapter registered for text_to_image with model 'nope'"
        );
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert!(!err.is_pre_execution());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn declined_is_pre_execution() {
        assert!(Error::Declined.is_pre_execution());
        assert_eq!(Error::Declined.exit_code(), 4);
    }

    #[test]
    fn adapter_error_retryability() {
        assert!(AdapterError::transient("reset").is_retryable());
        assert!(!AdapterError::validation("bad size").is_retryable());
        assert!(!AdapterError::provider("nsfw filter").is_retryable());
    }

    #[test]
    fn adapter_error_message() {
        let err = AdapterError::provider("quota exhausted");
        assert_eq!(err.message(), "quota exhausted");
        assert_eq!(err.to_string(), "provider: quota exhausted");
    }
}
