//! Error types for adal-core.

use thiserror::Error;

use crate::component::Mode;
use crate::parser::ParseError;

/// Result type alias using adal-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure class of a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCallKind {
    /// The request never got a response (connection, DNS, read failure).
    Transport,
    /// The provider rejected the credentials.
    Auth,
    /// The provider throttled the request.
    RateLimited,
    /// The provider failed while handling the request.
    Server,
    /// A response arrived but could not be decoded.
    InvalidResponse,
}

impl std::fmt::Display for ModelCallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Auth => write!(f, "auth"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Server => write!(f, "server"),
            Self::InvalidResponse => write!(f, "invalid_response"),
        }
    }
}

/// Errors that can occur while running or training a pipeline.
///
/// An empty retrieval result is deliberately absent: it maps to an empty
/// context, never to an error.
#[derive(Error, Debug)]
pub enum Error {
    /// A mode-specific entry point was invoked under the other mode
    #[error("{component}: {actual} invocation attempted, component expects {expected} mode")]
    InvalidMode {
        component: String,
        expected: Mode,
        actual: Mode,
    },

    /// Model call failed
    #[error("Model call error: {provider} ({kind}) - {message}")]
    ModelCall {
        provider: String,
        kind: ModelCallKind,
        message: String,
    },

    /// Model output did not have the expected shape
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Retrieval backend failed
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// An agent step could not be planned or executed
    #[error("Agent step {step} failed: {message}")]
    Agent { step: usize, message: String },

    /// The run was cancelled before the operation started
    #[error("Run cancelled")]
    Cancelled,

    /// Invalid use of the parameter graph
    #[error("Graph error: {0}")]
    Graph(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid mode error.
    pub fn invalid_mode(component: impl Into<String>, expected: Mode, actual: Mode) -> Self {
        Self::InvalidMode {
            component: component.into(),
            expected,
            actual,
        }
    }

    /// Create a model call error.
    pub fn model_call(
        provider: impl Into<String>,
        kind: ModelCallKind,
        message: impl Into<String>,
    ) -> Self {
        Self::ModelCall {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an agent step error.
    pub fn agent(step: usize, message: impl Into<String>) -> Self {
        Self::Agent {
            step,
            message: message.into(),
        }
    }

    /// Create a graph error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph(message.into())
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ModelCall { kind, .. } => matches!(
                kind,
                ModelCallKind::Transport | ModelCallKind::RateLimited | ModelCallKind::Server
            ),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the error belongs to a single sample and must not abort a split.
    pub fn is_sample_level(&self) -> bool {
        matches!(
            self,
            Self::ModelCall { .. }
                | Self::Parse(_)
                | Self::Retrieval(_)
                | Self::Agent { .. }
                | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::model_call("openai", ModelCallKind::RateLimited, "slow down").is_retryable());
        assert!(Error::model_call("openai", ModelCallKind::Server, "500").is_retryable());
        assert!(Error::timeout(10).is_retryable());
        assert!(!Error::model_call("openai", ModelCallKind::Auth, "bad key").is_retryable());
        assert!(!Error::Config("missing client".into()).is_retryable());
    }

    #[test]
    fn test_sample_level_classification() {
        assert!(Error::model_call("anthropic", ModelCallKind::Auth, "bad key").is_sample_level());
        assert!(Error::Parse(ParseError::EmptyResponse).is_sample_level());
        assert!(Error::Retrieval("index offline".into()).is_sample_level());
        assert!(Error::agent(2, "unknown tool 'search'").is_sample_level());
        assert!(!Error::Config("missing client".into()).is_sample_level());
        assert!(!Error::invalid_mode("generator", Mode::Training, Mode::Inference).is_sample_level());
        assert!(!Error::Cancelled.is_sample_level());
    }

    #[test]
    fn test_invalid_mode_message() {
        let err = Error::invalid_mode("rag", Mode::Inference, Mode::Training);
        assert_eq!(
            err.to_string(),
            "rag: training invocation attempted, component expects inference mode"
        );
    }
}
