//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The engine's retry policy decides retry behaviour from the message and
/// the HTTP status, except for `Permanent`, which is never retried:
/// - `Transient`: network/timeout class failures.
/// - `Permanent`: business-logic or validation failures.
/// - `Http`: a non-2xx upstream response; the status drives retry.
/// - `Sandbox`: a crash, timeout or error report of an isolated plugin.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("upstream responded with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl NodeError {
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Config problems are reported with a uniform prefix.
    pub fn invalid_config(node: &str, detail: impl std::fmt::Display) -> Self {
        Self::Permanent(format!("invalid {node} config: {detail}"))
    }
}
