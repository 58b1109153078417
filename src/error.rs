//! Error types for the scripting bridge

use thiserror::Error;

/// Result type for scripting operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while evaluating scripts or dispatching host calls
#[derive(Error, Debug)]
pub enum Error {
    /// An uncaught script error, correlated through the error sink
    #[error("{0}")]
    Script(ErrorReport),

    /// The engine signalled failure but no error report was captured.
    /// Indicates an error-correlation bug, never expected in normal use.
    #[error("script failed and no error report was captured")]
    NoReport,

    /// Argument count did not match the bound function's signature
    #[error("invalid number of arguments: expected {expected} got {got}")]
    Arity { expected: usize, got: usize },

    /// A decoded value could not be converted to the declared host type
    #[error("cannot cast {from} to {to}")]
    Cast { from: &'static str, to: &'static str },

    /// A host function panicked during dispatch
    #[error("{function}: {message}")]
    Invocation { function: String, message: String },

    /// A proxied property rejected a write
    #[error("property {0} is not settable")]
    NotSettable(String),

    /// The proxied struct instance could not be accessed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// JSON encode/decode error at the value boundary
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An uncaught script failure as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Source identifier the failing chunk was evaluated under
    pub source: String,
    /// Line number within the chunk (0 when unknown)
    pub line: u32,
    /// The engine's error message
    pub message: String,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", self.source, self.line, self.message)
    }
}
