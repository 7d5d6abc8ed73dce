//! Error types for the operator engine

use std::any::Any;

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while evaluating or consuming an operator chain
///
/// Cloneable so a recorded failure can be handed out on every pull
/// until the operator is invalidated again.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A derivation function failed and no fallback artifact was available
    #[error("Derivation failed in operator '{operator}': {message}")]
    Derivation { operator: String, message: String },

    /// The evaluation was invalidated before it produced a result
    #[error("Evaluation cancelled")]
    Cancelled,

    /// A derivation returned no artifact although nothing invalidated it
    #[error("Operator '{operator}' stopped early without being invalidated")]
    StoppedEarly { operator: String },

    /// The background worker panicked or disappeared without reporting
    #[error("Background compute fault: {0}")]
    BackgroundFault(String),

    /// The result cannot be extracted in the current state
    #[error("Result not ready: {0}")]
    NotReady(String),

    /// The artifact is still referenced elsewhere and cannot be moved out
    #[error("Artifact is still shared and cannot be extracted")]
    ArtifactShared,

    /// Rewiring would make the operator its own ancestor
    #[error("Cycle detected while wiring operator '{operator}'")]
    CycleDetected { operator: String },

    /// Parameter rejected
    #[error(transparent)]
    Param(#[from] ParamError),

    /// Worker thread could not be started
    #[error("Failed to spawn background worker: {0}")]
    Spawn(String),

    /// The chain has been shut down
    #[error("Chain has been shut down")]
    ShutDown,

    /// Operation not supported by this operator
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Create a derivation error for the given operator
    pub fn derivation(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Derivation {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Create a not-ready error with a reason
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady(reason.into())
    }

    /// True for cancellation, which is a staleness signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

/// Error returned by a derivation function
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct DeriveError {
    pub message: String,
}

impl DeriveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for DeriveError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for DeriveError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Parameter validation errors, raised before any derivation runs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    /// No parameter with this name was declared
    #[error("Unknown parameter: {0}")]
    Unknown(String),

    /// Value kind does not match the declared kind
    #[error("Invalid value for '{name}': expected {expected}, got {actual}")]
    KindMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// NaN or infinite float
    #[error("Parameter '{0}' must be finite")]
    NotFinite(String),

    /// Value outside the declared range of a strict parameter
    #[error("Parameter '{name}' = {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Errors loading engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
