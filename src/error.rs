//! Error types for vmhook
//!
//! Interpreter faults surface as [`VmError`]; everything the extension core
//! adds on top is an [`ExtError`]. Probing an unsupported target (a native
//! function, an out-of-range constant index) is not an error: those
//! operations return `None` or `false`.

use crate::config::ConfigError;
use crate::interp::VmError;

/// Result type for extension-core operations
pub type Result<T> = std::result::Result<T, ExtError>;

/// Main error type for the extension core
#[derive(Debug, thiserror::Error)]
pub enum ExtError {
    /// Wrong value kind where a callable or table was required
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Value outside its permitted range
    #[error("{what} out of range: {value} (expected {min}..={max})")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Caller misuse detected while mutating interpreter state
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Caller identity level too low for the operation
    #[error("{operation} requires identity level {required}, caller has {actual}")]
    Denied {
        operation: &'static str,
        required: u8,
        actual: u8,
    },

    /// Interpreter fault
    #[error(transparent)]
    Vm(#[from] VmError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ExtError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ExtError::InvalidArgument(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        ExtError::Invariant(msg.into())
    }
}

/// Errors crossing back into script code become runtime errors
impl From<ExtError> for VmError {
    fn from(err: ExtError) -> Self {
        match err {
            ExtError::Vm(e) => e,
            other => VmError::Runtime(other.to_string()),
        }
    }
}
