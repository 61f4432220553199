//! Error handling for the interpreter

use crate::interp::arena::Lookup;

/// Result type for interpreter operations
pub type Result<T> = std::result::Result<T, VmError>;

/// Faults raised by the interpreter itself
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    /// Error raised by script code or a native function
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Type error
    #[error("type error: {0}")]
    TypeError(String),

    /// Write to a table whose readonly flag is set
    #[error("attempt to modify a readonly table")]
    ReadOnly,

    /// Call depth limit exceeded
    #[error("stack overflow")]
    StackOverflow,

    /// Instruction budget exhausted
    #[error("instruction limit exceeded")]
    InstructionLimit,

    /// Stale handle reference
    #[error("invalid handle")]
    InvalidHandle,

    /// Handle belongs to a different VM
    #[error("handle belongs to another interpreter instance")]
    ForeignHandle,

    /// Malformed bytecode
    #[error("invalid instruction at pc {pc}: {reason}")]
    InvalidInstruction {
        pc: usize,
        reason: String,
    },

    /// Call on a value that is neither a function nor has __call
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),
}

impl From<Lookup> for VmError {
    fn from(lookup: Lookup) -> Self {
        match lookup {
            Lookup::Stale => VmError::InvalidHandle,
            Lookup::Foreign => VmError::ForeignHandle,
        }
    }
}
