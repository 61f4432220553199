//! Function prototypes
//!
//! A prototype is the compiled template closures are instantiated from. It is
//! shared, not copied: every closure built from the same prototype holds the
//! same [`ProtoRef`], so a constant rewritten through one of them is observed
//! by all of them.

use crate::interp::value::{Instruction, Value};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared handle to a prototype
pub type ProtoRef = Arc<RwLock<FunctionProto>>;

/// Function prototype (compiled bytecode)
#[derive(Debug, Clone)]
pub struct FunctionProto {
    /// Debug name, if the function was declared with one
    pub name: Option<Arc<str>>,

    /// Chunk the function was compiled from
    pub source: Arc<str>,

    /// Line the function was declared at
    pub line_defined: u32,

    /// Compiled bytecode
    pub code: Vec<Instruction>,

    /// Constant values used by this function
    pub constants: Vec<Value>,

    /// Nested function prototypes
    pub nested: Vec<ProtoRef>,

    /// Number of parameters
    pub param_count: u8,

    /// Is variadic (...)
    pub is_vararg: bool,

    /// Registers needed by one activation
    pub max_stack: u8,

    /// Number of upvalues
    pub upvalue_count: u8,
}

impl Default for FunctionProto {
    fn default() -> Self {
        FunctionProto {
            name: None,
            source: Arc::from("=host"),
            line_defined: 0,
            code: Vec::new(),
            constants: Vec::new(),
            nested: Vec::new(),
            param_count: 0,
            is_vararg: false,
            max_stack: 2,
            upvalue_count: 0,
        }
    }
}

impl FunctionProto {
    /// Wrap into a shareable reference
    pub fn into_ref(self) -> ProtoRef {
        Arc::new(RwLock::new(self))
    }

    /// Read-only summary of this prototype
    pub fn info(&self) -> ProtoInfo {
        ProtoInfo {
            name: self.name.clone(),
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            constant_count: self.constants.len(),
            nested_count: self.nested.len(),
            upvalue_count: self.upvalue_count,
            line_defined: self.line_defined,
        }
    }
}

/// Read-only descriptor of a prototype
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoInfo {
    pub name: Option<Arc<str>>,
    pub param_count: u8,
    pub is_vararg: bool,
    pub constant_count: usize,
    pub nested_count: usize,
    pub upvalue_count: u8,
    pub line_defined: u32,
}
