//! Embedded register VM
//!
//! A compact interpreter exposing what the extension core needs: closure
//! duplication, a ref table, tables with metatables and a readonly flag,
//! prototype access, object enumeration and per-thread identity.

pub mod arena;
pub mod builder;
pub mod error;
pub mod heap;
pub mod proto;
pub mod value;
pub mod vm;

pub use arena::Handle;
pub use builder::ProtoBuilder;
pub use error::{Result, VmError};
pub use heap::HeapStats;
pub use proto::{FunctionProto, ProtoInfo, ProtoRef};
pub use value::{ClosureHandle, Instruction, NativeHandle, OpCode, TableHandle, Value};
pub use vm::{CallContext, NativeFn, Vm, VmLimits};
