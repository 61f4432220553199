//! vmhook library
//!
//! Hooking, reflection and sandboxed environments over an embedded
//! register VM. Hosts build a [`Runtime`] per interpreter instance and reach
//! every registry through it.

pub mod config;
pub mod error;
pub mod ext;
pub mod interp;
pub mod logging;

// Re-export commonly used types
pub use config::Config;
pub use error::{ExtError, Result};
pub use ext::Runtime;
pub use interp::{ProtoBuilder, Value, Vm, VmError};
