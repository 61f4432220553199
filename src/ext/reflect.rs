//! Prototype reflection
//!
//! All indices are 1-based. Out-of-range indices and native functions are
//! ordinary "absent" outcomes (`None` / `false`), not errors.
//!
//! `set_constant` writes into the shared prototype: every closure
//! instantiated from it, including copies made by [`ReflectionEngine::clone_function`]
//! and hook originals, observes the new constant.

use crate::error::{ExtError, Result};
use crate::interp::{ClosureHandle, ProtoInfo, ProtoRef, Value, Vm};
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// Result of [`ReflectionEngine::get_nested`]
#[derive(Debug, Clone, PartialEq)]
pub enum Nested {
    /// Read-only description of the prototype
    Descriptor(ProtoInfo),

    /// Callable closure over the prototype; its upvalues start as nil
    Closure(Value),
}

pub struct ReflectionEngine {
    vm: Arc<Vm>,
}

impl ReflectionEngine {
    pub fn new(vm: Arc<Vm>) -> Self {
        ReflectionEngine { vm }
    }

    /// Prototype behind a bytecode closure
    pub fn proto_of(&self, f: &Value) -> Result<Option<ProtoRef>> {
        match f {
            Value::Closure(c) => Ok(Some(self.vm.closure_proto(*c)?)),
            Value::Native(_) => Ok(None),
            other => Err(ExtError::invalid_argument(format!(
                "expected a function, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn get_constant(&self, f: &Value, index: i64) -> Result<Option<Value>> {
        let Some(proto) = self.proto_of(f)? else {
            return Ok(None);
        };
        let proto = proto.read();
        Ok(slot(index, proto.constants.len()).map(|i| proto.constants[i].clone()))
    }

    /// Overwrite a constant in the shared prototype
    pub fn set_constant(&self, f: &Value, index: i64, value: Value) -> Result<bool> {
        self.vm.check_owner(&value)?;
        let Some(proto) = self.proto_of(f)? else {
            return Ok(false);
        };
        let mut proto = proto.write();
        match slot(index, proto.constants.len()) {
            Some(i) => {
                tracing::debug!(index, old = %proto.constants[i], new = %value, "constant replaced");
                proto.constants[i] = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_constants(&self, f: &Value) -> Result<Option<Vec<Value>>> {
        Ok(self.proto_of(f)?.as_ref().map(|p| p.read().constants.clone()))
    }

    /// Descriptor of `f`'s own prototype
    pub fn get_proto_info(&self, f: &Value) -> Result<Option<ProtoInfo>> {
        Ok(self.proto_of(f)?.as_ref().map(|p| p.read().info()))
    }

    /// Nested prototype `index` of `f`
    ///
    /// With `activate`, a new closure is built over the nested prototype in
    /// `f`'s environment. Its upvalue cells are fresh and nil: the bindings it
    /// would have received at its natural instantiation point do not exist
    /// yet.
    pub fn get_nested(&self, f: &Value, index: i64, activate: bool) -> Result<Option<Nested>> {
        self.get_nested_from(None, f, index, activate)
    }

    /// [`get_nested`](Self::get_nested) on behalf of the bytecode closure `caller`
    ///
    /// An activated closure is linked to `caller`'s environment instead of
    /// `f`'s. Upvalue cells still start as nil.
    pub fn get_nested_from(
        &self,
        caller: Option<ClosureHandle>,
        f: &Value,
        index: i64,
        activate: bool,
    ) -> Result<Option<Nested>> {
        let Value::Closure(c) = f else {
            self.proto_of(f)?;
            return Ok(None);
        };
        let proto = self.vm.closure_proto(*c)?;
        let nested = {
            let p = proto.read();
            match slot(index, p.nested.len()) {
                Some(i) => p.nested[i].clone(),
                None => return Ok(None),
            }
        };
        if activate {
            let env = self.vm.closure_env(caller.unwrap_or(*c))?;
            Ok(Some(Nested::Closure(self.vm.instantiate(nested, Some(env)))))
        } else {
            let info = nested.read().info();
            Ok(Some(Nested::Descriptor(info)))
        }
    }

    /// Hex SHA-1 over the parts of a prototype that define its behaviour
    pub fn function_hash(&self, f: &Value) -> Result<Option<String>> {
        let Some(proto) = self.proto_of(f)? else {
            return Ok(None);
        };
        let p = proto.read();
        let mut hasher = Sha1::new();
        hasher.update(p.source.as_bytes());
        hasher.update(p.line_defined.to_le_bytes());
        hasher.update([p.upvalue_count, p.param_count, p.is_vararg as u8]);
        for instr in &p.code {
            hasher.update(instr.0.to_le_bytes());
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// Duplicate any callable; `None` for non-callables
    pub fn clone_function(&self, f: &Value) -> Result<Option<Value>> {
        Ok(self.vm.clone_function(f)?)
    }

    /// Native wrapper around a bytecode closure; natives are returned as they are
    ///
    /// The wrapper forwards its arguments and results unchanged and lets the
    /// closure's errors through. It keeps the closure alive.
    pub fn wrap_native(&self, f: &Value) -> Result<Value> {
        match f {
            Value::Native(_) => Ok(f.clone()),
            Value::Closure(_) => {
                let name = self.vm.function_name(f)?.unwrap_or_else(|| "wrapped".to_string());
                let inner = f.clone();
                let wrapper = self
                    .vm
                    .create_native_with(&name, vec![f.clone()], move |ctx, args| ctx.call(&inner, args))?;
                tracing::debug!(function = %name, "closure wrapped as native");
                Ok(wrapper)
            }
            other => Err(ExtError::invalid_argument(format!(
                "expected a function, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn is_lclosure(&self, f: &Value) -> bool {
        matches!(f, Value::Closure(_))
    }

    pub fn is_native(&self, f: &Value) -> bool {
        matches!(f, Value::Native(_))
    }
}

/// Map a 1-based index onto `0..len`
fn slot(index: i64, len: usize) -> Option<usize> {
    if index >= 1 && (index as u64) <= len as u64 {
        Some(index as usize - 1)
    } else {
        None
    }
}
