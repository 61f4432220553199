//! Live object enumeration for diagnostics

use crate::error::{ExtError, Result};
use crate::interp::{TableHandle, Value, Vm};
use std::sync::Arc;

/// One-shot snapshot of live objects; consumed by iteration
#[derive(Debug)]
pub struct ObjectSnapshot {
    items: std::vec::IntoIter<Value>,
}

impl Iterator for ObjectSnapshot {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for ObjectSnapshot {}

/// Object category accepted by [`GcWalker::filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Callable,
    Container,
}

impl std::str::FromStr for ObjectKind {
    type Err = ExtError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "function" | "callable" => Ok(ObjectKind::Callable),
            "table" | "container" => Ok(ObjectKind::Container),
            other => Err(ExtError::invalid_argument(format!("unknown object kind '{}'", other))),
        }
    }
}

/// Filter criteria; unset criteria always match
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Callables: debug name equals
    pub name: Option<String>,

    /// Callables: exact upvalue count
    pub upvalue_count: Option<usize>,

    /// Callables: exact constant count
    pub constant_count: Option<usize>,

    /// Callables: skip native functions
    pub ignore_host: bool,

    /// Containers: every key is present
    pub keys: Vec<Value>,

    /// Containers: every value is present among the table's values
    pub values: Vec<Value>,

    /// Containers: metatable identity
    pub metatable: Option<TableHandle>,
}

pub struct GcWalker {
    vm: Arc<Vm>,
}

impl GcWalker {
    pub fn new(vm: Arc<Vm>) -> Self {
        GcWalker { vm }
    }

    /// Snapshot every live object, optionally without tables
    pub fn enumerate(&self, include_tables: bool) -> ObjectSnapshot {
        ObjectSnapshot {
            items: self.vm.objects(include_tables).into_iter(),
        }
    }

    /// Live objects of `kind` matching every criterion in `spec`
    pub fn filter(&self, kind: ObjectKind, spec: &FilterSpec) -> Result<Vec<Value>> {
        let include_tables = kind == ObjectKind::Container;
        let mut out = Vec::new();
        for value in self.enumerate(include_tables) {
            let matched = match (kind, &value) {
                (ObjectKind::Callable, v) if v.is_function() => self.callable_matches(v, spec),
                (ObjectKind::Container, Value::Table(t)) => self.container_matches(*t, spec),
                _ => continue,
            };
            // Objects collected between snapshot and check are skipped
            if matched.unwrap_or(false) {
                out.push(value);
            }
        }
        Ok(out)
    }

    fn callable_matches(&self, f: &Value, spec: &FilterSpec) -> Result<bool> {
        if spec.ignore_host && matches!(f, Value::Native(_)) {
            return Ok(false);
        }
        if let Some(name) = &spec.name {
            if self.vm.function_name(f)?.as_deref() != Some(name.as_str()) {
                return Ok(false);
            }
        }
        if let Some(count) = spec.upvalue_count {
            let actual = match f {
                Value::Closure(c) => self.vm.upvalue_count(*c)?,
                _ => 0,
            };
            if actual != count {
                return Ok(false);
            }
        }
        if let Some(count) = spec.constant_count {
            let Value::Closure(c) = f else {
                return Ok(false);
            };
            if self.vm.closure_proto(*c)?.read().constants.len() != count {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn container_matches(&self, t: TableHandle, spec: &FilterSpec) -> Result<bool> {
        if let Some(mt) = spec.metatable {
            if self.vm.get_metatable(&Value::Table(t))? != Some(mt) {
                return Ok(false);
            }
        }
        for key in &spec.keys {
            if self.vm.raw_get(t, key)?.is_nil() {
                return Ok(false);
            }
        }
        if !spec.values.is_empty() {
            let entries = self.vm.heap().get_table(t)?.entries();
            for wanted in &spec.values {
                if !entries.iter().any(|(_, v)| v == wanted) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
