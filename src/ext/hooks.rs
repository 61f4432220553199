//! Function and metamethod interception
//!
//! Hooking a closure installs a redirect on its heap object, so every call
//! site holding that closure reaches the replacement. The caller gets back a
//! fresh closure sharing the target's code, which keeps the pre-hook
//! behaviour for as long as it is held.
//!
//! The registry lock is reentrant: a replacement running inside
//! [`HookRegistry::exclusive`] may install or restore hooks on the same
//! thread without deadlocking.

use crate::error::{ExtError, Result};
use crate::ext::refs::{ReferenceRegistry, RetainedRef};
use crate::interp::{ClosureHandle, TableHandle, Value, Vm};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// One hooked closure
struct HookEntry {
    _target: RetainedRef,
    original: RetainedRef,
    _replacement: RetainedRef,
}

/// One hooked metamethod slot
struct MetaEntry {
    /// Value the slot held before the first hook
    previous: RetainedRef,
    _original: RetainedRef,
    _replacement: RetainedRef,
}

#[derive(Default)]
struct HookTable {
    functions: HashMap<ClosureHandle, HookEntry>,
    metamethods: HashMap<(TableHandle, String), MetaEntry>,
}

pub struct HookRegistry {
    vm: Arc<Vm>,
    refs: Arc<ReferenceRegistry>,
    table: ReentrantMutex<RefCell<HookTable>>,
}

impl HookRegistry {
    pub fn new(vm: Arc<Vm>, refs: Arc<ReferenceRegistry>) -> Self {
        HookRegistry {
            vm,
            refs,
            table: ReentrantMutex::new(RefCell::new(HookTable::default())),
        }
    }

    /// Redirect calls reaching `target` to `replacement`
    ///
    /// Returns a callable copy of `target` with its pre-hook behaviour, or
    /// `None` when `target` is a native function (those cannot be hooked).
    /// Hooking an already hooked closure replaces the previous entry.
    pub fn install(&self, target: &Value, replacement: &Value) -> Result<Option<Value>> {
        let closure = match target {
            Value::Closure(c) => *c,
            Value::Native(_) => return Ok(None),
            other => {
                return Err(ExtError::invalid_argument(format!(
                    "hook target must be a function, got {}",
                    other.type_name()
                )))
            }
        };
        check_callable(replacement, "hook replacement")?;
        if replacement == target {
            return Err(ExtError::invalid_argument("a function cannot replace itself"));
        }

        let guard = self.table.lock();

        let original = self
            .vm
            .clone_function(target)?
            .ok_or_else(|| ExtError::invariant("closure could not be duplicated"))?;
        let entry = HookEntry {
            _target: self.refs.retain(target.clone())?,
            original: self.refs.retain(original.clone())?,
            _replacement: self.refs.retain(replacement.clone())?,
        };
        self.vm.set_redirect(closure, Some(replacement.clone()))?;

        let previous = guard.borrow_mut().functions.insert(closure, entry);
        tracing::debug!(target = %target, replaced = previous.is_some(), "function hooked");
        drop(previous);

        Ok(Some(original))
    }

    /// Remove the hook on `target`; returns whether one was installed
    pub fn restore(&self, target: &Value) -> Result<bool> {
        let Value::Closure(closure) = target else {
            return Ok(false);
        };
        let guard = self.table.lock();
        let entry = guard.borrow_mut().functions.remove(closure);
        match entry {
            Some(entry) => {
                self.vm.set_redirect(*closure, None)?;
                tracing::debug!(target = %target, "function restored");
                drop(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace metamethod `name` on `object`'s metatable
    ///
    /// The metatable's readonly flag is lifted for the write and put back
    /// afterwards. Returns a copy of the previous metamethod (or the previous
    /// value itself when it is not a function).
    pub fn install_metamethod(&self, object: &Value, name: &str, replacement: &Value) -> Result<Value> {
        check_callable(replacement, "metamethod replacement")?;
        let metatable = self
            .vm
            .get_metatable(object)?
            .ok_or_else(|| ExtError::invariant(format!("{} value has no metatable", object.type_name())))?;
        let key = Value::from(name);
        let existing = self.vm.raw_get(metatable, &key)?;
        if existing.is_nil() {
            return Err(ExtError::invariant(format!("metatable has no '{}'", name)));
        }

        let guard = self.table.lock();

        let original = self.vm.clone_function(&existing)?.unwrap_or_else(|| existing.clone());
        let slot = (metatable, name.to_string());
        let previous = match guard.borrow_mut().metamethods.remove(&slot) {
            Some(entry) => entry.previous,
            None => self.refs.retain(existing)?,
        };
        let entry = MetaEntry {
            previous,
            _original: self.refs.retain(original.clone())?,
            _replacement: self.refs.retain(replacement.clone())?,
        };

        self.write_unprotected(metatable, key, replacement.clone())?;
        guard.borrow_mut().metamethods.insert(slot, entry);
        tracing::debug!(name, "metamethod hooked");

        Ok(original)
    }

    /// Put back the metamethod that was in place before the first hook
    pub fn restore_metamethod(&self, object: &Value, name: &str) -> Result<bool> {
        let Some(metatable) = self.vm.get_metatable(object)? else {
            return Ok(false);
        };
        let guard = self.table.lock();
        let entry = guard.borrow_mut().metamethods.remove(&(metatable, name.to_string()));
        match entry {
            Some(entry) => {
                self.write_unprotected(metatable, Value::from(name), entry.previous.get().clone())?;
                tracing::debug!(name, "metamethod restored");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run `f` holding the registry lock
    ///
    /// Other threads cannot install or restore hooks until `f` returns; the
    /// current thread may, including from replacements `f` calls into.
    pub fn exclusive<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let _guard = self.table.lock();
        f(self)
    }

    pub fn is_hooked(&self, target: &Value) -> bool {
        match target {
            Value::Closure(c) => self.table.lock().borrow().functions.contains_key(c),
            _ => false,
        }
    }

    /// Whether the registry put `f` in play: a hooked target or the
    /// pre-hook copy `install` handed back
    pub fn owns(&self, f: &Value) -> bool {
        let Value::Closure(c) = f else {
            return false;
        };
        let guard = self.table.lock();
        let table = guard.borrow();
        table.functions.contains_key(c) || table.functions.values().any(|e| e.original.get() == f)
    }

    /// Installed function hooks
    pub fn len(&self) -> usize {
        self.table.lock().borrow().functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_unprotected(&self, table: TableHandle, key: Value, value: Value) -> Result<()> {
        let was_readonly = self.vm.is_readonly(table)?;
        self.vm.set_readonly(table, false)?;
        let written = self.vm.raw_set(table, key, value);
        self.vm.set_readonly(table, was_readonly)?;
        Ok(written?)
    }
}

fn check_callable(value: &Value, what: &str) -> Result<()> {
    if value.is_function() {
        Ok(())
    } else {
        Err(ExtError::invalid_argument(format!(
            "{} must be a function, got {}",
            what,
            value.type_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::value::rk;
    use crate::interp::{OpCode, ProtoBuilder, VmLimits};

    fn setup() -> (Arc<Vm>, Arc<ReferenceRegistry>, HookRegistry) {
        let vm = Vm::new(VmLimits::default());
        let refs = Arc::new(ReferenceRegistry::new(vm.clone()));
        let hooks = HookRegistry::new(vm.clone(), refs.clone());
        (vm, refs, hooks)
    }

    fn add_one(vm: &Vm) -> Value {
        let mut b = ProtoBuilder::new("add_one").params(1);
        let k = b.constant(1.0);
        b.abc(OpCode::Add, 1, 0, rk(k));
        b.ret(1, 1);
        vm.instantiate(b.build(), None)
    }

    #[test]
    fn test_install_and_restore() {
        let (vm, refs, hooks) = setup();
        let f = add_one(&vm);
        let g = vm.create_native("g", |_, _| Ok(vec![Value::from(0)]));

        let original = hooks.install(&f, &g).unwrap().unwrap();
        assert!(hooks.is_hooked(&f));
        assert_eq!(refs.live_count(), 3);
        assert_eq!(vm.call(&f, &[Value::from(1)]).unwrap(), vec![Value::from(0)]);
        assert_eq!(vm.call(&original, &[Value::from(1)]).unwrap(), vec![Value::from(2)]);

        assert!(hooks.restore(&f).unwrap());
        assert!(!hooks.restore(&f).unwrap());
        assert_eq!(refs.live_count(), 0);
        assert_eq!(vm.call(&f, &[Value::from(1)]).unwrap(), vec![Value::from(2)]);
    }

    #[test]
    fn test_natives_are_not_hookable() {
        let (vm, _, hooks) = setup();
        let native = vm.create_native("n", |_, _| Ok(vec![]));
        let g = add_one(&vm);
        assert_eq!(hooks.install(&native, &g).unwrap(), None);
        assert!(matches!(
            hooks.install(&Value::from(1), &g),
            Err(ExtError::InvalidArgument(_))
        ));
        assert!(matches!(
            hooks.install(&g, &Value::Nil),
            Err(ExtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_last_hook_wins() {
        let (vm, refs, hooks) = setup();
        let f = add_one(&vm);
        let g1 = vm.create_native("g1", |_, _| Ok(vec![Value::from("g1")]));
        let g2 = vm.create_native("g2", |_, _| Ok(vec![Value::from("g2")]));

        hooks.install(&f, &g1).unwrap();
        hooks.install(&f, &g2).unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(refs.live_count(), 3);
        assert_eq!(vm.call(&f, &[]).unwrap(), vec![Value::from("g2")]);
    }

    #[test]
    fn test_metamethod_hook_lifts_protection() {
        let (vm, _, hooks) = setup();
        let obj = vm.new_table();
        let mt = vm.new_table();
        let idx = vm.create_native("idx", |_, _| Ok(vec![Value::from("old")]));
        vm.raw_set(mt, Value::from("__index"), idx).unwrap();
        vm.set_metatable(obj, Some(mt)).unwrap();
        vm.set_readonly(mt, true).unwrap();

        let new = vm.create_native("new", |_, _| Ok(vec![Value::from("new")]));
        let obj = Value::Table(obj);
        let original = hooks.install_metamethod(&obj, "__index", &new).unwrap();

        assert!(vm.is_readonly(mt).unwrap());
        assert_eq!(vm.index(&obj, &Value::from("x")).unwrap(), Value::from("new"));
        assert_eq!(vm.call(&original, &[]).unwrap(), vec![Value::from("old")]);

        assert!(hooks.restore_metamethod(&obj, "__index").unwrap());
        assert_eq!(vm.index(&obj, &Value::from("x")).unwrap(), Value::from("old"));
    }

    #[test]
    fn test_metamethod_hook_requires_metatable() {
        let (vm, _, hooks) = setup();
        let plain = Value::Table(vm.new_table());
        let g = add_one(&vm);
        assert!(matches!(
            hooks.install_metamethod(&plain, "__index", &g),
            Err(ExtError::Invariant(_))
        ));
    }

    #[test]
    fn test_exclusive_allows_reentrant_installs() {
        let (vm, _, hooks) = setup();
        let f = add_one(&vm);
        let h = add_one(&vm);
        let g = vm.create_native("g", |_, _| Ok(vec![]));
        hooks.exclusive(|hooks| {
            hooks.install(&f, &g).unwrap();
            hooks.exclusive(|hooks| hooks.install(&h, &g).unwrap());
        });
        assert_eq!(hooks.len(), 2);
    }

    #[test]
    fn test_owns_targets_and_originals() {
        let (vm, _, hooks) = setup();
        let f = add_one(&vm);
        let bystander = add_one(&vm);
        let g = vm.create_native("g", |_, _| Ok(vec![]));
        assert!(!hooks.owns(&f));

        let original = hooks.install(&f, &g).unwrap().unwrap();
        assert!(hooks.owns(&f));
        assert!(hooks.owns(&original));
        assert!(!hooks.owns(&bystander));
        assert!(!hooks.owns(&g));

        hooks.restore(&f).unwrap();
        assert!(!hooks.owns(&f));
        assert!(!hooks.owns(&original));
    }
}
