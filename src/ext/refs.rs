//! Retention of interpreter values across host calls
//!
//! A [`RetainedRef`] owns one slot in the VM's ref table. The slot keeps its
//! value alive through collections and is released exactly once, when the
//! guard drops.

use crate::error::Result;
use crate::interp::{Handle, Value, Vm};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Hands out [`RetainedRef`] guards for one VM
pub struct ReferenceRegistry {
    vm: Arc<Vm>,
    live: Arc<AtomicUsize>,
}

impl ReferenceRegistry {
    pub fn new(vm: Arc<Vm>) -> Self {
        ReferenceRegistry {
            vm,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Retain `value` until the returned guard is dropped
    pub fn retain(&self, value: Value) -> Result<RetainedRef> {
        let key = self.vm.retain(value.clone())?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(RetainedRef {
            vm: self.vm.clone(),
            key,
            value,
            live: self.live.clone(),
        })
    }

    /// Guards handed out by this registry that have not been dropped yet
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Owned slot in the VM ref table
pub struct RetainedRef {
    vm: Arc<Vm>,
    key: Handle,
    value: Value,
    live: Arc<AtomicUsize>,
}

impl RetainedRef {
    pub fn get(&self) -> &Value {
        &self.value
    }

    pub fn key(&self) -> Handle {
        self.key
    }
}

impl fmt::Debug for RetainedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetainedRef").field("key", &self.key).field("value", &self.value).finish()
    }
}

impl Drop for RetainedRef {
    fn drop(&mut self) {
        if self.vm.release(self.key) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::VmLimits;

    #[test]
    fn test_release_on_drop() {
        let vm = Vm::new(VmLimits::default());
        let refs = ReferenceRegistry::new(vm.clone());
        let t = Value::Table(vm.new_table());

        let guard = refs.retain(t.clone()).unwrap();
        assert_eq!(refs.live_count(), 1);
        assert_eq!(vm.resolve(guard.key()), Some(t.clone()));
        assert_eq!(vm.collect_garbage(), Some(0));

        let key = guard.key();
        drop(guard);
        assert_eq!(refs.live_count(), 0);
        assert_eq!(vm.resolve(key), None);
        assert_eq!(vm.collect_garbage(), Some(1));
    }

    #[test]
    fn test_release_on_error_path() {
        fn fails(refs: &ReferenceRegistry, v: Value) -> Result<()> {
            let _guard = refs.retain(v)?;
            Err(crate::error::ExtError::invariant("bail out"))
        }

        let vm = Vm::new(VmLimits::default());
        let refs = ReferenceRegistry::new(vm.clone());
        assert!(fails(&refs, Value::Table(vm.new_table())).is_err());
        assert_eq!(refs.live_count(), 0);
    }
}
