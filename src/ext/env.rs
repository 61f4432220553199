//! Layered environment tables
//!
//! Every environment is an overlay whose metatable `__index` points at the
//! interpreter's root globals: unset keys read through, writes stay in the
//! overlay. Environments are cached for the life of the runtime.

use crate::error::Result;
use crate::ext::refs::{ReferenceRegistry, RetainedRef};
use crate::interp::{TableHandle, Value, Vm};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct EnvCache {
    /// Shared `{ __index = root }` metatable
    fallback: Option<RetainedRef>,
    global: Option<RetainedRef>,
    scripts: HashMap<Value, RetainedRef>,
    modules: HashMap<Value, RetainedRef>,
}

pub struct EnvironmentStore {
    vm: Arc<Vm>,
    refs: Arc<ReferenceRegistry>,
    cache: Mutex<EnvCache>,
}

impl EnvironmentStore {
    pub fn new(vm: Arc<Vm>, refs: Arc<ReferenceRegistry>) -> Self {
        EnvironmentStore {
            vm,
            refs,
            cache: Mutex::new(EnvCache::default()),
        }
    }

    /// The interpreter's true global table
    pub fn get_root(&self) -> TableHandle {
        self.vm.globals()
    }

    /// The runtime-wide global environment
    pub fn get_global(&self) -> Result<TableHandle> {
        let mut cache = self.cache.lock();
        if let Some(env) = &cache.global {
            return table_of(env);
        }
        let env = self.create(&mut *cache)?;
        let handle = table_of(&env)?;
        cache.global = Some(env);
        Ok(handle)
    }

    /// Environment owned by the script identified by `id`
    pub fn get_for_script(&self, id: &Value) -> Result<TableHandle> {
        self.keyed(id, |cache| &mut cache.scripts)
    }

    /// Environment owned by the module identified by `id`
    pub fn get_for_module(&self, id: &Value) -> Result<TableHandle> {
        self.keyed(id, |cache| &mut cache.modules)
    }

    /// Cached script and module environments
    pub fn len(&self) -> usize {
        let cache = self.cache.lock();
        cache.scripts.len() + cache.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keyed<F>(&self, id: &Value, slot: F) -> Result<TableHandle>
    where
        F: Fn(&mut EnvCache) -> &mut HashMap<Value, RetainedRef>,
    {
        self.vm.check_owner(id)?;
        let mut cache = self.cache.lock();
        if let Some(env) = slot(&mut *cache).get(id) {
            return table_of(env);
        }
        let env = self.create(&mut *cache)?;
        let handle = table_of(&env)?;
        slot(&mut *cache).insert(id.clone(), env);
        tracing::debug!(id = %id, "environment created");
        Ok(handle)
    }

    fn create(&self, cache: &mut EnvCache) -> Result<RetainedRef> {
        let fallback = match &cache.fallback {
            Some(mt) => table_of(mt)?,
            None => {
                let mt = self.vm.new_table();
                let guard = self.refs.retain(Value::Table(mt))?;
                self.vm.raw_set(mt, Value::from("__index"), Value::Table(self.vm.globals()))?;
                // Shared by every environment; a write here would leak across them
                self.vm.set_readonly(mt, true)?;
                cache.fallback = Some(guard);
                mt
            }
        };
        let env = self.vm.new_table();
        let guard = self.refs.retain(Value::Table(env))?;
        self.vm.set_metatable(env, Some(fallback))?;
        Ok(guard)
    }
}

fn table_of(r: &RetainedRef) -> Result<TableHandle> {
    r.get()
        .as_table()
        .ok_or_else(|| crate::error::ExtError::invariant("cached environment is not a table"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::VmLimits;

    fn store() -> (Arc<Vm>, EnvironmentStore) {
        let vm = Vm::new(VmLimits::default());
        let refs = Arc::new(ReferenceRegistry::new(vm.clone()));
        (vm.clone(), EnvironmentStore::new(vm, refs))
    }

    #[test]
    fn test_global_env_is_cached() {
        let (_, envs) = store();
        assert_eq!(envs.get_global().unwrap(), envs.get_global().unwrap());
        assert_ne!(envs.get_global().unwrap(), envs.get_root());
    }

    #[test]
    fn test_reads_fall_through_writes_stay() {
        let (vm, envs) = store();
        vm.set_global("print_level", Value::from(3)).unwrap();
        let env = Value::Table(envs.get_global().unwrap());

        assert_eq!(vm.index(&env, &Value::from("print_level")).unwrap(), Value::from(3));
        vm.set_index(&env, Value::from("mine"), Value::from(true)).unwrap();
        assert_eq!(vm.get_global("mine").unwrap(), Value::Nil);
    }

    #[test]
    fn test_script_envs_keyed_by_identity() {
        let (vm, envs) = store();
        let a = Value::Table(vm.new_table());
        let b = Value::Table(vm.new_table());
        let ea = envs.get_for_script(&a).unwrap();
        assert_eq!(envs.get_for_script(&a).unwrap(), ea);
        assert_ne!(envs.get_for_script(&b).unwrap(), ea);
        assert_ne!(envs.get_for_module(&a).unwrap(), ea);
        assert_eq!(envs.len(), 3);
    }

    #[test]
    fn test_envs_survive_collection() {
        let (vm, envs) = store();
        let env = envs.get_global().unwrap();
        vm.collect_garbage();
        assert!(vm.set_metatable(env, None).is_ok());
    }
}
