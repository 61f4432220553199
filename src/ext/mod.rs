//! Extension core
//!
//! A [`Runtime`] owns one VM and one instance of every registry. Nothing is
//! process-global: two runtimes never share hooks, connections, identities
//! or environments, and dropping a runtime discards all of its state.

pub mod api;
pub mod env;
pub mod gc;
pub mod hooks;
pub mod identity;
pub mod reflect;
pub mod refs;
pub mod signals;

pub use env::EnvironmentStore;
pub use gc::{FilterSpec, GcWalker, ObjectKind, ObjectSnapshot};
pub use hooks::HookRegistry;
pub use identity::IdentityRegistry;
pub use reflect::{Nested, ReflectionEngine};
pub use refs::{ReferenceRegistry, RetainedRef};
pub use signals::{ConnectionInfo, ConnectionRegistry};

use crate::config::Config;
use crate::error::{ExtError, Result};
use crate::interp::{ProtoRef, TableHandle, Value, Vm};
use std::sync::Arc;
use uuid::Uuid;

/// Per-VM extension context
pub struct Runtime {
    id: Uuid,
    config: Config,
    vm: Arc<Vm>,
    refs: Arc<ReferenceRegistry>,
    identity: IdentityRegistry,
    envs: EnvironmentStore,
    hooks: HookRegistry,
    reflect: ReflectionEngine,
    connections: ConnectionRegistry,
    gc: GcWalker,
}

impl Runtime {
    /// Create a VM with its registries and install the script surface
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let vm = Vm::new(config.vm.limits());
        let refs = Arc::new(ReferenceRegistry::new(vm.clone()));
        let runtime = Arc::new(Runtime {
            id: Uuid::new_v4(),
            identity: IdentityRegistry::new(config.identity.default_level),
            envs: EnvironmentStore::new(vm.clone(), refs.clone()),
            hooks: HookRegistry::new(vm.clone(), refs.clone()),
            reflect: ReflectionEngine::new(vm.clone()),
            connections: ConnectionRegistry::new(vm.clone(), refs.clone()),
            gc: GcWalker::new(vm.clone()),
            refs,
            vm,
            config,
        });
        api::install(&runtime)?;
        tracing::info!(runtime = %runtime.id, "runtime created");
        Ok(runtime)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn refs(&self) -> &ReferenceRegistry {
        &self.refs
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    pub fn envs(&self) -> &EnvironmentStore {
        &self.envs
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn reflect(&self) -> &ReflectionEngine {
        &self.reflect
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn gc(&self) -> &GcWalker {
        &self.gc
    }

    /// Instantiate a top-level chunk running in the global environment
    pub fn load(&self, proto: ProtoRef) -> Result<Value> {
        let env = self.envs.get_global()?;
        Ok(self.vm.instantiate(proto, Some(env)))
    }

    /// Instantiate a chunk in the environment of the script identified by `id`
    pub fn load_script(&self, id: &Value, proto: ProtoRef) -> Result<Value> {
        let env = self.envs.get_for_script(id)?;
        Ok(self.vm.instantiate(proto, Some(env)))
    }

    pub fn call(&self, f: &Value, args: &[Value]) -> Result<Vec<Value>> {
        Ok(self.vm.call(f, args)?)
    }

    /// Read a field of the global environment
    pub fn global(&self, name: &str) -> Result<Value> {
        let env = Value::Table(self.envs.get_global()?);
        Ok(self.vm.index(&env, &Value::from(name))?)
    }

    pub fn root(&self) -> TableHandle {
        self.vm.globals()
    }

    /// Whether `f` is a native or a closure the hook registry put in play
    pub fn is_runtime_closure(&self, f: &Value) -> Result<bool> {
        match f {
            Value::Native(_) => Ok(true),
            Value::Closure(_) => Ok(self.hooks.owns(f)),
            other => Err(ExtError::invalid_argument(format!(
                "expected a function, got {}",
                other.type_name()
            ))),
        }
    }

    /// Collect garbage; `None` while a call is running
    pub fn collect_garbage(&self) -> Option<usize> {
        self.vm.collect_garbage()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        tracing::info!(runtime = %self.id, "runtime shut down");
    }
}
