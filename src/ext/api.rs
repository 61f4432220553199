//! Script-facing surface
//!
//! Installs one native per operation into the interpreter's root globals.
//! Mutators check the caller's identity level against
//! `identity.privileged_level` before touching anything.

use crate::error::{ExtError, Result};
use crate::ext::gc::{FilterSpec, ObjectKind};
use crate::ext::reflect::Nested;
use crate::ext::Runtime;
use crate::interp::{CallContext, ProtoInfo, TableHandle, Value, VmError};
use std::sync::{Arc, Weak};

/// Register every script-surface function
pub fn install(rt: &Arc<Runtime>) -> Result<()> {
    // Environments
    register(rt, "get_global_env", |rt, _| Ok(vec![Value::Table(rt.envs().get_global()?)]))?;
    register(rt, "get_root_env", |rt, _| Ok(vec![Value::Table(rt.envs().get_root())]))?;
    register(rt, "get_script_env", |rt, args| {
        let id = required(&args, 0, "script id")?;
        Ok(vec![Value::Table(rt.envs().get_for_script(&id)?)])
    })?;
    register(rt, "get_module_env", |rt, args| {
        let id = required(&args, 0, "module id")?;
        Ok(vec![Value::Table(rt.envs().get_for_module(&id)?)])
    })?;

    // Hooks
    register(rt, "install_hook", |rt, args| {
        privileged(rt, "install_hook")?;
        let original = rt.hooks().install(&arg(&args, 0), &arg(&args, 1))?;
        Ok(vec![original.unwrap_or(Value::Nil)])
    })?;
    register(rt, "restore_hook", |rt, args| {
        Ok(vec![Value::Boolean(rt.hooks().restore(&arg(&args, 0))?)])
    })?;
    register(rt, "install_metamethod_hook", |rt, args| {
        privileged(rt, "install_metamethod_hook")?;
        let name = string_arg(&args, 1, "metamethod name")?;
        Ok(vec![rt.hooks().install_metamethod(&arg(&args, 0), &name, &arg(&args, 2))?])
    })?;
    register(rt, "restore_metamethod_hook", |rt, args| {
        let name = string_arg(&args, 1, "metamethod name")?;
        Ok(vec![Value::Boolean(rt.hooks().restore_metamethod(&arg(&args, 0), &name)?)])
    })?;

    // Table protection and raw metatables
    register(rt, "set_protected", |rt, args| {
        privileged(rt, "set_protected")?;
        let t = table_arg(&args, 0, "set_protected")?;
        rt.vm().set_readonly(t, arg(&args, 1).to_bool())?;
        Ok(vec![])
    })?;
    register(rt, "is_protected", |rt, args| {
        let t = table_arg(&args, 0, "is_protected")?;
        Ok(vec![Value::Boolean(rt.vm().is_readonly(t)?)])
    })?;
    register(rt, "make_readonly", |rt, args| {
        privileged(rt, "make_readonly")?;
        let t = table_arg(&args, 0, "make_readonly")?;
        rt.vm().set_readonly(t, true)?;
        Ok(vec![Value::Table(t)])
    })?;
    register(rt, "make_writeable", |rt, args| {
        privileged(rt, "make_writeable")?;
        let t = table_arg(&args, 0, "make_writeable")?;
        rt.vm().set_readonly(t, false)?;
        Ok(vec![Value::Table(t)])
    })?;
    register(rt, "get_raw_metatable", |rt, args| {
        let mt = rt.vm().get_metatable(&arg(&args, 0))?;
        Ok(vec![mt.map(Value::Table).unwrap_or(Value::Nil)])
    })?;
    register(rt, "set_raw_metatable", |rt, args| {
        privileged(rt, "set_raw_metatable")?;
        let t = table_arg(&args, 0, "set_raw_metatable")?;
        let mt = match arg(&args, 1) {
            Value::Nil => None,
            Value::Table(mt) => Some(mt),
            other => {
                return Err(ExtError::invalid_argument(format!(
                    "metatable must be a table or nil, got {}",
                    other.type_name()
                )))
            }
        };
        rt.vm().set_metatable(t, mt)?;
        Ok(vec![Value::Table(t)])
    })?;

    // Identity
    register(rt, "set_identity", |rt, args| {
        rt.identity().set(int_arg(&args, 0, "identity level")?)?;
        Ok(vec![])
    })?;
    register(rt, "get_identity", |rt, _| Ok(vec![Value::from(rt.identity().get() as usize)]))?;
    register(rt, "check_caller", |rt, _| Ok(vec![Value::Boolean(rt.identity().check_caller())]))?;

    // Reflection
    register(rt, "get_constant", |rt, args| {
        let index = int_arg(&args, 1, "constant index")?;
        Ok(vec![rt.reflect().get_constant(&arg(&args, 0), index)?.unwrap_or(Value::Nil)])
    })?;
    register(rt, "set_constant", |rt, args| {
        privileged(rt, "set_constant")?;
        let index = int_arg(&args, 1, "constant index")?;
        Ok(vec![Value::Boolean(rt.reflect().set_constant(&arg(&args, 0), index, arg(&args, 2))?)])
    })?;
    register(rt, "get_constants", |rt, args| match rt.reflect().get_constants(&arg(&args, 0))? {
        Some(constants) => Ok(vec![Value::Table(list_table(rt, constants)?)]),
        None => Ok(vec![Value::Nil]),
    })?;
    register_in(rt, "get_nested", |rt, ctx, args| {
        let index = int_arg(&args, 1, "prototype index")?;
        let activate = arg(&args, 2).to_bool();
        match rt.reflect().get_nested_from(ctx.caller(), &arg(&args, 0), index, activate)? {
            Some(Nested::Closure(f)) => Ok(vec![f]),
            Some(Nested::Descriptor(info)) => Ok(vec![Value::Table(info_table(rt, &info)?)]),
            None => Ok(vec![Value::Nil]),
        }
    })?;
    register(rt, "get_proto_info", |rt, args| match rt.reflect().get_proto_info(&arg(&args, 0))? {
        Some(info) => Ok(vec![Value::Table(info_table(rt, &info)?)]),
        None => Ok(vec![Value::Nil]),
    })?;
    register(rt, "function_hash", |rt, args| {
        Ok(vec![rt.reflect().function_hash(&arg(&args, 0))?.map(Value::from).unwrap_or(Value::Nil)])
    })?;
    register(rt, "clone_function", |rt, args| {
        Ok(vec![rt.reflect().clone_function(&arg(&args, 0))?.unwrap_or(Value::Nil)])
    })?;
    register(rt, "is_lclosure", |rt, args| Ok(vec![Value::Boolean(rt.reflect().is_lclosure(&arg(&args, 0)))]))?;
    register(rt, "is_native", |rt, args| Ok(vec![Value::Boolean(rt.reflect().is_native(&arg(&args, 0)))]))?;
    register(rt, "new_native_closure", |rt, args| Ok(vec![rt.reflect().wrap_native(&arg(&args, 0))?]))?;
    for name in ["is_runtime_closure", "check_closure"] {
        register(rt, name, |rt, args| Ok(vec![Value::Boolean(rt.is_runtime_closure(&arg(&args, 0))?)]))?;
    }
    register(rt, "get_registry", |rt, _| Ok(vec![Value::Table(list_table(rt, rt.vm().retained())?)]))?;

    // Connections
    register(rt, "register_connection", |rt, args| {
        let signal = string_arg(&args, 0, "signal name")?;
        let index = rt.connections().register(&signal, &arg(&args, 1))?;
        Ok(vec![Value::Table(connection_handle(rt, index)?)])
    })?;
    register(rt, "get_connections", |rt, args| {
        let signal = string_arg(&args, 0, "signal name")?;
        let handles = rt
            .connections()
            .get_connections(&signal)
            .into_iter()
            .map(|i| connection_handle(rt, i).map(Value::Table))
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![Value::Table(list_table(rt, handles)?)])
    })?;
    register_in(rt, "fire_signal", |rt, ctx, args| {
        let signal = string_arg(&args, 0, "signal name")?;
        let ran = rt.connections().fire_signal_in(ctx, &signal, args.get(1..).unwrap_or(&[]));
        Ok(vec![Value::from(ran)])
    })?;

    // Object enumeration
    register(rt, "enumerate_objects", |rt, args| {
        let objects: Vec<Value> = rt.gc().enumerate(arg(&args, 0).to_bool()).collect();
        Ok(vec![Value::Table(list_table(rt, objects)?)])
    })?;
    register(rt, "filter_objects", |rt, args| {
        let kind: ObjectKind = string_arg(&args, 0, "object kind")?.parse()?;
        let spec = match arg(&args, 1) {
            Value::Nil => FilterSpec::default(),
            Value::Table(t) => filter_spec(rt, t)?,
            other => {
                return Err(ExtError::invalid_argument(format!(
                    "filter spec must be a table, got {}",
                    other.type_name()
                )))
            }
        };
        let found = rt.gc().filter(kind, &spec)?;
        Ok(vec![Value::Table(list_table(rt, found)?)])
    })?;

    Ok(())
}

/// Register a global native bound to `rt` without keeping it alive
fn register<F>(rt: &Arc<Runtime>, name: &'static str, func: F) -> Result<()>
where
    F: Fn(&Arc<Runtime>, Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
{
    register_in(rt, name, move |rt, _, args| func(rt, args))
}

/// Like [`register`], for natives that call back into the VM
fn register_in<F>(rt: &Arc<Runtime>, name: &'static str, func: F) -> Result<()>
where
    F: Fn(&Arc<Runtime>, &mut CallContext<'_>, Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
{
    let weak: Weak<Runtime> = Arc::downgrade(rt);
    let native = rt.vm().create_native(name, move |ctx, args| {
        let rt = weak
            .upgrade()
            .ok_or_else(|| VmError::Runtime(format!("{}: runtime has been dropped", name)))?;
        Ok(func(&rt, ctx, args)?)
    });
    rt.vm().set_global(name, native)?;
    Ok(())
}

fn privileged(rt: &Runtime, operation: &'static str) -> Result<()> {
    rt.identity().require(operation, rt.config().identity.privileged_level)
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Nil)
}

fn required(args: &[Value], i: usize, what: &str) -> Result<Value> {
    match arg(args, i) {
        Value::Nil => Err(ExtError::invalid_argument(format!("missing {}", what))),
        v => Ok(v),
    }
}

fn int_arg(args: &[Value], i: usize, what: &str) -> Result<i64> {
    match arg(args, i) {
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Ok(n as i64),
        other => Err(ExtError::invalid_argument(format!(
            "{} must be an integer, got {}",
            what,
            other.type_name()
        ))),
    }
}

fn string_arg(args: &[Value], i: usize, what: &str) -> Result<String> {
    match arg(args, i) {
        Value::String(s) => Ok(s.to_string()),
        other => Err(ExtError::invalid_argument(format!(
            "{} must be a string, got {}",
            what,
            other.type_name()
        ))),
    }
}

fn table_arg(args: &[Value], i: usize, operation: &str) -> Result<TableHandle> {
    let value = arg(args, i);
    value.as_table().ok_or_else(|| {
        ExtError::invalid_argument(format!("{} expects a table, got {}", operation, value.type_name()))
    })
}

fn list_table(rt: &Runtime, values: Vec<Value>) -> Result<TableHandle> {
    let t = rt.vm().new_table();
    for (i, v) in values.into_iter().enumerate() {
        rt.vm().raw_set(t, Value::from(i + 1), v)?;
    }
    Ok(t)
}

fn info_table(rt: &Runtime, info: &ProtoInfo) -> Result<TableHandle> {
    let vm = rt.vm();
    let t = vm.new_table();
    let name = info.name.as_deref().map(Value::from).unwrap_or(Value::Nil);
    vm.raw_set(t, Value::from("name"), name)?;
    vm.raw_set(t, Value::from("param_count"), Value::from(info.param_count as usize))?;
    vm.raw_set(t, Value::from("is_vararg"), Value::Boolean(info.is_vararg))?;
    vm.raw_set(t, Value::from("constant_count"), Value::from(info.constant_count))?;
    vm.raw_set(t, Value::from("nested_count"), Value::from(info.nested_count))?;
    vm.raw_set(t, Value::from("upvalue_count"), Value::from(info.upvalue_count as usize))?;
    vm.raw_set(t, Value::from("line_defined"), Value::from(info.line_defined as usize))?;
    Ok(t)
}

/// `{ Index, Signal, Enable, Disable, Fire, Disconnect }`
///
/// Methods accept being called with the handle as first argument.
fn connection_handle(rt: &Arc<Runtime>, index: usize) -> Result<TableHandle> {
    let vm = rt.vm();
    let handle = vm.new_table();
    let signal = rt.connections().info(index).map(|i| Value::from(&*i.signal)).unwrap_or(Value::Nil);
    vm.raw_set(handle, Value::from("Index"), Value::from(index))?;
    vm.raw_set(handle, Value::from("Signal"), signal)?;

    type Method = fn(&Runtime, &mut CallContext<'_>, usize, &[Value]) -> Value;
    let methods: [(&str, Method); 4] = [
        ("Enable", |rt, _, i, _| Value::Boolean(rt.connections().enable(i))),
        ("Disable", |rt, _, i, _| Value::Boolean(rt.connections().disable(i))),
        ("Fire", |rt, ctx, i, args| Value::Boolean(rt.connections().fire_in(ctx, i, args))),
        ("Disconnect", |rt, _, i, _| Value::Boolean(rt.connections().disconnect(i))),
    ];

    for (name, method) in methods {
        let weak = Arc::downgrade(rt);
        let native = vm.create_native(name, move |ctx, args| {
            let rt = weak
                .upgrade()
                .ok_or_else(|| VmError::Runtime("runtime has been dropped".into()))?;
            let rest = match args.first() {
                Some(Value::Table(t)) if *t == handle => &args[1..],
                _ => &args[..],
            };
            Ok(vec![method(&rt, ctx, index, rest)])
        });
        vm.raw_set(handle, Value::from(name), native)?;
    }
    Ok(handle)
}

fn filter_spec(rt: &Runtime, t: TableHandle) -> Result<FilterSpec> {
    let vm = rt.vm();
    let field = |name: &str| vm.raw_get(t, &Value::from(name));
    let count = |name: &str| -> Result<Option<usize>> {
        match field(name)? {
            Value::Nil => Ok(None),
            Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(Some(n as usize)),
            other => Err(ExtError::invalid_argument(format!(
                "filter field '{}' must be a non-negative integer, got {}",
                name,
                other.type_name()
            ))),
        }
    };
    let list = |name: &str| -> Result<Vec<Value>> {
        match field(name)? {
            Value::Nil => Ok(Vec::new()),
            Value::Table(list) => Ok(vm.heap().get_table(list)?.array.clone()),
            other => Err(ExtError::invalid_argument(format!(
                "filter field '{}' must be a table, got {}",
                name,
                other.type_name()
            ))),
        }
    };

    Ok(FilterSpec {
        name: field("name")?.as_str().map(String::from),
        upvalue_count: count("upvalue_count")?,
        constant_count: count("constant_count")?,
        ignore_host: field("ignore_host")?.to_bool(),
        keys: list("keys")?,
        values: list("values")?,
        metatable: field("metatable")?.as_table(),
    })
}
