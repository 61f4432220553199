//! Register VM
//!
//! The heap lives behind one mutex that is only ever held for short,
//! non-reentrant sections: it is released before any native function or
//! metamethod runs, so host callbacks are free to call back into the VM from
//! the same or another thread.

use crate::interp::arena::Handle;
use crate::interp::error::{Result, VmError};
use crate::interp::heap::{HeapStats, LuaHeap};
use crate::interp::proto::ProtoRef;
use crate::interp::value::{
    new_cell, ClosureHandle, Instruction, NativeHandle, OpCode, TableHandle, UpvalueCell, Value,
    RK_CONSTANT,
};
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Host function signature
pub type NativeFn =
    Arc<dyn Fn(&mut CallContext<'_>, Vec<Value>) -> Result<Vec<Value>> + Send + Sync>;

/// Maximum metatable hops for one __index / __newindex lookup
const MAX_META_CHAIN: usize = 100;

/// Fields per SETLIST batch
const FIELDS_PER_FLUSH: usize = 50;

/// Resource limits for one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    /// Maximum nested call depth
    pub call_depth: usize,

    /// Maximum instructions per top-level call (0 = unlimited)
    pub instruction_limit: u64,

    /// Maximum closure redirects followed for one call
    pub redirect_depth: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        VmLimits {
            call_depth: 200,
            instruction_limit: 10_000_000,
            redirect_depth: 16,
        }
    }
}

/// Execution context handed to native functions
pub struct CallContext<'a> {
    vm: &'a Arc<Vm>,
    caller: Option<ClosureHandle>,
    depth: usize,
    steps: &'a Cell<u64>,
}

impl<'a> CallContext<'a> {
    /// The VM this call runs on
    pub fn vm(&self) -> &'a Arc<Vm> {
        self.vm
    }

    /// Bytecode closure that issued this call, if any
    pub fn caller(&self) -> Option<ClosureHandle> {
        self.caller
    }

    /// Call back into the VM, sharing this call's depth and instruction budget
    pub fn call(&mut self, f: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        self.vm.call_value(f, args, self.caller, self.depth + 1, self.steps)
    }
}

/// Decrements the active-call count when a host entry point unwinds
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The virtual machine
pub struct Vm {
    heap: Mutex<LuaHeap>,

    /// True global scope
    globals: TableHandle,

    limits: VmLimits,

    /// Calls currently executing on any thread
    active_calls: AtomicUsize,
}

impl Vm {
    /// Create a new VM instance
    pub fn new(limits: VmLimits) -> Arc<Self> {
        let mut heap = LuaHeap::new();
        let globals = heap.alloc_table();
        Arc::new(Vm {
            heap: Mutex::new(heap),
            globals,
            limits,
            active_calls: AtomicUsize::new(0),
        })
    }

    /// Identity of the calling execution context
    pub fn context_id() -> ThreadId {
        std::thread::current().id()
    }

    /// Root global table
    pub fn globals(&self) -> TableHandle {
        self.globals
    }

    pub fn limits(&self) -> VmLimits {
        self.limits
    }

    /// Lock the heap; never hold the guard across a call into the VM
    pub fn heap(&self) -> MutexGuard<'_, LuaHeap> {
        self.heap.lock()
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }

    /// Reject values minted by another VM
    pub fn check_owner(&self, value: &Value) -> Result<()> {
        self.heap.lock().check_owner(value)
    }

    pub fn new_table(&self) -> TableHandle {
        self.heap.lock().alloc_table()
    }

    /// Register a host function
    pub fn create_native<F>(&self, name: &str, func: F) -> Value
    where
        F: Fn(&mut CallContext<'_>, Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        Value::Native(self.heap.lock().alloc_native(name, Arc::new(func), Vec::new()))
    }

    /// Register a host function that holds on to `bound`
    ///
    /// The collector treats `bound` as reachable from the native, so a
    /// function captured by `func` stays alive for as long as the native does.
    pub fn create_native_with<F>(&self, name: &str, bound: Vec<Value>, func: F) -> Result<Value>
    where
        F: Fn(&mut CallContext<'_>, Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let mut heap = self.heap.lock();
        for value in &bound {
            heap.check_owner(value)?;
        }
        Ok(Value::Native(heap.alloc_native(name, Arc::new(func), bound)))
    }

    /// Instantiate a closure over `proto`; upvalue cells start as nil
    pub fn instantiate(&self, proto: ProtoRef, env: Option<TableHandle>) -> Value {
        let count = proto.read().upvalue_count as usize;
        let cells = (0..count).map(|_| new_cell(Value::Nil)).collect();
        let env = env.unwrap_or(self.globals);
        Value::Closure(self.heap.lock().alloc_closure(proto, cells, env))
    }

    /// Read a key without consulting metatables
    pub fn raw_get(&self, table: TableHandle, key: &Value) -> Result<Value> {
        let heap = self.heap.lock();
        Ok(heap.get_table(table)?.get(key).cloned().unwrap_or(Value::Nil))
    }

    /// Write a key without consulting metatables; honours the readonly flag
    pub fn raw_set(&self, table: TableHandle, key: Value, value: Value) -> Result<()> {
        check_key(&key)?;
        let mut heap = self.heap.lock();
        heap.check_owner(&value)?;
        let t = heap.get_table_mut(table)?;
        if t.readonly {
            return Err(VmError::ReadOnly);
        }
        t.set(key, value);
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Result<Value> {
        self.raw_get(self.globals, &Value::from(name))
    }

    pub fn set_global(&self, name: &str, value: Value) -> Result<()> {
        self.raw_set(self.globals, Value::from(name), value)
    }

    /// Metatable of a value (only tables carry one)
    pub fn get_metatable(&self, value: &Value) -> Result<Option<TableHandle>> {
        match value {
            Value::Table(t) => Ok(self.heap.lock().get_table(*t)?.metatable),
            _ => Ok(None),
        }
    }

    pub fn set_metatable(&self, table: TableHandle, metatable: Option<TableHandle>) -> Result<()> {
        let mut heap = self.heap.lock();
        if let Some(mt) = metatable {
            heap.get_table(mt)?;
        }
        heap.get_table_mut(table)?.metatable = metatable;
        Ok(())
    }

    pub fn set_readonly(&self, table: TableHandle, readonly: bool) -> Result<()> {
        self.heap.lock().get_table_mut(table)?.readonly = readonly;
        Ok(())
    }

    pub fn is_readonly(&self, table: TableHandle) -> Result<bool> {
        Ok(self.heap.lock().get_table(table)?.readonly)
    }

    /// Prototype behind a bytecode closure
    pub fn closure_proto(&self, closure: ClosureHandle) -> Result<ProtoRef> {
        Ok(self.heap.lock().get_closure(closure)?.proto.clone())
    }

    /// Environment table of a bytecode closure
    pub fn closure_env(&self, closure: ClosureHandle) -> Result<TableHandle> {
        Ok(self.heap.lock().get_closure(closure)?.env)
    }

    pub fn upvalue_count(&self, closure: ClosureHandle) -> Result<usize> {
        Ok(self.heap.lock().get_closure(closure)?.upvalues.len())
    }

    /// Debug name of a callable
    pub fn function_name(&self, value: &Value) -> Result<Option<String>> {
        let heap = self.heap.lock();
        let name = match value {
            Value::Closure(c) => heap.get_closure(*c)?.proto.read().name.as_deref().map(String::from),
            Value::Native(n) => Some(heap.get_native(*n)?.name.to_string()),
            _ => None,
        };
        Ok(name)
    }

    /// Duplicate a callable into a fresh identity sharing its code
    ///
    /// Bytecode closures keep their prototype, upvalue cells and environment
    /// but never inherit a redirect. Natives share the host function. Returns
    /// `None` for non-callables.
    pub fn clone_function(&self, value: &Value) -> Result<Option<Value>> {
        let mut heap = self.heap.lock();
        heap.check_owner(value)?;
        match value {
            Value::Closure(c) => {
                let (proto, cells, env) = {
                    let obj = heap.get_closure(*c)?;
                    (obj.proto.clone(), obj.upvalues.to_vec(), obj.env)
                };
                Ok(Some(Value::Closure(heap.alloc_closure(proto, cells, env))))
            }
            Value::Native(n) => {
                let (name, func, bound) = {
                    let obj = heap.get_native(*n)?;
                    (obj.name.clone(), obj.func.clone(), obj.bound.clone())
                };
                Ok(Some(Value::Native(heap.alloc_native(&name, func, bound))))
            }
            _ => Ok(None),
        }
    }

    /// Point (or stop pointing) calls reaching `closure` at another callable
    pub fn set_redirect(&self, closure: ClosureHandle, target: Option<Value>) -> Result<()> {
        let mut heap = self.heap.lock();
        if let Some(t) = &target {
            heap.check_owner(t)?;
        }
        heap.get_closure_mut(closure)?.redirect = target;
        Ok(())
    }

    /// Retain a value across host calls, keeping it alive through collections
    pub fn retain(&self, value: Value) -> Result<Handle> {
        let mut heap = self.heap.lock();
        heap.check_owner(&value)?;
        Ok(heap.refs.insert(value))
    }

    /// Release a retained value; false if it was already released
    pub fn release(&self, key: Handle) -> bool {
        self.heap.lock().refs.remove(key).is_some()
    }

    pub fn resolve(&self, key: Handle) -> Option<Value> {
        self.heap.lock().refs.get(key).ok().cloned()
    }

    /// Snapshot of every retained value
    pub fn retained(&self) -> Vec<Value> {
        self.heap.lock().refs.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Every live object: closures and natives first, then tables
    pub fn objects(&self, include_tables: bool) -> Vec<Value> {
        let heap = self.heap.lock();
        let mut out: Vec<Value> = heap
            .closures
            .iter()
            .map(|(h, _)| Value::Closure(ClosureHandle(h)))
            .chain(heap.natives.iter().map(|(h, _)| Value::Native(NativeHandle(h))))
            .collect();
        if include_tables {
            out.extend(heap.tables.iter().map(|(h, _)| Value::Table(TableHandle(h))));
        }
        out
    }

    /// Run a full collection; skipped (returns `None`) while any call is active
    ///
    /// The count is read under the heap lock, the same lock `enter` takes to
    /// bump it, so a call can never start between the check and the sweep.
    pub fn collect_garbage(&self) -> Option<usize> {
        let mut heap = self.heap.lock();
        if self.active_calls.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let freed = heap.collect(&[Value::Table(self.globals)]);
        drop(heap);
        tracing::debug!(freed, "garbage collection finished");
        Some(freed)
    }

    /// Mark a host entry point as running until the guard drops
    fn enter(&self) -> ActiveCall<'_> {
        let _heap = self.heap.lock();
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        ActiveCall(&self.active_calls)
    }

    /// Call any callable value
    pub fn call(self: &Arc<Self>, f: &Value, args: &[Value]) -> Result<Vec<Value>> {
        let _active = self.enter();
        let steps = Cell::new(0);
        self.call_value(f, args.to_vec(), None, 0, &steps)
    }

    /// Index with `__index` fallback
    pub fn index(self: &Arc<Self>, object: &Value, key: &Value) -> Result<Value> {
        let _active = self.enter();
        let steps = Cell::new(0);
        self.index_value(object, key, 0, &steps)
    }

    /// Assign with `__newindex` fallback and readonly enforcement
    pub fn set_index(self: &Arc<Self>, object: &Value, key: Value, value: Value) -> Result<()> {
        let _active = self.enter();
        let steps = Cell::new(0);
        self.set_index_value(object, key, value, 0, &steps)
    }

    fn metamethod(&self, value: &Value, name: &str) -> Result<Value> {
        let heap = self.heap.lock();
        if let Value::Table(t) = value {
            if let Some(mt) = heap.get_table(*t)?.metatable {
                return Ok(heap.get_table(mt)?.get_str(name).cloned().unwrap_or(Value::Nil));
            }
        }
        Ok(Value::Nil)
    }

    fn index_value(self: &Arc<Self>, object: &Value, key: &Value, depth: usize, steps: &Cell<u64>) -> Result<Value> {
        let mut current = object.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let heap = self.heap.lock();
                    let table = heap.get_table(*t)?;
                    if let Some(v) = table.get(key) {
                        return Ok(v.clone());
                    }
                    match table.metatable {
                        Some(mt) => heap.get_table(mt)?.get_str("__index").cloned().unwrap_or(Value::Nil),
                        None => return Ok(Value::Nil),
                    }
                }
                other => {
                    return Err(VmError::TypeError(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )))
                }
            };
            match handler {
                Value::Nil => return Ok(Value::Nil),
                h if h.is_function() => {
                    let out = self.call_value(&h, vec![current, key.clone()], None, depth + 1, steps)?;
                    return Ok(out.into_iter().next().unwrap_or(Value::Nil));
                }
                next => current = next,
            }
        }
        Err(VmError::Runtime("'__index' chain too long; possible loop".into()))
    }

    fn set_index_value(
        self: &Arc<Self>,
        object: &Value,
        key: Value,
        value: Value,
        depth: usize,
        steps: &Cell<u64>,
    ) -> Result<()> {
        check_key(&key)?;
        let mut current = object.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let mut heap = self.heap.lock();
                    heap.check_owner(&value)?;
                    let handler = {
                        let table = heap.get_table(*t)?;
                        if table.get(&key).is_some() {
                            Value::Nil
                        } else {
                            match table.metatable {
                                Some(mt) => heap.get_table(mt)?.get_str("__newindex").cloned().unwrap_or(Value::Nil),
                                None => Value::Nil,
                            }
                        }
                    };
                    if handler.is_nil() {
                        let table = heap.get_table_mut(*t)?;
                        if table.readonly {
                            return Err(VmError::ReadOnly);
                        }
                        table.set(key, value);
                        return Ok(());
                    }
                    handler
                }
                other => {
                    return Err(VmError::TypeError(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )))
                }
            };
            if handler.is_function() {
                self.call_value(&handler, vec![current, key, value], None, depth + 1, steps)?;
                return Ok(());
            }
            current = handler;
        }
        Err(VmError::Runtime("'__newindex' chain too long; possible loop".into()))
    }

    pub(crate) fn call_value(
        self: &Arc<Self>,
        f: &Value,
        args: Vec<Value>,
        caller: Option<ClosureHandle>,
        depth: usize,
        steps: &Cell<u64>,
    ) -> Result<Vec<Value>> {
        if depth > self.limits.call_depth {
            return Err(VmError::StackOverflow);
        }
        let target = self.follow_redirects(f)?;
        self.dispatch(target, args, caller, depth, steps)
    }

    /// The callable a call to `f` actually reaches
    fn follow_redirects(&self, f: &Value) -> Result<Value> {
        let mut target = f.clone();
        let mut hops = 0;
        while let Value::Closure(c) = target {
            let next = self.heap.lock().get_closure(c)?.redirect.clone();
            match next {
                Some(next) => target = next,
                None => break,
            }
            hops += 1;
            if hops > self.limits.redirect_depth {
                return Err(VmError::Runtime("redirect chain too deep".into()));
            }
        }
        Ok(target)
    }

    fn dispatch(
        self: &Arc<Self>,
        target: Value,
        args: Vec<Value>,
        caller: Option<ClosureHandle>,
        depth: usize,
        steps: &Cell<u64>,
    ) -> Result<Vec<Value>> {
        match target {
            Value::Closure(c) => self.execute(c, args, depth, steps),
            Value::Native(n) => {
                let func = self.heap.lock().get_native(n)?.func.clone();
                let mut ctx = CallContext { vm: self, caller, depth, steps };
                func(&mut ctx, args)
            }
            Value::Table(_) => {
                let handler = self.metamethod(&target, "__call")?;
                if !handler.is_function() {
                    return Err(VmError::NotCallable("table"));
                }
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(target);
                full.extend(args);
                self.call_value(&handler, full, caller, depth + 1, steps)
            }
            other => Err(VmError::NotCallable(other.type_name())),
        }
    }

    /// Set up an activation of `closure` at `depth`
    fn open_frame(&self, closure: ClosureHandle, args: Vec<Value>, depth: usize, resume: Resume) -> Result<Frame> {
        let (proto, upvalues, env) = {
            let heap = self.heap.lock();
            let obj = heap.get_closure(closure)?;
            (obj.proto.clone(), obj.upvalues.clone(), obj.env)
        };
        let (code, param_count, is_vararg, max_stack) = {
            let p = proto.read();
            (p.code.clone(), p.param_count as usize, p.is_vararg, p.max_stack as usize)
        };

        let mut regs = vec![Value::Nil; max_stack.max(param_count).max(1)];
        let mut varargs = Vec::new();
        for (i, arg) in args.into_iter().enumerate() {
            if i < param_count {
                regs[i] = arg;
            } else if is_vararg {
                varargs.push(arg);
            }
        }

        Ok(Frame {
            closure,
            proto,
            code,
            upvalues,
            env,
            regs,
            varargs,
            top: 0,
            pc: 0,
            depth,
            resume,
            captured: HashMap::new(),
        })
    }

    /// Run bytecode on an explicit frame stack
    ///
    /// Calls between bytecode closures push a frame instead of recursing on
    /// the host stack; only natives and metamethods re-enter `call_value`.
    fn execute(self: &Arc<Self>, closure: ClosureHandle, args: Vec<Value>, depth: usize, steps: &Cell<u64>) -> Result<Vec<Value>> {
        let mut stack = vec![self.open_frame(closure, args, depth, Resume::Forward)?];
        loop {
            let Some(frame) = stack.last_mut() else {
                return Ok(Vec::new());
            };
            let results = match self.step(frame, steps)? {
                Flow::Next => continue,
                Flow::Return(values) => values,
                Flow::Call { func, args, a, c, tail } => {
                    let depth = frame.depth + 1;
                    if depth > self.limits.call_depth {
                        return Err(VmError::StackOverflow);
                    }
                    let caller = frame.closure;
                    match self.follow_redirects(&func)? {
                        Value::Closure(callee) => {
                            let resume = if tail { Resume::Forward } else { Resume::Store { a, c } };
                            let next = self.open_frame(callee, args, depth, resume)?;
                            stack.push(next);
                            continue;
                        }
                        target => {
                            let results = self.dispatch(target, args, Some(caller), depth, steps)?;
                            if !tail {
                                frame.store_results(a, c, results);
                                continue;
                            }
                            results
                        }
                    }
                }
            };
            if let Some(done) = unwind(&mut stack, results) {
                return Ok(done);
            }
        }
    }

    /// Execute one instruction of `frame`
    fn step(self: &Arc<Self>, frame: &mut Frame, steps: &Cell<u64>) -> Result<Flow> {
        let pc = frame.pc;
        let instr = *frame.code.get(pc).ok_or_else(|| VmError::InvalidInstruction {
            pc,
            reason: "ran past end of code".into(),
        })?;
        frame.pc += 1;

        if self.limits.instruction_limit > 0 {
            let n = steps.get() + 1;
            if n > self.limits.instruction_limit {
                return Err(VmError::InstructionLimit);
            }
            steps.set(n);
        }

        let op = OpCode::try_from(instr.opcode()).map_err(|_| VmError::InvalidInstruction {
            pc,
            reason: format!("unknown opcode {}", instr.opcode()),
        })?;
        let a = instr.a() as usize;
        let depth = frame.depth;

        match op {
            OpCode::Move => {
                let v = frame.reg(instr.b() as usize);
                frame.set(a, v);
            }
            OpCode::LoadK => {
                let v = frame.constant(instr.bx() as usize)?;
                frame.set(a, v);
            }
            OpCode::LoadBool => {
                frame.set(a, Value::Boolean(instr.b() != 0));
                if instr.c() != 0 {
                    frame.pc += 1;
                }
            }
            OpCode::LoadNil => {
                for r in a..=instr.b() as usize {
                    frame.set(r, Value::Nil);
                }
            }
            OpCode::GetUpval => {
                let v = frame.upvalue(instr.b() as usize)?.lock().clone();
                frame.set(a, v);
            }
            OpCode::SetUpval => {
                let v = frame.reg(a);
                *frame.upvalue(instr.b() as usize)?.lock() = v;
            }
            OpCode::GetGlobal => {
                let key = frame.constant(instr.bx() as usize)?;
                let v = self.index_value(&Value::Table(frame.env), &key, depth, steps)?;
                frame.set(a, v);
            }
            OpCode::SetGlobal => {
                let key = frame.constant(instr.bx() as usize)?;
                let v = frame.reg(a);
                self.set_index_value(&Value::Table(frame.env), key, v, depth, steps)?;
            }
            OpCode::GetTable => {
                let obj = frame.reg(instr.b() as usize);
                let key = frame.rk(instr.c())?;
                let v = self.index_value(&obj, &key, depth, steps)?;
                frame.set(a, v);
            }
            OpCode::SetTable => {
                let obj = frame.reg(a);
                let key = frame.rk(instr.b())?;
                let v = frame.rk(instr.c())?;
                self.set_index_value(&obj, key, v, depth, steps)?;
            }
            OpCode::NewTable => {
                let t = self.new_table();
                frame.set(a, Value::Table(t));
            }
            OpCode::Self_ => {
                let obj = frame.reg(instr.b() as usize);
                let key = frame.rk(instr.c())?;
                let method = self.index_value(&obj, &key, depth, steps)?;
                frame.set(a + 1, obj);
                frame.set(a, method);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let lhs = frame.rk(instr.b())?;
                let rhs = frame.rk(instr.c())?;
                frame.set(a, Value::Number(arith(op, &lhs, &rhs)?));
            }
            OpCode::Unm => {
                let v = frame.reg(instr.b() as usize);
                let n = v.as_number().ok_or_else(|| arith_error(&v))?;
                frame.set(a, Value::Number(-n));
            }
            OpCode::Not => {
                let v = frame.reg(instr.b() as usize);
                frame.set(a, Value::Boolean(!v.to_bool()));
            }
            OpCode::Len => {
                let v = frame.reg(instr.b() as usize);
                let len = match &v {
                    Value::String(s) => s.len(),
                    Value::Table(t) => self.heap.lock().get_table(*t)?.len(),
                    other => {
                        return Err(VmError::TypeError(format!(
                            "attempt to get length of a {} value",
                            other.type_name()
                        )))
                    }
                };
                frame.set(a, Value::from(len));
            }
            OpCode::Concat => {
                let mut out = String::new();
                for r in instr.b() as usize..=instr.c() as usize {
                    match frame.reg(r) {
                        v @ (Value::String(_) | Value::Number(_)) => out.push_str(&v.to_string()),
                        other => {
                            return Err(VmError::TypeError(format!(
                                "attempt to concatenate a {} value",
                                other.type_name()
                            )))
                        }
                    }
                }
                frame.set(a, Value::from(out));
            }
            OpCode::Jmp => frame.pc = jump(frame.pc, instr.sbx())?,
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let lhs = frame.rk(instr.b())?;
                let rhs = frame.rk(instr.c())?;
                let result = match op {
                    OpCode::Eq => lhs == rhs,
                    OpCode::Lt => compare(&lhs, &rhs)?.is_lt(),
                    _ => compare(&lhs, &rhs)?.is_le(),
                };
                if result != (a != 0) {
                    frame.pc += 1;
                }
            }
            OpCode::Test => {
                if frame.reg(a).to_bool() != (instr.c() != 0) {
                    frame.pc += 1;
                }
            }
            OpCode::TestSet => {
                let v = frame.reg(instr.b() as usize);
                if v.to_bool() == (instr.c() != 0) {
                    frame.set(a, v);
                } else {
                    frame.pc += 1;
                }
            }
            OpCode::Call | OpCode::TailCall => {
                return Ok(Flow::Call {
                    func: frame.reg(a),
                    args: frame.span(a + 1, instr.b()),
                    a,
                    c: instr.c(),
                    tail: op == OpCode::TailCall,
                })
            }
            OpCode::Return => return Ok(Flow::Return(frame.span(a, instr.b()))),
            OpCode::ForPrep => {
                let init = frame.number(a)?;
                let step = frame.number(a + 2)?;
                frame.number(a + 1)?;
                frame.set(a, Value::Number(init - step));
                frame.pc = jump(frame.pc, instr.sbx())?;
            }
            OpCode::ForLoop => {
                let step = frame.number(a + 2)?;
                let idx = frame.number(a)? + step;
                let limit = frame.number(a + 1)?;
                let go_on = if step > 0.0 { idx <= limit } else { idx >= limit };
                frame.set(a, Value::Number(idx));
                if go_on {
                    frame.set(a + 3, Value::Number(idx));
                    frame.pc = jump(frame.pc, instr.sbx())?;
                }
            }
            OpCode::SetList => {
                let table = frame.reg(a).as_table().ok_or_else(|| VmError::TypeError(
                    "SETLIST target is not a table".into(),
                ))?;
                let values = frame.span(a + 1, instr.b() + 1);
                let offset = (instr.c() as usize).saturating_sub(1) * FIELDS_PER_FLUSH;
                let mut heap = self.heap.lock();
                let t = heap.get_table_mut(table)?;
                if t.readonly {
                    return Err(VmError::ReadOnly);
                }
                for (i, v) in values.into_iter().enumerate() {
                    t.set(Value::from(offset + i + 1), v);
                }
            }
            // Captured registers are copied into cells at closure creation
            OpCode::Close => {}
            OpCode::Closure => {
                let nested = {
                    let p = frame.proto.read();
                    p.nested.get(instr.bx() as usize).cloned()
                }
                .ok_or_else(|| VmError::InvalidInstruction {
                    pc,
                    reason: format!("no nested prototype {}", instr.bx()),
                })?;
                let count = nested.read().upvalue_count as usize;
                let mut cells = Vec::with_capacity(count);
                for _ in 0..count {
                    let at = frame.pc;
                    let pseudo = *frame.code.get(at).ok_or_else(|| VmError::InvalidInstruction {
                        pc: at,
                        reason: "missing upvalue descriptor".into(),
                    })?;
                    frame.pc += 1;
                    cells.push(frame.capture(pseudo, at)?);
                }
                let c = self.heap.lock().alloc_closure(nested, cells, frame.env);
                frame.set(a, Value::Closure(c));
            }
            OpCode::Vararg => {
                if instr.b() == 0 {
                    let count = frame.varargs.len();
                    for i in 0..count {
                        let v = frame.varargs[i].clone();
                        frame.set(a + i, v);
                    }
                    frame.top = a + count;
                } else {
                    for i in 0..(instr.b() as usize - 1) {
                        let v = frame.varargs.get(i).cloned().unwrap_or(Value::Nil);
                        frame.set(a + i, v);
                    }
                }
            }
            OpCode::TForLoop => {
                return Err(VmError::InvalidInstruction {
                    pc,
                    reason: "generic for loops are not supported".into(),
                })
            }
        }
        Ok(Flow::Next)
    }
}

/// What the frame loop does after one instruction
enum Flow {
    Next,
    Call {
        func: Value,
        args: Vec<Value>,
        a: usize,
        c: u16,
        tail: bool,
    },
    Return(Vec<Value>),
}

/// Where a finished frame's results go
#[derive(Debug, Clone, Copy)]
enum Resume {
    /// Into the caller's registers from `a`, `c` counted as in CALL
    Store { a: usize, c: u16 },
    /// Straight out of the caller as its own results
    Forward,
}

/// One bytecode activation
struct Frame {
    closure: ClosureHandle,
    proto: ProtoRef,
    code: Vec<Instruction>,
    upvalues: Box<[UpvalueCell]>,
    env: TableHandle,
    regs: Vec<Value>,
    varargs: Vec<Value>,
    /// One past the last value produced by a multi-result call or vararg
    top: usize,
    pc: usize,
    depth: usize,
    resume: Resume,
    /// Cells handed out for local registers, shared by sibling closures
    captured: HashMap<usize, UpvalueCell>,
}

impl Frame {
    fn reg(&self, r: usize) -> Value {
        self.regs.get(r).cloned().unwrap_or(Value::Nil)
    }

    fn set(&mut self, r: usize, v: Value) {
        if r >= self.regs.len() {
            self.regs.resize(r + 1, Value::Nil);
        }
        self.regs[r] = v;
    }

    /// Address of the instruction being executed
    fn current_pc(&self) -> usize {
        self.pc.saturating_sub(1)
    }

    fn constant(&self, k: usize) -> Result<Value> {
        self.proto
            .read()
            .constants
            .get(k)
            .cloned()
            .ok_or_else(|| VmError::InvalidInstruction { pc: self.current_pc(), reason: format!("no constant {}", k) })
    }

    fn rk(&self, operand: u16) -> Result<Value> {
        if operand & RK_CONSTANT != 0 {
            self.constant((operand & 0xFF) as usize)
        } else {
            Ok(self.reg(operand as usize))
        }
    }

    fn upvalue(&self, idx: usize) -> Result<&UpvalueCell> {
        self.upvalues
            .get(idx)
            .ok_or_else(|| VmError::InvalidInstruction { pc: self.current_pc(), reason: format!("no upvalue {}", idx) })
    }

    fn number(&self, r: usize) -> Result<f64> {
        let v = self.reg(r);
        v.as_number()
            .ok_or_else(|| VmError::TypeError(format!("'for' value must be a number, got {}", v.type_name())))
    }

    /// Registers `start..` selected by a B/C count field (0 = up to top)
    fn span(&self, start: usize, count: u16) -> Vec<Value> {
        let end = if count == 0 { self.top.max(start) } else { start + count as usize - 1 };
        (start..end).map(|r| self.reg(r)).collect()
    }

    fn store_results(&mut self, a: usize, c: u16, results: Vec<Value>) {
        if c == 0 {
            self.top = a + results.len();
            for (i, v) in results.into_iter().enumerate() {
                self.set(a + i, v);
            }
        } else {
            let wanted = c as usize - 1;
            let mut it = results.into_iter();
            for i in 0..wanted {
                self.set(a + i, it.next().unwrap_or(Value::Nil));
            }
        }
    }

    /// Resolve the upvalue descriptor at `at`, which follows a CLOSURE
    fn capture(&mut self, pseudo: Instruction, at: usize) -> Result<UpvalueCell> {
        match OpCode::try_from(pseudo.opcode()) {
            Ok(OpCode::Move) => {
                let r = pseudo.b() as usize;
                let value = self.reg(r);
                Ok(self.captured.entry(r).or_insert_with(|| new_cell(value)).clone())
            }
            Ok(OpCode::GetUpval) => Ok(self.upvalue(pseudo.b() as usize)?.clone()),
            _ => Err(VmError::InvalidInstruction {
                pc: at,
                reason: "upvalue descriptor must be MOVE or GETUPVAL".into(),
            }),
        }
    }
}

/// Pop the frame that just returned and deliver its results
///
/// Returns the results once they leave the entry frame; `None` means a
/// caller took them and execution continues there.
fn unwind(stack: &mut Vec<Frame>, results: Vec<Value>) -> Option<Vec<Value>> {
    while let Some(done) = stack.pop() {
        match (done.resume, stack.last_mut()) {
            (Resume::Store { a, c }, Some(caller)) => {
                caller.store_results(a, c, results);
                return None;
            }
            (_, None) => return Some(results),
            (Resume::Forward, Some(_)) => {}
        }
    }
    Some(results)
}

/// Nil and NaN can never be table keys
fn check_key(key: &Value) -> Result<()> {
    match key {
        Value::Nil => Err(VmError::Runtime("table index is nil".into())),
        Value::Number(n) if n.is_nan() => Err(VmError::Runtime("table index is NaN".into())),
        _ => Ok(()),
    }
}

fn jump(pc: usize, offset: i32) -> Result<usize> {
    let target = pc as i64 + offset as i64;
    if target < 0 {
        return Err(VmError::InvalidInstruction { pc, reason: "jump before start of code".into() });
    }
    Ok(target as usize)
}

fn arith_error(v: &Value) -> VmError {
    VmError::TypeError(format!("attempt to perform arithmetic on a {} value", v.type_name()))
}

fn arith(op: OpCode, lhs: &Value, rhs: &Value) -> Result<f64> {
    let a = lhs.as_number().ok_or_else(|| arith_error(lhs))?;
    let b = rhs.as_number().ok_or_else(|| arith_error(rhs))?;
    Ok(match op {
        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        OpCode::Mod => a - (a / b).floor() * b,
        _ => a.powf(b),
    })
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| VmError::Runtime("attempt to compare NaN".into())),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(VmError::TypeError(format!(
            "attempt to compare {} with {}",
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}
