//! Heap management with generational arena architecture

use crate::interp::arena::{next_heap_id, Arena};
use crate::interp::error::{Result, VmError};
use crate::interp::proto::ProtoRef;
use crate::interp::value::{ClosureHandle, NativeHandle, TableHandle, UpvalueCell, Value};
use crate::interp::vm::NativeFn;
use std::collections::HashMap;
use std::sync::Arc;

/// Table object in heap
#[derive(Debug, Default)]
pub struct TableObject {
    /// Array part (contiguous integer keys starting at 1)
    pub array: Vec<Value>,

    /// Hash part (non-integer or sparse keys)
    pub map: HashMap<Value, Value>,

    /// Metatable (handle to another table)
    pub metatable: Option<TableHandle>,

    /// Writes through the VM raise while set
    pub readonly: bool,

    marked: bool,
}

impl TableObject {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key, ignoring metatables
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match key {
            Value::Number(n) if n.fract() == 0.0 && *n >= 1.0 && (*n as usize) <= self.array.len() => {
                self.array.get(*n as usize - 1).filter(|v| !v.is_nil())
            }
            _ => self.map.get(key),
        }
    }

    /// Get a string-keyed field
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.map.get(&Value::from(key))
    }

    /// Set a value by key, ignoring metatables and the readonly flag
    pub fn set(&mut self, key: Value, value: Value) {
        match key {
            Value::Number(n) if n.fract() == 0.0 && n >= 1.0 => {
                let index = n as usize - 1;

                // Append directly after the array part, otherwise stay sparse
                if index == self.array.len() && !value.is_nil() {
                    self.array.push(value);
                    self.migrate_from_map();
                } else if index < self.array.len() {
                    self.array[index] = value;
                    while matches!(self.array.last(), Some(Value::Nil)) {
                        self.array.pop();
                    }
                } else if value.is_nil() {
                    self.map.remove(&key);
                } else {
                    self.map.insert(key, value);
                }
            }
            _ => {
                if value.is_nil() {
                    self.map.remove(&key);
                } else {
                    self.map.insert(key, value);
                }
            }
        }
    }

    /// Pull now-contiguous integer keys out of the hash part
    fn migrate_from_map(&mut self) {
        loop {
            let next = Value::Number((self.array.len() + 1) as f64);
            match self.map.remove(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// Get the length of the table (# operator)
    pub fn len(&self) -> usize {
        self.array.len()
    }

    /// Check if table is empty
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.map.is_empty()
    }

    /// Snapshot of every key/value pair
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::from(i + 1), v.clone()))
            .chain(self.map.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// Closure object in heap
#[derive(Debug)]
pub struct ClosureObject {
    /// Shared prototype
    pub proto: ProtoRef,

    /// Captured variables
    pub upvalues: Box<[UpvalueCell]>,

    /// Table global reads and writes go through
    pub env: TableHandle,

    /// When set, calls reaching this closure run this value instead
    pub redirect: Option<Value>,

    marked: bool,
}

/// Host function object in heap
pub struct NativeObject {
    /// Name used in diagnostics and object filters
    pub name: Arc<str>,

    /// The host function
    pub func: NativeFn,

    /// Values the host function closes over; kept alive with it
    pub bound: Vec<Value>,

    marked: bool,
}

impl std::fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObject").field("name", &self.name).finish()
    }
}

/// Memory statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub tables: usize,
    pub closures: usize,
    pub natives: usize,
    pub retained: usize,
}

/// Core heap implementation
pub struct LuaHeap {
    id: u32,

    /// Arena for table objects
    pub tables: Arena<TableObject>,

    /// Arena for closure objects
    pub closures: Arena<ClosureObject>,

    /// Arena for host functions
    pub natives: Arena<NativeObject>,

    /// Values retained across host calls; GC roots
    pub refs: Arena<Value>,
}

impl LuaHeap {
    /// Create a new heap with a fresh id
    pub fn new() -> Self {
        let id = next_heap_id();
        LuaHeap {
            id,
            tables: Arena::new(id),
            closures: Arena::new(id),
            natives: Arena::new(id),
            refs: Arena::new(id),
        }
    }

    /// Id stamped into every handle this heap mints
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocate a new table
    pub fn alloc_table(&mut self) -> TableHandle {
        TableHandle(self.tables.insert(TableObject::new()))
    }

    pub fn get_table(&self, handle: TableHandle) -> Result<&TableObject> {
        Ok(self.tables.get(handle.0)?)
    }

    pub fn get_table_mut(&mut self, handle: TableHandle) -> Result<&mut TableObject> {
        Ok(self.tables.get_mut(handle.0)?)
    }

    /// Allocate a new closure
    pub fn alloc_closure(
        &mut self,
        proto: ProtoRef,
        upvalues: Vec<UpvalueCell>,
        env: TableHandle,
    ) -> ClosureHandle {
        ClosureHandle(self.closures.insert(ClosureObject {
            proto,
            upvalues: upvalues.into_boxed_slice(),
            env,
            redirect: None,
            marked: false,
        }))
    }

    pub fn get_closure(&self, handle: ClosureHandle) -> Result<&ClosureObject> {
        Ok(self.closures.get(handle.0)?)
    }

    pub fn get_closure_mut(&mut self, handle: ClosureHandle) -> Result<&mut ClosureObject> {
        Ok(self.closures.get_mut(handle.0)?)
    }

    /// Allocate a new host function
    pub fn alloc_native(&mut self, name: &str, func: NativeFn, bound: Vec<Value>) -> NativeHandle {
        NativeHandle(self.natives.insert(NativeObject {
            name: Arc::from(name),
            func,
            bound,
            marked: false,
        }))
    }

    pub fn get_native(&self, handle: NativeHandle) -> Result<&NativeObject> {
        Ok(self.natives.get(handle.0)?)
    }

    /// Reject handles minted by a different heap
    pub fn check_owner(&self, value: &Value) -> Result<()> {
        match value.handle() {
            Some(h) if h.heap != self.id => Err(VmError::ForeignHandle),
            _ => Ok(()),
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            tables: self.tables.len(),
            closures: self.closures.len(),
            natives: self.natives.len(),
            retained: self.refs.len(),
        }
    }

    /// Stop-the-world mark and sweep, returning how many objects were freed
    pub fn collect(&mut self, roots: &[Value]) -> usize {
        let mut gray: Vec<Value> = roots.to_vec();
        gray.extend(self.refs.iter().map(|(_, v)| v.clone()));

        while let Some(value) = gray.pop() {
            self.mark(value, &mut gray);
        }

        let mut freed = 0;
        freed += self.tables.retain(|t| t.marked);
        freed += self.closures.retain(|c| c.marked);
        freed += self.natives.retain(|n| n.marked);

        for (_, t) in self.tables.iter_mut() {
            t.marked = false;
        }
        for (_, c) in self.closures.iter_mut() {
            c.marked = false;
        }
        for (_, n) in self.natives.iter_mut() {
            n.marked = false;
        }
        freed
    }

    fn mark(&mut self, value: Value, gray: &mut Vec<Value>) {
        match value {
            Value::Table(h) => {
                if let Ok(table) = self.tables.get_mut(h.0) {
                    if table.marked {
                        return;
                    }
                    table.marked = true;
                    gray.extend(table.array.iter().cloned());
                    for (k, v) in &table.map {
                        gray.push(k.clone());
                        gray.push(v.clone());
                    }
                    if let Some(mt) = table.metatable {
                        gray.push(Value::Table(mt));
                    }
                }
            }
            Value::Closure(h) => {
                if let Ok(closure) = self.closures.get_mut(h.0) {
                    if closure.marked {
                        return;
                    }
                    closure.marked = true;
                    gray.push(Value::Table(closure.env));
                    gray.extend(closure.upvalues.iter().map(|cell| cell.lock().clone()));
                    if let Some(r) = &closure.redirect {
                        gray.push(r.clone());
                    }
                    push_proto_values(&closure.proto, gray);
                }
            }
            Value::Native(h) => {
                if let Ok(native) = self.natives.get_mut(h.0) {
                    if native.marked {
                        return;
                    }
                    native.marked = true;
                    gray.extend(native.bound.iter().cloned());
                }
            }
            _ => {}
        }
    }
}

fn push_proto_values(proto: &ProtoRef, gray: &mut Vec<Value>) {
    let proto = proto.read();
    gray.extend(proto.constants.iter().filter(|v| v.is_reference()).cloned());
    for nested in &proto.nested {
        push_proto_values(nested, gray);
    }
}

impl Default for LuaHeap {
    fn default() -> Self {
        Self::new()
    }
}
