//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use vmhook::interp::value::rk;
use vmhook::interp::{OpCode, ProtoRef};
use vmhook::{Config, ProtoBuilder, Runtime, Value};

pub fn runtime() -> Arc<Runtime> {
    Runtime::new(Config::default()).unwrap()
}

/// function(x) return x + k end
pub fn add_k_proto(name: &str, k: f64) -> ProtoRef {
    let mut b = ProtoBuilder::new(name).params(1);
    let c = b.constant(k);
    b.abc(OpCode::Add, 1, 0, rk(c));
    b.ret(1, 1);
    b.build()
}

pub fn add_k(rt: &Runtime, name: &str, k: f64) -> Value {
    rt.load(add_k_proto(name, k)).unwrap()
}

/// function(...) return G(...) end for a global `G`, with a fixed arity
pub fn caller_of(rt: &Runtime, global: &str, nargs: u8) -> Value {
    let mut b = ProtoBuilder::new("caller").params(nargs);
    b.get_global(nargs, global);
    for i in 0..nargs {
        b.abc(OpCode::Move, nargs + 1 + i, i as u16, 0);
    }
    b.abc(OpCode::Call, nargs, nargs as u16 + 1, 0);
    b.abc(OpCode::Return, nargs, 0, 0);
    rt.load(b.build()).unwrap()
}

/// Call the global `name` from bytecode running in the global environment
pub fn invoke(rt: &Runtime, name: &str, args: &[Value]) -> vmhook::Result<Vec<Value>> {
    let f = caller_of(rt, name, args.len() as u8);
    rt.call(&f, args)
}

/// Array part of a table returned by the script surface
pub fn list(rt: &Runtime, value: &Value) -> Vec<Value> {
    let t = value.as_table().expect("expected a table");
    rt.vm().heap().get_table(t).unwrap().array.clone()
}

pub fn field(rt: &Runtime, value: &Value, key: &str) -> Value {
    rt.vm().index(value, &Value::from(key)).unwrap()
}
