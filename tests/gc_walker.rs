//! Integration tests for object enumeration and collection

mod common;

use common::{add_k, invoke, list, runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use vmhook::interp::value::rk;
use vmhook::interp::OpCode;
use vmhook::{ProtoBuilder, Runtime, Value};

fn spec_table(rt: &Runtime, fields: &[(&str, Value)]) -> Value {
    let t = rt.vm().new_table();
    for (k, v) in fields {
        rt.vm().raw_set(t, Value::from(*k), v.clone()).unwrap();
    }
    Value::Table(t)
}

#[test]
fn test_enumerate_objects_surface() {
    let rt = runtime();
    let f = add_k(&rt, "needle", 1.0);
    let t = Value::Table(rt.vm().new_table());

    let callables = invoke(&rt, "enumerate_objects", &[]).unwrap().remove(0);
    let callables = list(&rt, &callables);
    assert!(callables.contains(&f));
    assert!(!callables.contains(&t));

    let everything = invoke(&rt, "enumerate_objects", &[Value::Boolean(true)]).unwrap().remove(0);
    let everything = list(&rt, &everything);
    assert!(everything.contains(&f));
    assert!(everything.contains(&t));
}

#[test]
fn test_filter_objects_surface() {
    let rt = runtime();
    let needle = add_k(&rt, "needle", 1.0);
    add_k(&rt, "hay", 1.0);
    rt.vm().create_native("needle", |_, _| Ok(vec![]));

    let spec = spec_table(&rt, &[("name", Value::from("needle")), ("ignore_host", Value::Boolean(true))]);
    let found = invoke(&rt, "filter_objects", &[Value::from("function"), spec]).unwrap().remove(0);
    assert_eq!(list(&rt, &found), vec![needle]);

    let marked = rt.vm().new_table();
    rt.vm().raw_set(marked, Value::from("Marker"), Value::Boolean(true)).unwrap();
    let keys = rt.vm().new_table();
    rt.vm().raw_set(keys, Value::from(1), Value::from("Marker")).unwrap();
    let spec = spec_table(&rt, &[("keys", Value::Table(keys))]);
    let found = invoke(&rt, "filter_objects", &[Value::from("table"), spec]).unwrap().remove(0);
    assert_eq!(list(&rt, &found), vec![Value::Table(marked)]);

    assert!(invoke(&rt, "filter_objects", &[Value::from("thread")]).is_err());
}

#[test]
fn test_retained_values_survive_collection() {
    let rt = runtime();
    let kept = add_k(&rt, "kept", 1.0);
    let dropped = add_k(&rt, "dropped", 2.0);
    let guard = rt.refs().retain(kept.clone()).unwrap();

    let freed = rt.collect_garbage().unwrap();
    assert!(freed > 0);
    assert_eq!(rt.call(&kept, &[Value::from(1)]).unwrap(), vec![Value::from(2)]);
    assert!(rt.call(&dropped, &[Value::from(1)]).is_err());

    // Surface natives live in the root and survive
    assert!(rt.global("get_identity").unwrap().is_function());

    drop(guard);
    rt.collect_garbage().unwrap();
    assert!(rt.call(&kept, &[Value::from(1)]).is_err());
}

#[test]
fn test_collection_refused_during_call() {
    let rt = runtime();
    let weak: Weak<Runtime> = Arc::downgrade(&rt);
    let collect = rt.vm().create_native("collect", move |_, _| {
        let rt = weak.upgrade().unwrap();
        Ok(vec![Value::Boolean(rt.collect_garbage().is_none())])
    });
    assert_eq!(rt.call(&collect, &[]).unwrap(), vec![Value::Boolean(true)]);
}

#[test]
fn test_registry_lists_retained_values() {
    let rt = runtime();
    let t = Value::Table(rt.vm().new_table());
    let held = rt.refs().retain(t.clone()).unwrap();

    let registry = invoke(&rt, "get_registry", &[]).unwrap().remove(0);
    assert!(list(&rt, &registry).contains(&t));

    drop(held);
    let registry = invoke(&rt, "get_registry", &[]).unwrap().remove(0);
    assert!(!list(&rt, &registry).contains(&t));
}

#[test]
fn test_collection_concurrent_with_calls() {
    let rt = runtime();
    // local t = {}; t.x = 7; return t.x
    let mut b = ProtoBuilder::new("alloc");
    let x = b.constant("x");
    let seven = b.constant(7.0);
    b.abc(OpCode::NewTable, 0, 0, 0);
    b.abc(OpCode::SetTable, 0, rk(x), rk(seven));
    b.abc(OpCode::GetTable, 1, 0, rk(x));
    b.ret(1, 1);
    let f = rt.load(b.build()).unwrap();
    rt.vm().set_global("alloc", f.clone()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let collector = {
        let rt = rt.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut runs = 0usize;
            while !stop.load(Ordering::SeqCst) {
                if rt.collect_garbage().is_some() {
                    runs += 1;
                }
            }
            runs
        })
    };

    for _ in 0..2000 {
        assert_eq!(rt.call(&f, &[]).unwrap(), vec![Value::from(7)]);
    }
    stop.store(true, Ordering::SeqCst);
    collector.join().unwrap();

    // Every table the calls made is garbage now
    rt.collect_garbage().unwrap();
    assert_eq!(rt.call(&f, &[]).unwrap(), vec![Value::from(7)]);
}
