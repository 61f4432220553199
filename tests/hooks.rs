//! Integration tests for function and metamethod hooks

mod common;

use common::{add_k, add_k_proto, caller_of, invoke, runtime};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use vmhook::{ExtError, Value};

#[test]
fn test_call_sites_follow_hook_and_restore() {
    let rt = runtime();
    let target = add_k(&rt, "target", 1.0);
    rt.vm().set_global("target", target.clone()).unwrap();
    let site = caller_of(&rt, "target", 1);

    let replacement = rt.vm().create_native("replacement", |_, args| {
        let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
        Ok(vec![Value::from(n * 100.0)])
    });

    assert_eq!(rt.call(&site, &[Value::from(2)]).unwrap(), vec![Value::from(3)]);

    let original = rt.hooks().install(&target, &replacement).unwrap().unwrap();
    assert_eq!(rt.call(&site, &[Value::from(2)]).unwrap(), vec![Value::from(200)]);
    assert_eq!(rt.call(&original, &[Value::from(2)]).unwrap(), vec![Value::from(3)]);

    assert!(rt.hooks().restore(&target).unwrap());
    assert_eq!(rt.call(&site, &[Value::from(2)]).unwrap(), vec![Value::from(3)]);
    // The original keeps working after restore
    assert_eq!(rt.call(&original, &[Value::from(2)]).unwrap(), vec![Value::from(3)]);
}

#[test]
fn test_hook_through_script_surface() {
    let rt = runtime();
    let target = add_k(&rt, "target", 1.0);
    let replacement = add_k(&rt, "replacement", 1000.0);

    let out = invoke(&rt, "install_hook", &[target.clone(), replacement]).unwrap();
    let original = out[0].clone();
    assert!(original.is_function());
    assert_eq!(rt.call(&target, &[Value::from(1)]).unwrap(), vec![Value::from(1001)]);

    let restored = invoke(&rt, "restore_hook", &[target.clone()]).unwrap();
    assert_eq!(restored, vec![Value::Boolean(true)]);
    let again = invoke(&rt, "restore_hook", &[target.clone()]).unwrap();
    assert_eq!(again, vec![Value::Boolean(false)]);
}

#[test]
fn test_native_target_resolves_to_nil() {
    let rt = runtime();
    let native = rt.global("get_identity").unwrap();
    let replacement = add_k(&rt, "replacement", 1.0);
    let out = invoke(&rt, "install_hook", &[native, replacement]).unwrap();
    assert_eq!(out, vec![Value::Nil]);
}

#[test]
fn test_reentrant_install_from_replacement() {
    let rt = runtime();
    let first = add_k(&rt, "first", 1.0);
    let second = add_k(&rt, "second", 2.0);
    let inner = rt.vm().create_native("inner", |_, _| Ok(vec![Value::from("inner")]));

    let weak = Arc::downgrade(&rt);
    let (second_c, inner_c) = (second.clone(), inner.clone());
    let outer = rt.vm().create_native("outer", move |_, _| {
        let rt = weak.upgrade().unwrap();
        rt.hooks().install(&second_c, &inner_c)?;
        Ok(vec![Value::from("outer")])
    });

    let result = rt.hooks().exclusive(|hooks| {
        hooks.install(&first, &outer).unwrap();
        rt.call(&first, &[])
    });

    assert_eq!(result.unwrap(), vec![Value::from("outer")]);
    assert!(rt.hooks().is_hooked(&first));
    assert!(rt.hooks().is_hooked(&second));
    assert_eq!(rt.call(&second, &[]).unwrap(), vec![Value::from("inner")]);
}

#[test]
fn test_metamethod_hook_routes_indexing() {
    let rt = runtime();
    let vm = rt.vm();
    let object = vm.new_table();
    let metatable = vm.new_table();
    let idx_fn = vm.create_native("idx_fn", |_, args| {
        Ok(vec![Value::from(format!("idx:{}", args.get(1).cloned().unwrap_or(Value::Nil)))])
    });
    vm.raw_set(metatable, Value::from("__index"), idx_fn).unwrap();
    vm.set_metatable(object, Some(metatable)).unwrap();
    vm.set_readonly(metatable, true).unwrap();

    let new_fn = vm.create_native("new_fn", |_, _| Ok(vec![Value::from("new")]));
    let object = Value::Table(object);
    let out = invoke(&rt, "install_metamethod_hook", &[object.clone(), Value::from("__index"), new_fn]).unwrap();
    let original = out[0].clone();

    assert_eq!(vm.index(&object, &Value::from("foo")).unwrap(), Value::from("new"));
    assert_eq!(
        rt.call(&original, &[object.clone(), Value::from("foo")]).unwrap(),
        vec![Value::from("idx:foo")]
    );
    assert!(vm.is_readonly(metatable).unwrap());
}

#[test]
fn test_metamethod_hook_without_metatable_raises() {
    let rt = runtime();
    let plain = Value::Table(rt.vm().new_table());
    let f = add_k(&rt, "f", 1.0);
    assert!(matches!(
        rt.hooks().install_metamethod(&plain, "__index", &f),
        Err(ExtError::Invariant(_))
    ));
}

#[test]
fn test_rehook_releases_previous_entry() {
    let rt = runtime();
    let target = add_k(&rt, "target", 1.0);
    let a = add_k(&rt, "a", 10.0);
    let b = add_k(&rt, "b", 20.0);
    let before = rt.refs().live_count();

    rt.hooks().install(&target, &a).unwrap();
    rt.hooks().install(&target, &b).unwrap();
    assert_eq!(rt.refs().live_count(), before + 3);
    assert_eq!(rt.call(&target, &[Value::from(0)]).unwrap(), vec![Value::from(20)]);

    rt.hooks().restore(&target).unwrap();
    assert_eq!(rt.refs().live_count(), before);
}

#[test]
fn test_concurrent_install_and_restore() {
    let rt = runtime();
    let shared = add_k(&rt, "shared", 1.0);
    let replacement = add_k(&rt, "replacement", 100.0);
    let own: Vec<Value> = (0..2).map(|i| add_k(&rt, "own", i as f64)).collect();
    let before = rt.refs().live_count();
    let barrier = Arc::new(Barrier::new(own.len()));

    let workers: Vec<_> = own
        .into_iter()
        .map(|mine| {
            let rt = rt.clone();
            let shared = shared.clone();
            let replacement = replacement.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    rt.hooks().install(&shared, &replacement).unwrap();
                    rt.hooks().install(&mine, &replacement).unwrap();
                    assert!(rt.hooks().is_hooked(&mine));
                    // shared plus at most one target per thread
                    assert!(rt.hooks().len() <= 3);
                    assert!(rt.hooks().restore(&mine).unwrap());
                    rt.hooks().restore(&shared).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(rt.hooks().is_empty());
    assert_eq!(rt.refs().live_count(), before);
    assert_eq!(rt.call(&shared, &[Value::from(1)]).unwrap(), vec![Value::from(2)]);
}

proptest! {
    #[test]
    fn prop_hook_then_restore(k in -1e6f64..1e6, r in -1e6f64..1e6, x in -1e6f64..1e6) {
        let rt = runtime();
        let f = rt.load(add_k_proto("f", k)).unwrap();
        let g = rt.load(add_k_proto("g", r)).unwrap();

        let original = rt.hooks().install(&f, &g).unwrap().unwrap();
        prop_assert_eq!(rt.call(&f, &[Value::from(x)]).unwrap(), vec![Value::from(x + r)]);
        prop_assert_eq!(rt.call(&original, &[Value::from(x)]).unwrap(), vec![Value::from(x + k)]);

        rt.hooks().restore(&f).unwrap();
        prop_assert_eq!(rt.call(&f, &[Value::from(x)]).unwrap(), vec![Value::from(x + k)]);
    }
}
