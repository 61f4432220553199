//! Integration tests for per-context identity levels

mod common;

use common::{add_k, invoke, runtime};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use vmhook::{ExtError, Value, VmError};

#[test]
fn test_contexts_never_observe_each_other() {
    let rt = runtime();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [1i64, 7]
        .into_iter()
        .map(|level| {
            let rt = rt.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                assert_eq!(rt.identity().get(), 2);
                rt.identity().set(level).unwrap();
                barrier.wait();
                // Both threads have written before either reads
                let seen = rt.identity().get();
                barrier.wait();
                seen
            })
        })
        .collect();

    let seen: Vec<u8> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(seen, vec![1, 7]);
    assert_eq!(rt.identity().get(), 2);
}

#[test]
fn test_surface_identity_round_trip() {
    let rt = runtime();
    assert_eq!(invoke(&rt, "get_identity", &[]).unwrap(), vec![Value::from(2)]);
    assert_eq!(invoke(&rt, "check_caller", &[]).unwrap(), vec![Value::Boolean(true)]);

    invoke(&rt, "set_identity", &[Value::from(1)]).unwrap();
    assert_eq!(invoke(&rt, "get_identity", &[]).unwrap(), vec![Value::from(1)]);
    assert_eq!(invoke(&rt, "check_caller", &[]).unwrap(), vec![Value::Boolean(false)]);
}

#[test]
fn test_surface_rejects_out_of_range() {
    let rt = runtime();
    match invoke(&rt, "set_identity", &[Value::from(9)]) {
        Err(ExtError::Vm(VmError::Runtime(msg))) => assert!(msg.contains("out of range"), "{}", msg),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(invoke(&rt, "set_identity", &[Value::from(2.5)]).is_err());
}

#[test]
fn test_low_identity_is_denied_mutators() {
    let rt = runtime();
    let f = add_k(&rt, "f", 1.0);
    let g = add_k(&rt, "g", 2.0);
    rt.identity().set(1).unwrap();

    match invoke(&rt, "install_hook", &[f.clone(), g]) {
        Err(ExtError::Vm(VmError::Runtime(msg))) => assert!(msg.contains("requires identity level 2"), "{}", msg),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!rt.hooks().is_hooked(&f));

    // Readers stay available
    assert_eq!(invoke(&rt, "get_constant", &[f, Value::from(1)]).unwrap(), vec![Value::from(1)]);
}

proptest! {
    #[test]
    fn prop_set_then_get(level in 0i64..=8) {
        let rt = runtime();
        rt.identity().set(level).unwrap();
        prop_assert_eq!(rt.identity().get() as i64, level);
    }

    #[test]
    fn prop_out_of_range_raises(level in prop_oneof![i64::MIN..0i64, 9i64..i64::MAX]) {
        let rt = runtime();
        let is_out_of_range = matches!(rt.identity().set(level), Err(ExtError::OutOfRange { .. }));
        prop_assert!(is_out_of_range);
        prop_assert_eq!(rt.identity().get(), 2);
    }
}
