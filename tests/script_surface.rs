//! Integration tests for table protection and the identity gate

mod common;

use common::{add_k, invoke, runtime};
use vmhook::interp::value::rk;
use vmhook::interp::OpCode;
use vmhook::{ExtError, ProtoBuilder, Runtime, Value, VmError};

/// function(t) t.x = 1 end
fn field_writer(rt: &Runtime) -> Value {
    let mut b = ProtoBuilder::new("write_x").params(1);
    let key = b.constant("x");
    let value = b.constant(1.0);
    b.abc(OpCode::SetTable, 0, rk(key), rk(value));
    rt.load(b.build()).unwrap()
}

#[test]
fn test_protected_table_rejects_writes() {
    let rt = runtime();
    let t = Value::Table(rt.vm().new_table());
    let write = field_writer(&rt);

    invoke(&rt, "set_protected", &[t.clone(), Value::Boolean(true)]).unwrap();
    assert_eq!(invoke(&rt, "is_protected", &[t.clone()]).unwrap(), vec![Value::Boolean(true)]);
    assert!(matches!(rt.call(&write, &[t.clone()]), Err(ExtError::Vm(VmError::ReadOnly))));

    invoke(&rt, "make_writeable", &[t.clone()]).unwrap();
    rt.call(&write, &[t.clone()]).unwrap();
    assert_eq!(rt.vm().index(&t, &Value::from("x")).unwrap(), Value::from(1));

    assert_eq!(invoke(&rt, "make_readonly", &[t.clone()]).unwrap(), vec![t.clone()]);
    assert_eq!(invoke(&rt, "is_protected", &[t]).unwrap(), vec![Value::Boolean(true)]);
}

#[test]
fn test_raw_metatable_access() {
    let rt = runtime();
    let t = Value::Table(rt.vm().new_table());
    let mt = Value::Table(rt.vm().new_table());

    assert_eq!(invoke(&rt, "get_raw_metatable", &[t.clone()]).unwrap(), vec![Value::Nil]);
    invoke(&rt, "set_raw_metatable", &[t.clone(), mt.clone()]).unwrap();
    assert_eq!(invoke(&rt, "get_raw_metatable", &[t.clone()]).unwrap(), vec![mt]);
    invoke(&rt, "set_raw_metatable", &[t.clone(), Value::Nil]).unwrap();
    assert_eq!(invoke(&rt, "get_raw_metatable", &[t.clone()]).unwrap(), vec![Value::Nil]);

    assert!(invoke(&rt, "set_raw_metatable", &[t, Value::from(3)]).is_err());
}

#[test]
fn test_protection_requires_tables() {
    let rt = runtime();
    match invoke(&rt, "is_protected", &[Value::from(1)]) {
        Err(ExtError::Vm(VmError::Runtime(msg))) => assert!(msg.contains("expects a table"), "{}", msg),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_mutators_are_gated() {
    let rt = runtime();
    let f = add_k(&rt, "f", 1.0);
    let t = Value::Table(rt.vm().new_table());
    rt.identity().set(0).unwrap();

    let calls: [(&str, Vec<Value>); 7] = [
        ("install_hook", vec![f.clone(), f.clone()]),
        ("install_metamethod_hook", vec![t.clone(), Value::from("__index"), f.clone()]),
        ("set_protected", vec![t.clone(), Value::Boolean(true)]),
        ("make_readonly", vec![t.clone()]),
        ("make_writeable", vec![t.clone()]),
        ("set_raw_metatable", vec![t.clone(), Value::Nil]),
        ("set_constant", vec![f.clone(), Value::from(1), Value::from(9)]),
    ];
    for (name, args) in calls {
        match invoke(&rt, name, &args) {
            Err(ExtError::Vm(VmError::Runtime(msg))) => {
                assert!(msg.contains("requires identity level"), "{}: {}", name, msg)
            }
            other => panic!("{} was not denied: {:?}", name, other),
        }
    }

    assert_eq!(rt.vm().is_readonly(t.as_table().unwrap()).unwrap(), false);
    assert_eq!(rt.call(&f, &[Value::from(1)]).unwrap(), vec![Value::from(2)]);

    // Restoring and reading stay open
    assert_eq!(invoke(&rt, "restore_hook", &[f.clone()]).unwrap(), vec![Value::Boolean(false)]);
    assert_eq!(invoke(&rt, "is_protected", &[t]).unwrap(), vec![Value::Boolean(false)]);
    assert_eq!(invoke(&rt, "check_caller", &[]).unwrap(), vec![Value::Boolean(false)]);
}
