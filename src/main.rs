//! vmhook - runtime self-check
//!
//! Builds a runtime from the configuration and exercises hooking, constant
//! rewriting and connections end to end.

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vmhook::config::{parse_cli_args, Config};
use vmhook::interp::value::rk;
use vmhook::interp::OpCode;
use vmhook::{logging, ExtError, ProtoBuilder, Result, Runtime, Value};

fn main() {
    let args = parse_cli_args();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Err(e) = config.apply_cli_args(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    logging::init(&config);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "self-check failed");
        process::exit(1);
    }
}

fn check(name: &str, ok: bool) -> Result<()> {
    if ok {
        tracing::info!(check = name, "ok");
        Ok(())
    } else {
        Err(ExtError::invariant(format!("check '{}' failed", name)))
    }
}

fn run(config: Config) -> Result<()> {
    let rt = Runtime::new(config)?;
    tracing::info!(runtime = %rt.id(), version = env!("CARGO_PKG_VERSION"), "starting self-check");

    // function scale(x) return x * 10 end
    let mut b = ProtoBuilder::new("scale").params(1).line(1);
    let k = b.constant(10.0);
    b.abc(OpCode::Mul, 1, 0, rk(k));
    b.ret(1, 1);
    let scale = rt.load(b.build())?;
    let arg = [Value::from(4)];

    check("call", rt.call(&scale, &arg)? == vec![Value::from(40)])?;

    let replacement = rt.vm().create_native("replacement", |_, _| Ok(vec![Value::from(-1)]));
    let original = rt
        .hooks()
        .install(&scale, &replacement)?
        .ok_or_else(|| ExtError::invariant("bytecode closure was not hookable"))?;
    check("hook redirects", rt.call(&scale, &arg)? == vec![Value::from(-1)])?;
    check("original keeps behaviour", rt.call(&original, &arg)? == vec![Value::from(40)])?;

    check("restore", rt.hooks().restore(&scale)?)?;
    check("restored behaviour", rt.call(&scale, &arg)? == vec![Value::from(40)])?;

    check("constant write", rt.reflect().set_constant(&scale, 1, Value::from(100))?)?;
    check("constant visible", rt.call(&scale, &arg)? == vec![Value::from(400)])?;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let callback = rt.vm().create_native("on_ping", move |_, args| {
        counter.fetch_add(args.len(), Ordering::SeqCst);
        Ok(vec![])
    });
    let index = rt.connections().register("Ping", &callback)?;
    rt.connections().fire(index, &[Value::from(1), Value::from(2)]);
    rt.connections().disable(index);
    rt.connections().fire(index, &[Value::from(3)]);
    check("connection fire", fired.load(Ordering::SeqCst) == 2)?;

    tracing::info!(stats = ?rt.vm().stats(), "self-check passed");
    Ok(())
}
