//! Signal connections
//!
//! Connections live in an append-only list addressed by index. Disconnecting
//! releases the callback but never frees the slot, so indices held by
//! scripts stay valid.

use crate::error::{ExtError, Result};
use crate::ext::refs::{ReferenceRegistry, RetainedRef};
use crate::interp::{CallContext, Value, Vm};
use parking_lot::Mutex;
use std::sync::Arc;

struct Connection {
    signal: Arc<str>,
    /// `None` once disconnected
    callback: Option<RetainedRef>,
    enabled: bool,
}

/// Snapshot of one connection slot
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub index: usize,
    pub signal: Arc<str>,
    pub enabled: bool,
    pub connected: bool,
}

pub struct ConnectionRegistry {
    vm: Arc<Vm>,
    refs: Arc<ReferenceRegistry>,
    entries: Mutex<Vec<Connection>>,
}

impl ConnectionRegistry {
    pub fn new(vm: Arc<Vm>, refs: Arc<ReferenceRegistry>) -> Self {
        ConnectionRegistry {
            vm,
            refs,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Connect `callback` to `signal`; the connection starts enabled
    pub fn register(&self, signal: &str, callback: &Value) -> Result<usize> {
        if !callback.is_function() {
            return Err(ExtError::invalid_argument(format!(
                "connection callback must be a function, got {}",
                callback.type_name()
            )));
        }
        let retained = self.refs.retain(callback.clone())?;
        let mut entries = self.entries.lock();
        entries.push(Connection {
            signal: Arc::from(signal),
            callback: Some(retained),
            enabled: true,
        });
        let index = entries.len() - 1;
        tracing::debug!(signal, index, "connection registered");
        Ok(index)
    }

    /// Re-enable a connection; no-op once disconnected
    pub fn enable(&self, index: usize) -> bool {
        self.set_enabled(index, true)
    }

    pub fn disable(&self, index: usize) -> bool {
        self.set_enabled(index, false)
    }

    /// Invoke the callback if the connection is live and enabled
    ///
    /// Errors raised by the callback are logged and swallowed. Returns whether
    /// the callback ran.
    pub fn fire(&self, index: usize, args: &[Value]) -> bool {
        self.fire_with(index, |callback| self.vm.call(callback, args))
    }

    /// [`fire`](Self::fire) from inside a running call
    ///
    /// The callback runs nested in `ctx`, so it counts against the same call
    /// depth and instruction budget as the script that fired it.
    pub fn fire_in(&self, ctx: &mut CallContext<'_>, index: usize, args: &[Value]) -> bool {
        self.fire_with(index, |callback| ctx.call(callback, args.to_vec()))
    }

    fn fire_with<F>(&self, index: usize, call: F) -> bool
    where
        F: FnOnce(&Value) -> crate::interp::Result<Vec<Value>>,
    {
        let callback = {
            let entries = self.entries.lock();
            match entries.get(index) {
                Some(Connection { callback: Some(cb), enabled: true, .. }) => cb.get().clone(),
                _ => return false,
            }
        };
        if let Err(err) = call(&callback) {
            tracing::warn!(index, error = %err, "connection callback failed");
        }
        true
    }

    /// Release the callback and retire the slot
    pub fn disconnect(&self, index: usize) -> bool {
        let released = {
            let mut entries = self.entries.lock();
            match entries.get_mut(index) {
                Some(conn) => {
                    conn.enabled = false;
                    conn.callback.take()
                }
                None => None,
            }
        };
        let disconnected = released.is_some();
        if disconnected {
            tracing::debug!(index, "connection disconnected");
        }
        disconnected
    }

    /// Indices of the live connections on `signal`
    pub fn get_connections(&self, signal: &str) -> Vec<usize> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.callback.is_some() && &*c.signal == signal)
            .map(|(i, _)| i)
            .collect()
    }

    /// Fire every enabled connection on `signal`; returns how many ran
    pub fn fire_signal(&self, signal: &str, args: &[Value]) -> usize {
        self.get_connections(signal)
            .into_iter()
            .filter(|&i| self.fire(i, args))
            .count()
    }

    pub fn fire_signal_in(&self, ctx: &mut CallContext<'_>, signal: &str, args: &[Value]) -> usize {
        self.get_connections(signal)
            .into_iter()
            .filter(|&i| self.fire_in(ctx, i, args))
            .count()
    }

    pub fn info(&self, index: usize) -> Option<ConnectionInfo> {
        self.entries.lock().get(index).map(|c| ConnectionInfo {
            index,
            signal: c.signal.clone(),
            enabled: c.enabled,
            connected: c.callback.is_some(),
        })
    }

    /// Slots ever handed out, including disconnected ones
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_enabled(&self, index: usize, enabled: bool) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(index) {
            Some(conn) if conn.callback.is_some() => {
                conn.enabled = enabled;
                true
            }
            _ => false,
        }
    }
}
