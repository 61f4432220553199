//! Per-context capability levels
//!
//! Each execution context (native thread) holds a level in `0..=8`. A context
//! only ever reads or writes its own entry.

use crate::config::MAX_IDENTITY;
use crate::error::{ExtError, Result};
use crate::interp::Vm;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::ThreadId;

/// Level at which `check_caller` reports a trusted caller
pub const TRUSTED_LEVEL: u8 = 2;

pub struct IdentityRegistry {
    levels: Mutex<HashMap<ThreadId, u8>>,
    default_level: u8,
}

impl IdentityRegistry {
    pub fn new(default_level: u8) -> Self {
        IdentityRegistry {
            levels: Mutex::new(HashMap::new()),
            default_level: default_level.min(MAX_IDENTITY),
        }
    }

    /// Level of the calling context, recording the default on first sight
    pub fn get(&self) -> u8 {
        *self
            .levels
            .lock()
            .entry(Vm::context_id())
            .or_insert(self.default_level)
    }

    /// Set the calling context's level
    pub fn set(&self, level: i64) -> Result<()> {
        if !(0..=MAX_IDENTITY as i64).contains(&level) {
            return Err(ExtError::OutOfRange {
                what: "identity level",
                value: level,
                min: 0,
                max: MAX_IDENTITY as i64,
            });
        }
        self.levels.lock().insert(Vm::context_id(), level as u8);
        tracing::debug!(level, "identity level changed");
        Ok(())
    }

    /// Whether the caller runs at the trusted level or above
    pub fn check_caller(&self) -> bool {
        self.get() >= TRUSTED_LEVEL
    }

    /// Fail with `Denied` unless the caller holds at least `required`
    pub fn require(&self, operation: &'static str, required: u8) -> Result<()> {
        let actual = self.get();
        if actual < required {
            return Err(ExtError::Denied { operation, required, actual });
        }
        Ok(())
    }

    /// Contexts observed so far
    pub fn len(&self) -> usize {
        self.levels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level() {
        let ids = IdentityRegistry::new(2);
        assert!(ids.is_empty());
        assert_eq!(ids.get(), 2);
        assert_eq!(ids.len(), 1);
        assert!(ids.check_caller());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let ids = IdentityRegistry::new(2);
        assert!(matches!(ids.set(9), Err(ExtError::OutOfRange { value: 9, .. })));
        assert!(matches!(ids.set(-1), Err(ExtError::OutOfRange { .. })));
        assert_eq!(ids.get(), 2);
    }

    #[test]
    fn test_require_gate() {
        let ids = IdentityRegistry::new(2);
        ids.set(1).unwrap();
        assert!(!ids.check_caller());
        assert!(matches!(
            ids.require("set_constant", 2),
            Err(ExtError::Denied { required: 2, actual: 1, .. })
        ));
        ids.set(8).unwrap();
        assert!(ids.require("set_constant", 2).is_ok());
    }
}
