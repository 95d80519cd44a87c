//! Registry of limit names and their semantics.
//!
//! Every module using a given limit name must agree on its kind and minimum
//! value. The registry is an explicit value owned by the application root and
//! passed to whatever builds execution contexts, so several isolated runtimes
//! can coexist in one process.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::limit::{
    cpu_time_depletion, wall_clock_depletion, Limit, LimitKind, LimitValue,
    EXECUTION_CPU_TIME_LIMIT_NAME, EXECUTION_TOTAL_LIMIT_NAME, MAX_LIMIT_VALUE,
    THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME,
};
use crate::error::{violation, LimitError};

/// Kind and minimum registered for a limit name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredLimit {
    pub kind: LimitKind,
    pub minimum: i64,
}

/// Append-only table mapping limit names to their semantics.
#[derive(Debug)]
pub struct LimitRegistry {
    limits: RwLock<BTreeMap<String, RegisteredLimit>>,
}

impl LimitRegistry {
    /// Create an empty registry, without the built-in limits.
    pub fn empty() -> Self {
        Self {
            limits: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a registry holding the built-in limits.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_builtin_limits();
        registry
    }

    fn register_builtin_limits(&self) {
        self.register_limit(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, LimitKind::TotalLimit, 0);
        self.register_limit(EXECUTION_TOTAL_LIMIT_NAME, LimitKind::TotalLimit, 0);
        self.register_limit(EXECUTION_CPU_TIME_LIMIT_NAME, LimitKind::TotalLimit, 0);
    }

    /// Register a limit name.
    ///
    /// Registering the same name again with the same kind and minimum is a
    /// no-op; with different values it is a contract violation, two modules
    /// disagreeing on what a limit means must not run together.
    #[track_caller]
    pub fn register_limit(&self, name: &str, kind: LimitKind, minimum: i64) {
        let mut limits = self.limits.write();
        let existing = limits.get(name).copied();

        match existing {
            Some(existing) if existing.kind == kind && existing.minimum == minimum => {}
            Some(_) => {
                drop(limits);
                violation(LimitError::ConflictingRegistration(name.to_string()));
            }
            None => {
                debug!(limit = %name, %kind, minimum, "Registering limit");
                limits.insert(name.to_string(), RegisteredLimit { kind, minimum });
            }
        }
    }

    pub fn registered_limit_info(&self, name: &str) -> Option<RegisteredLimit> {
        self.limits.read().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.limits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.read().is_empty()
    }

    /// Call `f` for each registered limit in name order, stopping at the first
    /// error. `f` may use the registry.
    pub fn for_each_registered_limit<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str, RegisteredLimit) -> Result<(), E>,
    {
        let snapshot: Vec<(String, RegisteredLimit)> = self
            .limits
            .read()
            .iter()
            .map(|(name, info)| (name.clone(), *info))
            .collect();

        for (name, info) in snapshot {
            f(&name, info)?;
        }
        Ok(())
    }

    /// Remove every limit and register the built-in ones again.
    pub fn reset(&self) {
        self.limits.write().clear();
        self.register_builtin_limits();
    }

    #[track_caller]
    fn not_auto_depleting_info(&self, name: &str) -> RegisteredLimit {
        if name == EXECUTION_TOTAL_LIMIT_NAME || name == EXECUTION_CPU_TIME_LIMIT_NAME {
            violation(LimitError::AutoDepletingLimit(name.to_string()));
        }
        match self.registered_limit_info(name) {
            Some(info) => info,
            None => violation(LimitError::UnregisteredLimit(name.to_string())),
        }
    }

    /// Build a limit that does not deplete on its own, panicking if the name
    /// is unregistered, auto-depleting, or if `value` is below the registered
    /// minimum.
    #[track_caller]
    pub fn must_make_not_auto_depleting_count_limit(&self, name: &str, value: i64) -> Limit {
        let info = self.not_auto_depleting_info(name);
        if value < info.minimum {
            violation(LimitError::BelowMinimum {
                name: name.to_string(),
                value,
                minimum: info.minimum,
            });
        }
        Limit::new(name, info.kind, value)
    }

    /// Build a limit set to the registered minimum.
    #[track_caller]
    pub fn must_get_minimum_not_auto_depleting_count_limit(&self, name: &str) -> Limit {
        let info = self.not_auto_depleting_info(name);
        Limit::new(name, info.kind, info.minimum)
    }

    /// Check a limit against its registration.
    pub fn validate(&self, limit: &Limit) -> Result<(), LimitError> {
        let info = self
            .registered_limit_info(&limit.name)
            .ok_or_else(|| LimitError::UnregisteredLimit(limit.name.clone()))?;

        if limit.kind != info.kind {
            return Err(LimitError::WrongKind {
                name: limit.name.clone(),
                expected: info.kind,
            });
        }
        if limit.value < info.minimum {
            return Err(LimitError::BelowMinimum {
                name: limit.name.clone(),
                value: limit.value,
                minimum: info.minimum,
            });
        }
        if limit.value > MAX_LIMIT_VALUE {
            return Err(LimitError::AboveMaximum {
                name: limit.name.clone(),
                value: limit.value,
                maximum: MAX_LIMIT_VALUE,
            });
        }
        Ok(())
    }

    /// Build a validated limit from a typed value.
    ///
    /// The execution time limits get their depletion function attached here
    /// and must not be zero.
    pub fn make_limit(&self, name: &str, value: LimitValue) -> Result<Limit, LimitError> {
        let mut limit = Limit::new(name, value.kind(), value.raw());
        self.validate(&limit)?;

        match name {
            EXECUTION_TOTAL_LIMIT_NAME | EXECUTION_CPU_TIME_LIMIT_NAME if limit.value == 0 => {
                return Err(LimitError::ZeroExecutionBudget(name.to_string()));
            }
            EXECUTION_TOTAL_LIMIT_NAME => limit.depletion_fn = Some(wall_clock_depletion()),
            EXECUTION_CPU_TIME_LIMIT_NAME => limit.depletion_fn = Some(cpu_time_depletion()),
            _ => {}
        }

        Ok(limit)
    }
}

impl Default for LimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}
