//! Limit definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bucket::TOKEN_BUCKET_CAPACITY_SCALE;
use crate::error::{violation, LimitError};

/// Maximum number of simultaneously running threads/lthreads of a context.
pub const THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME: &str = "threads/simultaneous-instances";
/// Wall-clock execution budget, in nanoseconds.
pub const EXECUTION_TOTAL_LIMIT_NAME: &str = "execution/total-time";
/// CPU time budget, in nanoseconds.
pub const EXECUTION_CPU_TIME_LIMIT_NAME: &str = "execution/cpu-time";

/// Largest value a limit can hold once scaled by the bucket.
pub const MAX_LIMIT_VALUE: i64 = i64::MAX / TOKEN_BUCKET_CAPACITY_SCALE;

/// Computes how many (unscaled) tokens a bucket loses on a tick.
///
/// Arguments are the time elapsed since the previous tick and the number of
/// states currently depleting the bucket (always > 0 when called).
pub type DepletionFn = Arc<dyn Fn(Duration, i32) -> i64 + Send + Sync>;

/// The kind of resource axis a limit describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    /// Operations per second, refilling.
    #[serde(rename = "frequency")]
    FrequencyLimit,
    /// Bytes per second, refilling.
    #[serde(rename = "byte-rate")]
    ByteRateLimit,
    /// Non-refilling budget.
    #[serde(rename = "total")]
    TotalLimit,
}

impl LimitKind {
    pub fn is_refilling(&self) -> bool {
        !matches!(self, LimitKind::TotalLimit)
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitKind::FrequencyLimit => "frequency",
            LimitKind::ByteRateLimit => "byte-rate",
            LimitKind::TotalLimit => "total",
        };
        f.write_str(s)
    }
}

/// A limit for a running piece of code, for example the maximum rate of HTTP
/// requests. An execution context holds one token bucket per limit.
#[derive(Clone)]
pub struct Limit {
    pub name: String,
    pub kind: LimitKind,
    pub value: i64,
    /// Called on each tick of the associated bucket's ticker.
    pub depletion_fn: Option<DepletionFn>,
}

impl Limit {
    pub fn new(name: impl Into<String>, kind: LimitKind, value: i64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            depletion_fn: None,
        }
    }

    pub fn with_depletion_fn(mut self, f: DepletionFn) -> Self {
        self.depletion_fn = Some(f);
        self
    }

    /// Whether the bucket of this limit loses tokens over time on its own.
    pub fn is_auto_depleting(&self) -> bool {
        self.depletion_fn.is_some()
    }

    /// A total limit with a zero value is unbounded.
    pub fn is_unbounded_total(&self) -> bool {
        self.kind == LimitKind::TotalLimit && self.value == 0
    }

    /// Panics if `other` does not describe the same resource axis.
    #[track_caller]
    fn assert_comparable(&self, other: &Limit) {
        if self.name != other.name {
            violation(LimitError::NameMismatch {
                left: self.name.clone(),
                right: other.name.clone(),
            });
        }
        if self.kind != other.kind {
            violation(LimitError::KindMismatch {
                name: self.name.clone(),
                left: self.kind,
                right: other.kind,
            });
        }
    }

    #[track_caller]
    pub fn less_or_as_restrictive_as(&self, other: &Limit) -> bool {
        self.assert_comparable(other);
        self.value >= other.value
    }

    #[track_caller]
    pub fn more_restrictive_than(&self, other: &Limit) -> bool {
        self.assert_comparable(other);
        self.value < other.value
    }
}

impl fmt::Debug for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limit")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("auto_depleting", &self.is_auto_depleting())
            .finish()
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) = {}", self.name, self.kind, self.value)
    }
}

/// A typed value used to build a limit through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitValue {
    /// Operations per second.
    Frequency(i64),
    /// Bytes per second.
    ByteRate(i64),
    /// A plain count, e.g. simultaneous instances.
    Count(i64),
    /// A time budget, stored as nanoseconds.
    Duration(Duration),
}

impl LimitValue {
    pub fn kind(&self) -> LimitKind {
        match self {
            LimitValue::Frequency(_) => LimitKind::FrequencyLimit,
            LimitValue::ByteRate(_) => LimitKind::ByteRateLimit,
            LimitValue::Count(_) | LimitValue::Duration(_) => LimitKind::TotalLimit,
        }
    }

    pub fn raw(&self) -> i64 {
        match *self {
            LimitValue::Frequency(v) | LimitValue::ByteRate(v) | LimitValue::Count(v) => v,
            LimitValue::Duration(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        }
    }
}

/// Charges the wall-clock time elapsed since the last tick.
pub fn wall_clock_depletion() -> DepletionFn {
    Arc::new(|elapsed: Duration, _states: i32| {
        i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
    })
}

/// Charges the elapsed time once per depleting state, so two threads running
/// in parallel spend a CPU budget twice as fast.
pub fn cpu_time_depletion() -> DepletionFn {
    Arc::new(|elapsed: Duration, states: i32| {
        i64::try_from(elapsed.as_nanos())
            .unwrap_or(i64::MAX)
            .saturating_mul(i64::from(states))
    })
}
