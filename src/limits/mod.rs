//! Limits, token buckets and limiters.

mod bucket;
mod limit;
mod limiter;
mod manifest;
mod registry;

pub use bucket::{
    TokenBucket, TokenBucketConfig, TOKEN_BUCKET_CAPACITY_SCALE,
    TOKEN_BUCKET_MANAGEMENT_TICK_INTERVAL,
};
pub use limit::{
    cpu_time_depletion, wall_clock_depletion, DepletionFn, Limit, LimitKind, LimitValue,
    EXECUTION_CPU_TIME_LIMIT_NAME, EXECUTION_TOTAL_LIMIT_NAME, MAX_LIMIT_VALUE,
    THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME,
};
pub use limiter::{DepletionState, Limiter, StateId};
pub use manifest::{LimitEntry, LimitsManifest};
pub use registry::{LimitRegistry, RegisteredLimit};
