//! Warden - Hierarchical Resource Governance
//!
//! This crate implements the token-bucket limiters that govern how much of a
//! resource (request rate, byte rate, simultaneous threads, CPU and wall-clock
//! time) a piece of sandboxed code may consume. Limiters of concurrently
//! running execution units share buckets, and execution contexts are
//! cancelled when a budget is exhausted.

pub mod config;
pub mod context;
pub mod error;
pub mod limits;

pub use context::{CancelReason, ContextConfig, ContextHandle, ExecutionContext};
pub use error::{catch_violation, ContextError, LimitError, Result, WardenError};
pub use limits::{Limit, LimitKind, LimitRegistry, LimitValue, Limiter, TokenBucket};
