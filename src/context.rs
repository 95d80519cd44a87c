//! Execution contexts.
//!
//! An [`ExecutionContext`] owns one limiter per limit of a running module and
//! is the surface through which governed operations consume tokens. Contexts
//! form a tree: a child context shares the buckets of its parent for the
//! limits they have in common, and is done as soon as any ancestor is.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{violation, ContextError, LimitError};
use crate::limits::{
    DepletionState, Limit, LimitKind, LimitRegistry, Limiter, StateId, TokenBucketConfig,
    EXECUTION_CPU_TIME_LIMIT_NAME, TOKEN_BUCKET_MANAGEMENT_TICK_INTERVAL,
};

/// Longest time a sleeping state goes without checking whether an ancestor
/// context was cancelled.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a context is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A total budget went negative.
    LimitExhausted(String),
    /// Explicit cancellation.
    Requested,
    /// The context was dropped.
    Completed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::LimitExhausted(name) => write!(f, "limit '{}' exhausted", name),
            CancelReason::Requested => f.write_str("cancelled"),
            CancelReason::Completed => f.write_str("completed"),
        }
    }
}

/// Cancellation side of a context, cheap to clone.
///
/// Buckets hold a handle rather than the context itself so that a bucket can
/// cancel the context owning it without keeping it alive.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    wakeup: Condvar,
    parent: Option<ContextHandle>,
}

impl ContextHandle {
    pub fn new(parent: Option<ContextHandle>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                wakeup: Condvar::new(),
                parent,
            }),
        }
    }

    /// Cancel the context. Returns false if it was already cancelled, in
    /// which case the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut slot = self.inner.reason.lock();
        if slot.is_some() {
            return false;
        }
        debug!(%reason, "Context cancelled");
        *slot = Some(reason);
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.wakeup.notify_all();
        true
    }

    /// Whether this context or one of its ancestors is cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancelled())
    }

    /// Reason of this context's cancellation, or of the closest cancelled
    /// ancestor's.
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.inner.reason.lock().clone() {
            return Some(reason);
        }
        self.inner.parent.as_ref().and_then(|parent| parent.reason())
    }

    /// Sleep for `duration` unless the context is cancelled first. Returns
    /// true if the whole duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.reason.lock();

        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let slice = (deadline - now).min(CANCELLATION_POLL_INTERVAL);
            self.inner.wakeup.wait_for(&mut guard, slice);
        }
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("cancelled", &self.is_cancelled())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

/// Configuration of a new [`ExecutionContext`].
pub struct ContextConfig<'a> {
    pub limits: Vec<Limit>,
    pub parent: Option<&'a ExecutionContext>,
    /// Initial token counts, for example a snapshot taken with
    /// [`ExecutionContext::limit_tokens`]. Only allowed for root contexts.
    pub limit_tokens: Option<HashMap<String, i64>>,
    pub tick_interval: Duration,
}

impl Default for ContextConfig<'_> {
    fn default() -> Self {
        Self {
            limits: Vec::new(),
            parent: None,
            limit_tokens: None,
            tick_interval: TOKEN_BUCKET_MANAGEMENT_TICK_INTERVAL,
        }
    }
}

/// Owns the limiters of one running module.
pub struct ExecutionContext {
    id: Uuid,
    handle: ContextHandle,
    limiters: BTreeMap<String, Limiter>,
    state_id: Option<StateId>,
}

impl ExecutionContext {
    /// Create a context.
    ///
    /// Every limit is validated against `registry`. A limit the parent
    /// context also has gets a child of the parent's limiter, provided the
    /// parent is less or as restrictive; the parent's other limits are
    /// inherited the same way.
    pub fn new(registry: &LimitRegistry, config: ContextConfig<'_>) -> Result<Self, ContextError> {
        for limit in &config.limits {
            registry.validate(limit)?;
        }

        if let Some(parent) = config.parent {
            if config.limit_tokens.is_some() {
                return Err(ContextError::TokensForChildContext);
            }
            for limit in &config.limits {
                if let Some(parent_limiter) = parent.limiters.get(&limit.name) {
                    if !parent_limiter.limit().less_or_as_restrictive_as(limit) {
                        return Err(ContextError::ParentMoreRestrictive(limit.name.clone()));
                    }
                }
            }
        }

        let mut limiters = BTreeMap::new();

        for limit in config.limits {
            if limiters.contains_key(&limit.name) {
                return Err(ContextError::DuplicateLimit(limit.name));
            }

            if let Some(parent_limiter) = config.parent.and_then(|p| p.limiters.get(&limit.name)) {
                limiters.insert(limit.name.clone(), parent_limiter.child());
                continue;
            }

            let fill_rate = match limit.kind {
                LimitKind::FrequencyLimit | LimitKind::ByteRateLimit => limit.value,
                LimitKind::TotalLimit => 0,
            };
            let initial_avail = config
                .limit_tokens
                .as_ref()
                .and_then(|tokens| tokens.get(&limit.name).copied());

            let bucket_config = TokenBucketConfig {
                name: limit.name.clone(),
                cap: limit.value,
                initial_avail,
                fill_rate,
                deplete_fn: limit.depletion_fn.clone(),
                cancel_context_on_negative_count: limit.kind == LimitKind::TotalLimit
                    && limit.value != 0,
                tick_interval: config.tick_interval,
            };
            limiters.insert(limit.name.clone(), Limiter::new(limit, bucket_config)?);
        }

        if let Some(parent) = config.parent {
            for (name, parent_limiter) in &parent.limiters {
                if !limiters.contains_key(name) {
                    limiters.insert(name.clone(), parent_limiter.child());
                }
            }
        }

        let handle = ContextHandle::new(config.parent.map(|p| p.handle.clone()));
        for limiter in limiters.values() {
            limiter.set_context_if_not_child(handle.clone());
        }

        let ctx = Self {
            id: Uuid::new_v4(),
            handle,
            limiters,
            state_id: None,
        };

        info!(
            context = %ctx.id,
            parent = ?config.parent.map(|p| p.id),
            limits = ctx.limiters.len(),
            "Execution context created"
        );

        Ok(ctx)
    }

    /// Create a child context, see [`ExecutionContext::new`].
    pub fn child(
        &self,
        registry: &LimitRegistry,
        limits: Vec<Limit>,
    ) -> Result<ExecutionContext, ContextError> {
        Self::new(
            registry,
            ContextConfig {
                limits,
                parent: Some(self),
                ..Default::default()
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    pub fn state_id(&self) -> Option<StateId> {
        self.state_id
    }

    /// Mark the start of the execution of the state owning this context.
    /// Auto-depleting limits start being charged from here.
    #[track_caller]
    pub fn begin_execution(&mut self) -> StateId {
        if self.state_id.is_some() {
            violation(LimitError::StateIdAlreadySet);
        }
        let id = StateId::next();
        self.state_id = Some(id);

        for limiter in self.limiters.values_mut() {
            limiter.set_state_once(id);
        }
        debug!(context = %self.id, state = %id, "Execution started");
        id
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.handle.reason()
    }

    /// Cancel this context and its descendants.
    pub fn cancel(&self) {
        self.handle.cancel(CancelReason::Requested);
    }

    fn done_error(&self) -> ContextError {
        let reason = self.cancel_reason().unwrap_or(CancelReason::Requested);
        ContextError::Done(reason.to_string())
    }

    fn ensure_not_done(&self) -> Result<(), ContextError> {
        if self.is_done() {
            return Err(self.done_error());
        }
        Ok(())
    }

    #[track_caller]
    fn must_get_limiter(&self, name: &str) -> &Limiter {
        match self.limiters.get(name) {
            Some(limiter) => limiter,
            None => violation(LimitError::LimitNotPresentInContext(name.to_string())),
        }
    }

    fn limiter_mut(&mut self, name: &str) -> Result<&mut Limiter, ContextError> {
        self.limiters
            .get_mut(name)
            .ok_or_else(|| ContextError::UnknownLimit(name.to_string()))
    }

    fn map_wait_error(&self, err: LimitError) -> ContextError {
        match err {
            LimitError::ContextCancelled => self.done_error(),
            other => ContextError::Limit(other),
        }
    }

    /// Take `count` tokens from the bucket of the limit `name`.
    ///
    /// Blocking on a refilling bucket is not charged as CPU time. Using a
    /// limit the context does not have is a contract violation.
    #[track_caller]
    pub fn take(&mut self, name: &str, count: i64) -> Result<(), ContextError> {
        self.ensure_not_done()?;

        let limiter = self.must_get_limiter(name);
        if !limiter.limit().kind.is_refilling() {
            return limiter.take(count).map_err(|e| self.map_wait_error(e));
        }
        if limiter.try_take(count) {
            return Ok(());
        }

        trace!(context = %self.id, limit = %name, count, "Waiting for tokens");
        let paused = self.pause_cpu_time_if_depleting();
        let result = self
            .must_get_limiter(name)
            .take_cancellable(count, &self.handle);
        if paused {
            self.resume_cpu_time_depletion()?;
        }
        result.map_err(|e| self.map_wait_error(e))
    }

    /// Async counterpart of [`take`](Self::take).
    pub async fn take_async(&mut self, name: &str, count: i64) -> Result<(), ContextError> {
        self.ensure_not_done()?;

        let limiter = self.must_get_limiter(name);
        if !limiter.limit().kind.is_refilling() {
            return limiter.take(count).map_err(|e| self.map_wait_error(e));
        }
        if limiter.try_take(count) {
            return Ok(());
        }

        let paused = self.pause_cpu_time_if_depleting();
        let result = self
            .must_get_limiter(name)
            .take_async_cancellable(count, &self.handle)
            .await;
        if paused {
            self.resume_cpu_time_depletion()?;
        }
        result.map_err(|e| self.map_wait_error(e))
    }

    #[track_caller]
    pub fn give_back(&self, name: &str, count: i64) -> Result<(), ContextError> {
        self.ensure_not_done()?;
        self.must_get_limiter(name).give_back(count);
        Ok(())
    }

    pub fn available(&self, name: &str) -> Result<i64, ContextError> {
        self.limiters
            .get(name)
            .map(Limiter::available)
            .ok_or_else(|| ContextError::UnknownLimit(name.to_string()))
    }

    /// Remaining tokens of a total limit.
    pub fn total(&self, name: &str) -> Result<i64, ContextError> {
        self.ensure_not_done()?;
        let limiter = self
            .limiters
            .get(name)
            .ok_or_else(|| ContextError::UnknownLimit(name.to_string()))?;
        Ok(limiter.total()?)
    }

    /// Value of a byte rate limit, in bytes per second.
    pub fn byte_rate(&self, name: &str) -> Result<i64, ContextError> {
        self.ensure_not_done()?;
        let limiter = self
            .limiters
            .get(name)
            .ok_or_else(|| ContextError::UnknownLimit(name.to_string()))?;
        if limiter.limit().kind != LimitKind::ByteRateLimit {
            return Err(ContextError::NotARate(name.to_string()));
        }
        Ok(limiter.limit().value)
    }

    /// Limits of the context, inherited ones included, in name order.
    pub fn limits(&self) -> Vec<Limit> {
        self.limiters.values().map(|l| l.limit().clone()).collect()
    }

    /// Tokens currently available for each limit.
    pub fn limit_tokens(&self) -> HashMap<String, i64> {
        self.limiters
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.available()))
            .collect()
    }

    pub fn depletion_state(&self, name: &str) -> Result<DepletionState, ContextError> {
        self.limiters
            .get(name)
            .map(Limiter::depletion_state)
            .ok_or_else(|| ContextError::UnknownLimit(name.to_string()))
    }

    pub fn pause_token_depletion(&mut self, name: &str) -> Result<(), ContextError> {
        self.limiter_mut(name)?.pause_depletion();
        Ok(())
    }

    pub fn resume_depletion(&mut self, name: &str) -> Result<(), ContextError> {
        self.limiter_mut(name)?.resume_depletion();
        Ok(())
    }

    pub fn definitely_stop_token_depletion(&mut self, name: &str) -> Result<(), ContextError> {
        self.limiter_mut(name)?.definitely_stop_depletion();
        Ok(())
    }

    pub fn pause_cpu_time_depletion(&mut self) -> Result<(), ContextError> {
        self.pause_token_depletion(EXECUTION_CPU_TIME_LIMIT_NAME)
    }

    pub fn pause_cpu_time_depletion_if_not_paused(&mut self) -> Result<(), ContextError> {
        self.limiter_mut(EXECUTION_CPU_TIME_LIMIT_NAME)?
            .pause_depletion_if_not_paused();
        Ok(())
    }

    pub fn resume_cpu_time_depletion(&mut self) -> Result<(), ContextError> {
        self.resume_depletion(EXECUTION_CPU_TIME_LIMIT_NAME)
    }

    pub fn definitely_stop_cpu_time_depletion(&mut self) -> Result<(), ContextError> {
        self.definitely_stop_token_depletion(EXECUTION_CPU_TIME_LIMIT_NAME)
    }

    /// Pause CPU time depletion if it is running. Returns whether it was
    /// paused by this call.
    fn pause_cpu_time_if_depleting(&mut self) -> bool {
        match self.limiters.get_mut(EXECUTION_CPU_TIME_LIMIT_NAME) {
            Some(limiter) if limiter.depletion_state() == DepletionState::Active => {
                limiter.pause_depletion();
                true
            }
            _ => false,
        }
    }

    /// Run `f` without charging CPU time, for operations waiting on I/O.
    pub fn do_io<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let paused = self.pause_cpu_time_if_depleting();
        let value = f();
        if paused {
            // the limiter exists since it was just paused
            let _ = self.resume_cpu_time_depletion();
        }
        value
    }

    /// Sleep for `duration` without charging CPU time. Returns early with an
    /// error if the context is cancelled.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), ContextError> {
        let handle = self.handle.clone();
        let completed = self.do_io(|| handle.sleep(duration));
        if !completed {
            return Err(self.done_error());
        }
        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.handle.cancel(CancelReason::Completed);
        trace!(context = %self.id, "Execution context dropped");
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("state_id", &self.state_id)
            .field("limiters", &self.limiters)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::catch_violation;
    use crate::limits::{LimitValue, THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME};
    use std::thread;

    const OBJECT_STORAGE_REQUEST: &str = "object-storage/request";
    const NEW_FILES: &str = "fs/total-new-file";
    const READ_RATE: &str = "fs/read";

    fn registry() -> LimitRegistry {
        let registry = LimitRegistry::new();
        registry.register_limit(OBJECT_STORAGE_REQUEST, LimitKind::FrequencyLimit, 0);
        registry.register_limit(NEW_FILES, LimitKind::TotalLimit, 0);
        registry.register_limit(READ_RATE, LimitKind::ByteRateLimit, 0);
        registry
    }

    fn context(registry: &LimitRegistry, limits: Vec<Limit>) -> ExecutionContext {
        ExecutionContext::new(
            registry,
            ContextConfig {
                limits,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn cpu_limit(registry: &LimitRegistry, budget: Duration) -> Limit {
        registry
            .make_limit(EXECUTION_CPU_TIME_LIMIT_NAME, LimitValue::Duration(budget))
            .unwrap()
    }

    #[test]
    fn test_handle_cancellation_is_hierarchical() {
        let parent = ContextHandle::new(None);
        let child = ContextHandle::new(Some(parent.clone()));

        assert!(child.cancel(CancelReason::Requested));
        assert!(!child.cancel(CancelReason::Completed));
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(child.reason(), Some(CancelReason::Requested));

        let parent = ContextHandle::new(None);
        let child = ContextHandle::new(Some(parent.clone()));
        parent.cancel(CancelReason::LimitExhausted("x".to_string()));
        assert!(child.is_cancelled());
        assert_eq!(
            child.reason(),
            Some(CancelReason::LimitExhausted("x".to_string()))
        );
    }

    #[test]
    fn test_handle_sleep_interrupted() {
        let handle = ContextHandle::new(None);
        assert!(handle.sleep(Duration::from_millis(5)));

        let canceller = handle.clone();
        let start = Instant::now();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel(CancelReason::Requested);
        });

        assert!(!handle.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        t.join().unwrap();
    }

    #[test]
    fn test_object_storage_request_rate() {
        let registry = registry();
        let limit = registry
            .make_limit(OBJECT_STORAGE_REQUEST, LimitValue::Frequency(1))
            .unwrap();
        let mut ctx = context(&registry, vec![limit]);
        ctx.begin_execution();

        let start = Instant::now();
        ctx.take(OBJECT_STORAGE_REQUEST, 1).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));

        ctx.take(OBJECT_STORAGE_REQUEST, 1).unwrap();
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(900) && elapsed <= Duration::from_millis(1100),
            "second request took {:?}",
            elapsed
        );
    }

    #[test]
    fn test_cpu_time_limit_cancels_busy_context() {
        let registry = registry();
        let mut ctx = context(&registry, vec![cpu_limit(&registry, Duration::from_millis(50))]);
        ctx.begin_execution();

        let start = Instant::now();
        while !ctx.is_done() && start.elapsed() < Duration::from_secs(3) {
            std::hint::spin_loop();
        }

        assert!(ctx.is_done());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(
            ctx.cancel_reason(),
            Some(CancelReason::LimitExhausted(
                EXECUTION_CPU_TIME_LIMIT_NAME.to_string()
            ))
        );
        assert!(matches!(
            ctx.take(EXECUTION_CPU_TIME_LIMIT_NAME, 1),
            Err(ContextError::Done(_))
        ));
    }

    #[test]
    fn test_sleep_does_not_consume_cpu_time() {
        let registry = registry();
        let budget = Duration::from_millis(200);
        let mut ctx = context(&registry, vec![cpu_limit(&registry, budget)]);
        ctx.begin_execution();

        ctx.sleep(Duration::from_millis(300)).unwrap();

        assert!(!ctx.is_done());
        let remaining = ctx.available(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap();
        assert!(
            remaining > Duration::from_millis(150).as_nanos() as i64,
            "remaining cpu time: {}ns",
            remaining
        );
        assert_eq!(
            ctx.depletion_state(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap(),
            DepletionState::Active
        );
    }

    #[test]
    fn test_two_states_deplete_cpu_time_twice_as_fast() {
        let registry = registry();
        let budget = Duration::from_secs(10);
        let mut parent = context(&registry, vec![cpu_limit(&registry, budget)]);
        parent.begin_execution();
        let mut child = parent.child(&registry, vec![]).unwrap();
        child.begin_execution();

        let before = parent.available(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap();
        thread::sleep(Duration::from_millis(100));
        let spent = before - parent.available(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap();

        let spent = Duration::from_nanos(spent as u64);
        assert!(
            spent >= Duration::from_millis(170) && spent <= Duration::from_millis(400),
            "spent {:?}",
            spent
        );
    }

    #[test]
    fn test_do_io_pauses_cpu_time() {
        let registry = registry();
        let mut ctx = context(&registry, vec![cpu_limit(&registry, Duration::from_secs(1))]);
        ctx.begin_execution();

        let observed = ctx.do_io(|| 42);
        assert_eq!(observed, 42);
        assert_eq!(
            ctx.depletion_state(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap(),
            DepletionState::Active
        );

        ctx.pause_cpu_time_depletion().unwrap();
        ctx.pause_cpu_time_depletion_if_not_paused().unwrap();
        ctx.do_io(|| ());
        assert_eq!(
            ctx.depletion_state(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap(),
            DepletionState::Paused,
            "do_io does not resume a depletion it did not pause"
        );
        ctx.resume_cpu_time_depletion().unwrap();
        ctx.definitely_stop_cpu_time_depletion().unwrap();
        assert_eq!(
            ctx.depletion_state(EXECUTION_CPU_TIME_LIMIT_NAME).unwrap(),
            DepletionState::Stopped
        );
    }

    #[test]
    fn test_thread_count_limit() {
        let registry = registry();
        let limit = registry
            .make_limit(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, LimitValue::Count(2))
            .unwrap();
        let mut ctx = context(&registry, vec![limit]);
        ctx.begin_execution();

        ctx.take(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, 1).unwrap();
        ctx.take(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, 1).unwrap();
        assert_eq!(ctx.total(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME).unwrap(), 0);

        let result = catch_violation(|| ctx.take(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, 1));
        assert!(matches!(
            result,
            Err(LimitError::InsufficientTokens { count: 1, available: 0, .. })
        ));

        ctx.give_back(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, 1).unwrap();
        ctx.take(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, 1).unwrap();
        assert!(!ctx.is_done());
    }

    #[test]
    fn test_child_take_is_visible_in_parent() {
        let registry = registry();
        let parent = context(&registry, vec![Limit::new(NEW_FILES, LimitKind::TotalLimit, 10)]);
        let mut child = parent.child(&registry, vec![]).unwrap();

        child.take(NEW_FILES, 3).unwrap();
        assert_eq!(parent.available(NEW_FILES).unwrap(), 7);
        assert_eq!(child.available(NEW_FILES).unwrap(), 7);
        assert_eq!(child.limits().len(), 1);
    }

    #[test]
    fn test_cancelling_child_interrupts_its_wait() {
        let registry = registry();
        let parent = context(
            &registry,
            vec![Limit::new(OBJECT_STORAGE_REQUEST, LimitKind::FrequencyLimit, 1)],
        );
        let mut child = parent.child(&registry, vec![]).unwrap();
        child.take(OBJECT_STORAGE_REQUEST, 1).unwrap();

        let canceller = {
            let handle = child.handle().clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                handle.cancel(CancelReason::Requested);
            })
        };

        let start = Instant::now();
        assert!(matches!(
            child.take(OBJECT_STORAGE_REQUEST, 1),
            Err(ContextError::Done(_))
        ));
        assert!(start.elapsed() < Duration::from_millis(500));
        canceller.join().unwrap();

        assert!(!parent.is_done());
        assert_eq!(parent.available(OBJECT_STORAGE_REQUEST).unwrap(), 0);
        thread::sleep(Duration::from_millis(1100));
        assert_eq!(
            parent.available(OBJECT_STORAGE_REQUEST).unwrap(),
            1,
            "the interrupted take consumed nothing"
        );
    }

    #[test]
    fn test_cancelling_parent_cancels_child() {
        let registry = registry();
        let parent = context(&registry, vec![]);
        let child = parent.child(&registry, vec![]).unwrap();

        parent.cancel();
        assert!(child.is_done());
        assert!(matches!(child.give_back(NEW_FILES, 1), Err(ContextError::Done(_))));

        let parent = context(&registry, vec![]);
        let handle = parent.child(&registry, vec![]).unwrap().handle().clone();
        assert!(handle.is_cancelled(), "dropping a context cancels it");
        assert_eq!(handle.reason(), Some(CancelReason::Completed));
        assert!(!parent.is_done());
    }

    #[test]
    fn test_parent_more_restrictive() {
        let registry = registry();
        let parent = context(
            &registry,
            vec![Limit::new(OBJECT_STORAGE_REQUEST, LimitKind::FrequencyLimit, 5)],
        );

        let err = parent
            .child(
                &registry,
                vec![Limit::new(OBJECT_STORAGE_REQUEST, LimitKind::FrequencyLimit, 10)],
            )
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::ParentMoreRestrictive(OBJECT_STORAGE_REQUEST.to_string())
        );

        let child = parent
            .child(
                &registry,
                vec![Limit::new(OBJECT_STORAGE_REQUEST, LimitKind::FrequencyLimit, 3)],
            )
            .unwrap();
        child.give_back(OBJECT_STORAGE_REQUEST, 0).unwrap();
    }

    #[test]
    fn test_invalid_context_configs() {
        let registry = registry();
        let limit = Limit::new(NEW_FILES, LimitKind::TotalLimit, 10);

        let err = ExecutionContext::new(
            &registry,
            ContextConfig {
                limits: vec![limit.clone(), limit.clone()],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, ContextError::DuplicateLimit(NEW_FILES.to_string()));

        let parent = context(&registry, vec![]);
        let err = ExecutionContext::new(
            &registry,
            ContextConfig {
                parent: Some(&parent),
                limit_tokens: Some(HashMap::new()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, ContextError::TokensForChildContext);

        let err = ExecutionContext::new(
            &registry,
            ContextConfig {
                limits: vec![Limit::new(NEW_FILES, LimitKind::FrequencyLimit, 10)],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::Limit(LimitError::WrongKind { .. })));
    }

    #[test]
    fn test_limit_tokens_seed_new_context() {
        let registry = registry();
        let limits = vec![Limit::new(NEW_FILES, LimitKind::TotalLimit, 10)];
        let mut ctx = context(&registry, limits.clone());
        ctx.take(NEW_FILES, 4).unwrap();

        let tokens = ctx.limit_tokens();
        assert_eq!(tokens.get(NEW_FILES), Some(&6));

        let replacement = ExecutionContext::new(
            &registry,
            ContextConfig {
                limits,
                limit_tokens: Some(tokens),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(replacement.available(NEW_FILES).unwrap(), 6);
    }

    #[test]
    fn test_limit_lookups() {
        let registry = registry();
        let ctx = context(
            &registry,
            vec![
                Limit::new(READ_RATE, LimitKind::ByteRateLimit, 1_000),
                Limit::new(NEW_FILES, LimitKind::TotalLimit, 10),
            ],
        );

        assert_eq!(ctx.byte_rate(READ_RATE).unwrap(), 1_000);
        assert_eq!(
            ctx.byte_rate(NEW_FILES).unwrap_err(),
            ContextError::NotARate(NEW_FILES.to_string())
        );
        assert!(matches!(
            ctx.total(READ_RATE),
            Err(ContextError::Limit(LimitError::NotATotalLimit(_)))
        ));
        assert_eq!(
            ctx.available("unknown").unwrap_err(),
            ContextError::UnknownLimit("unknown".to_string())
        );
        assert_eq!(
            catch_violation(|| ctx.give_back("unknown", 1)),
            Err(LimitError::LimitNotPresentInContext("unknown".to_string()))
        );

        let names: Vec<String> = ctx.limits().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec![READ_RATE.to_string(), NEW_FILES.to_string()]);
    }

    #[tokio::test]
    async fn test_take_async() {
        let registry = registry();
        let limit = Limit::new(OBJECT_STORAGE_REQUEST, LimitKind::FrequencyLimit, 20);
        let mut ctx = context(&registry, vec![limit]);

        ctx.take_async(OBJECT_STORAGE_REQUEST, 20).await.unwrap();

        let start = Instant::now();
        ctx.take_async(OBJECT_STORAGE_REQUEST, 2).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
