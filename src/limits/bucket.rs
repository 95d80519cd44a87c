//! Thread-safe token bucket ticked by a shared background thread.
//!
//! One ticker thread serves every bucket of the process. On each tick a bucket
//! either refills at its fill rate or, when it has a depletion function, loses
//! the tokens spent by the states currently depleting it (elapsed CPU or
//! wall-clock time). The ticker also cancels the attached context when a budget
//! goes negative and wakes the threads and tasks waiting for tokens.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use super::limit::DepletionFn;
use crate::context::{CancelReason, ContextHandle};
use crate::error::{violation, LimitError};

/// Default period of a bucket's ticks.
pub const TOKEN_BUCKET_MANAGEMENT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Token counts are stored multiplied by this factor so that a bucket refilling
/// slowly still gains something on every tick.
pub const TOKEN_BUCKET_CAPACITY_SCALE: i64 = 1000;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Configuration of a [`TokenBucket`].
#[derive(Clone)]
pub struct TokenBucketConfig {
    /// Used in logs and cancellation reasons.
    pub name: String,
    pub cap: i64,
    /// Tokens at creation, the bucket is created full when `None`.
    pub initial_avail: Option<i64>,
    /// Tokens added per second, ignored when `deplete_fn` is set.
    pub fill_rate: i64,
    pub deplete_fn: Option<DepletionFn>,
    pub cancel_context_on_negative_count: bool,
    pub tick_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cap: 0,
            initial_avail: None,
            fill_rate: 0,
            deplete_fn: None,
            cancel_context_on_negative_count: false,
            tick_interval: TOKEN_BUCKET_MANAGEMENT_TICK_INTERVAL,
        }
    }
}

impl fmt::Debug for TokenBucketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketConfig")
            .field("name", &self.name)
            .field("cap", &self.cap)
            .field("initial_avail", &self.initial_avail)
            .field("fill_rate", &self.fill_rate)
            .field("depleting", &self.deplete_fn.is_some())
            .field(
                "cancel_context_on_negative_count",
                &self.cancel_context_on_negative_count,
            )
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

/// A thread-safe token bucket.
///
/// The most important methods are [`take`](Self::take) and
/// [`give_back`](Self::give_back). On a refilling bucket `take` waits for the
/// tokens to be available; on a non-refilling one it always subtracts, possibly
/// driving the count negative.
pub struct TokenBucket {
    name: String,
    /// Scaled.
    capacity: i64,
    fill_rate: i64,
    deplete_fn: Option<DepletionFn>,
    cancel_context_on_negative_count: bool,
    tick_interval: Duration,

    state: Mutex<BucketState>,
    refilled: Condvar,
    refilled_async: Notify,
    /// Threads and tasks blocked in a wait. They are woken on every tick so
    /// they notice the cancellation of their own context.
    waiters: AtomicUsize,

    /// Number of states currently depleting the bucket (live minus paused).
    depleting_states: AtomicI32,
}

struct BucketState {
    /// Scaled, may be negative.
    available: i64,
    /// Part of a scaled token earned by past refills but not added yet, in
    /// units of `1 / NANOS_PER_SECOND` scaled token.
    refill_remainder: i128,
    last_tick: Instant,
    context: Option<ContextHandle>,
    destroyed: bool,
}

impl TokenBucket {
    /// Create a bucket and register it with the shared ticker, starting the
    /// ticker thread if it is not running yet.
    pub fn new(config: TokenBucketConfig) -> Result<Arc<Self>, LimitError> {
        assert!(
            config.cap >= 0,
            "token bucket: capacity {} should be >= 0",
            config.cap
        );

        let initial = config.initial_avail.unwrap_or(config.cap);

        let bucket = Arc::new(Self {
            name: config.name,
            capacity: scale(config.cap),
            fill_rate: config.fill_rate,
            deplete_fn: config.deplete_fn,
            cancel_context_on_negative_count: config.cancel_context_on_negative_count,
            tick_interval: config.tick_interval,
            state: Mutex::new(BucketState {
                available: scale(initial),
                refill_remainder: 0,
                last_tick: Instant::now(),
                context: None,
                destroyed: false,
            }),
            refilled: Condvar::new(),
            refilled_async: Notify::new(),
            waiters: AtomicUsize::new(0),
            depleting_states: AtomicI32::new(0),
        });

        register_with_ticker(&bucket)?;

        debug!(
            bucket = %bucket.name,
            capacity = config.cap,
            initial,
            fill_rate = bucket.fill_rate,
            depleting = bucket.deplete_fn.is_some(),
            "Token bucket created"
        );

        Ok(bucket)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the owning execution context, used for cancellation on budget
    /// violation. Only the first attached context is kept.
    pub fn set_context(&self, ctx: ContextHandle) {
        let mut state = self.state.lock();
        if state.context.is_some() {
            trace!(bucket = %self.name, "Context already attached, ignoring");
            return;
        }
        state.context = Some(ctx);
    }

    pub fn capacity(&self) -> i64 {
        self.capacity / TOKEN_BUCKET_CAPACITY_SCALE
    }

    pub fn available(&self) -> i64 {
        self.state.lock().available / TOKEN_BUCKET_CAPACITY_SCALE
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    fn is_refilling(&self) -> bool {
        self.deplete_fn.is_none() && self.fill_rate > 0
    }

    /// Take `count` tokens if they are available, without waiting.
    ///
    /// Asking a refilling bucket for more than its capacity is a contract
    /// violation; any other bucket simply refuses.
    pub fn try_take(&self, count: i64) -> bool {
        let scaled = if self.is_refilling() {
            self.checked_scale(count)
        } else {
            checked_count(count)
        };

        let mut state = self.state.lock();
        self.assert_not_destroyed(&state);

        if scaled <= state.available {
            state.available -= scaled;
            trace!(bucket = %self.name, count, "Tokens taken");
            return true;
        }
        false
    }

    /// Take `count` tokens.
    ///
    /// A refilling bucket waits until enough tokens are available, or until
    /// the attached context is cancelled. Other buckets subtract
    /// unconditionally and, if configured to, cancel the attached context when
    /// the count goes negative.
    pub fn take(&self, count: i64) -> Result<(), LimitError> {
        self.take_inner(count, None)
    }

    /// Like [`take`](Self::take), also giving up with
    /// [`LimitError::ContextCancelled`] as soon as `ctx` is cancelled.
    ///
    /// Needed by states that share a bucket attached to another context, for
    /// example a child context using an inherited limit.
    pub fn take_cancellable(&self, count: i64, ctx: &ContextHandle) -> Result<(), LimitError> {
        self.take_inner(count, Some(ctx))
    }

    fn take_inner(&self, count: i64, cancel: Option<&ContextHandle>) -> Result<(), LimitError> {
        if self.is_refilling() {
            return self.wait_and_take(count, count, cancel);
        }
        let scaled = checked_count(count);

        let mut state = self.state.lock();
        self.assert_not_destroyed(&state);

        state.available = state.available.saturating_sub(scaled);
        trace!(bucket = %self.name, count, "Tokens taken");
        self.cancel_context_if_negative(&state);
        Ok(())
    }

    /// Wait until `count` tokens are available, without taking them.
    pub fn wait(&self, count: i64) -> Result<(), LimitError> {
        self.wait_and_take(count, 0, None)
    }

    pub fn give_back(&self, count: i64) {
        let scaled = checked_count(count);

        let mut state = self.state.lock();
        self.assert_not_destroyed(&state);

        state.available = state.available.saturating_add(scaled).min(self.capacity);
        drop(state);

        trace!(bucket = %self.name, count, "Tokens given back");
        self.notify_waiters();
    }

    /// Async counterpart of [`take`](Self::take).
    pub async fn take_async(&self, count: i64) -> Result<(), LimitError> {
        self.take_async_inner(count, None).await
    }

    /// Async counterpart of [`take_cancellable`](Self::take_cancellable).
    pub async fn take_async_cancellable(
        &self,
        count: i64,
        ctx: &ContextHandle,
    ) -> Result<(), LimitError> {
        self.take_async_inner(count, Some(ctx)).await
    }

    async fn take_async_inner(
        &self,
        count: i64,
        cancel: Option<&ContextHandle>,
    ) -> Result<(), LimitError> {
        if self.is_refilling() {
            return self.wait_and_take_async(count, count, cancel).await;
        }
        self.take_inner(count, cancel)
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn wait_async(&self, count: i64) -> Result<(), LimitError> {
        self.wait_and_take_async(count, 0, None).await
    }

    /// Stop counting one state as depleting the bucket.
    pub fn pause_one_state_depletion(&self) {
        self.depleting_states.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count one more state as depleting the bucket.
    pub fn resume_one_state_depletion(&self) {
        self.depleting_states.fetch_add(1, Ordering::AcqRel);
    }

    pub fn depleting_states(&self) -> i32 {
        self.depleting_states.load(Ordering::Acquire)
    }

    /// Mark the bucket destroyed, the ticker drops it on its next pass. Every
    /// later take/try_take/wait/give_back panics with
    /// [`LimitError::DestroyedTokenBucket`], and so do the calls blocked in a
    /// wait when this happens.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        self.notify_waiters();
        info!(bucket = %self.name, "Token bucket destroyed");
    }

    fn wait_and_take(
        &self,
        need: i64,
        take: i64,
        cancel: Option<&ContextHandle>,
    ) -> Result<(), LimitError> {
        let need_scaled = self.checked_scale(need);
        let take_scaled = scale(take);
        let start = Instant::now();
        let _waiter = WaiterGuard::new(&self.waiters);

        let mut state = self.state.lock();
        loop {
            if self.try_take_locked(&mut state, need_scaled, take_scaled, cancel)? {
                trace!(
                    bucket = %self.name,
                    need,
                    take,
                    waited_us = start.elapsed().as_micros() as u64,
                    "Tokens available"
                );
                return Ok(());
            }
            self.refilled.wait(&mut state);
        }
    }

    async fn wait_and_take_async(
        &self,
        need: i64,
        take: i64,
        cancel: Option<&ContextHandle>,
    ) -> Result<(), LimitError> {
        let need_scaled = self.checked_scale(need);
        let take_scaled = scale(take);
        let _waiter = WaiterGuard::new(&self.waiters);

        loop {
            let notified = self.refilled_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if self.try_take_locked(&mut state, need_scaled, take_scaled, cancel)? {
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Shared by the blocking and async waits: `Ok(true)` when the tokens were
    /// taken, `Ok(false)` when the caller should keep waiting. A cancelled
    /// context takes nothing.
    fn try_take_locked(
        &self,
        state: &mut MutexGuard<'_, BucketState>,
        need_scaled: i64,
        take_scaled: i64,
        cancel: Option<&ContextHandle>,
    ) -> Result<bool, LimitError> {
        self.assert_not_destroyed(state);

        let cancelled = state
            .context
            .iter()
            .chain(cancel)
            .any(ContextHandle::is_cancelled);
        if cancelled {
            return Err(LimitError::ContextCancelled);
        }

        if state.available >= need_scaled {
            state.available -= take_scaled;
            return Ok(true);
        }
        Ok(false)
    }

    /// Tick the bucket if its interval elapsed since the last tick. Returns
    /// when the next tick is due, or `None` once the bucket is destroyed.
    fn tick(&self, now: Instant) -> Option<Instant> {
        let mut state = self.state.lock();
        if state.destroyed {
            return None;
        }

        let due = state.last_tick + self.tick_interval;
        if now < due {
            return Some(due);
        }
        self.advance(&mut state, now);
        drop(state);

        if self.waiters.load(Ordering::Acquire) > 0 {
            self.notify_waiters();
        }
        Some(now + self.tick_interval)
    }

    /// Refill or deplete the bucket for the time elapsed since the last tick.
    fn advance(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_tick);
        state.last_tick = state.last_tick.max(now);

        match &self.deplete_fn {
            None if self.fill_rate > 0 => {
                if state.available < self.capacity {
                    let gained = self.refill_amount(state, elapsed);
                    state.available = state.available.saturating_add(gained).min(self.capacity);
                }
                if state.available >= self.capacity {
                    state.refill_remainder = 0;
                }
            }
            None => {}
            Some(deplete) => {
                let states = self.depleting_states.load(Ordering::Acquire);
                if states > 0 {
                    let spent = deplete(elapsed, states).saturating_mul(TOKEN_BUCKET_CAPACITY_SCALE);
                    state.available = state.available.saturating_sub(spent);
                    if !self.cancel_context_on_negative_count {
                        state.available = state.available.max(0);
                    }
                }
            }
        }

        self.cancel_context_if_negative(state);
    }

    /// Scaled tokens gained in `elapsed` at the bucket's fill rate. The
    /// fraction that does not make a whole scaled token is carried over to the
    /// next refill.
    fn refill_amount(&self, state: &mut BucketState, elapsed: Duration) -> i64 {
        let nanos = i128::try_from(elapsed.as_nanos()).unwrap_or(i128::MAX);
        let earned = i128::from(self.fill_rate)
            .saturating_mul(i128::from(TOKEN_BUCKET_CAPACITY_SCALE))
            .saturating_mul(nanos)
            .saturating_add(state.refill_remainder);

        state.refill_remainder = earned % NANOS_PER_SECOND;
        i64::try_from(earned / NANOS_PER_SECOND).unwrap_or(i64::MAX)
    }

    fn cancel_context_if_negative(&self, state: &BucketState) {
        if state.available >= 0 || !self.cancel_context_on_negative_count {
            return;
        }
        if let Some(ctx) = &state.context {
            if !ctx.is_cancelled() {
                warn!(
                    bucket = %self.name,
                    available = state.available / TOKEN_BUCKET_CAPACITY_SCALE,
                    "Budget exhausted, cancelling context"
                );
                ctx.cancel(CancelReason::LimitExhausted(self.name.clone()));
            }
        }
    }

    fn notify_waiters(&self) {
        self.refilled.notify_all();
        self.refilled_async.notify_waiters();
    }

    #[track_caller]
    fn assert_not_destroyed(&self, state: &BucketState) {
        if state.destroyed {
            violation(LimitError::DestroyedTokenBucket);
        }
    }

    #[track_caller]
    fn checked_scale(&self, count: i64) -> i64 {
        let scaled = checked_count(count);
        if scaled > self.capacity {
            violation(LimitError::CountExceedsCapacity {
                count,
                capacity: self.capacity(),
            });
        }
        scaled
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("fill_rate", &self.fill_rate)
            .field("depleting_states", &self.depleting_states())
            .finish_non_exhaustive()
    }
}

fn scale(count: i64) -> i64 {
    count.saturating_mul(TOKEN_BUCKET_CAPACITY_SCALE)
}

#[track_caller]
fn checked_count(count: i64) -> i64 {
    if count < 0 {
        violation(LimitError::NegativeCount(count));
    }
    scale(count)
}

/// Counts a thread or task as waiting on a bucket for as long as it lives,
/// including when an async wait is dropped before completing.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn new(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self(waiters)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Buckets served by the shared ticker thread. Only weak references are held
/// so that a bucket nobody uses anymore is dropped from the list.
struct Ticker {
    buckets: Vec<Weak<TokenBucket>>,
    thread: Option<ThreadId>,
}

static TICKER: Mutex<Ticker> = Mutex::new(Ticker {
    buckets: Vec::new(),
    thread: None,
});

/// Signalled when a bucket is registered, so that a sleeping ticker picks it
/// up without waiting for its current deadline.
static TICKER_WAKEUP: Condvar = Condvar::new();

fn register_with_ticker(bucket: &Arc<TokenBucket>) -> Result<(), LimitError> {
    let mut ticker = TICKER.lock();

    if ticker.thread.is_none() {
        let handle = thread::Builder::new()
            .name("bucket-ticker".to_string())
            .spawn(run_ticker)
            .map_err(|err| LimitError::TickerUnavailable(err.to_string()))?;
        ticker.thread = Some(handle.thread().id());
        debug!("Token bucket ticker started");
    }

    ticker.buckets.push(Arc::downgrade(bucket));
    TICKER_WAKEUP.notify_one();
    Ok(())
}

/// Body of the ticker thread. Buckets are ticked with the registry unlocked,
/// each at its own interval, and the thread sleeps until the earliest next
/// tick. It parks when no bucket is alive.
fn run_ticker() {
    let mut ticker = TICKER.lock();

    loop {
        ticker.buckets.retain(|bucket| bucket.strong_count() > 0);
        if ticker.buckets.is_empty() {
            TICKER_WAKEUP.wait(&mut ticker);
            continue;
        }

        let buckets: Vec<Arc<TokenBucket>> =
            ticker.buckets.iter().filter_map(Weak::upgrade).collect();

        let (next_tick, destroyed) = MutexGuard::unlocked(&mut ticker, move || {
            let now = Instant::now();
            let mut next_tick: Option<Instant> = None;
            let mut destroyed = Vec::new();

            for bucket in &buckets {
                match bucket.tick(now) {
                    Some(due) => next_tick = Some(next_tick.map_or(due, |next| next.min(due))),
                    None => destroyed.push(Arc::downgrade(bucket)),
                }
            }
            (next_tick, destroyed)
        });

        if !destroyed.is_empty() {
            ticker
                .buckets
                .retain(|bucket| !destroyed.iter().any(|gone| gone.ptr_eq(bucket)));
            trace!(dropped = destroyed.len(), "Destroyed buckets left the ticker");
        }

        if let Some(next_tick) = next_tick {
            TICKER_WAKEUP.wait_until(&mut ticker, next_tick);
        }
    }
}
