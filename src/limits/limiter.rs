//! Per-state limiter over a shared token bucket.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use super::bucket::{TokenBucket, TokenBucketConfig};
use super::limit::{Limit, LimitKind};
use crate::context::ContextHandle;
use crate::error::{violation, LimitError};

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one execution state (a context or a lightweight thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(NonZeroU64);

impl StateId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        let id = NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Returns `None` for 0, which never identifies a state.
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a limiter stands with respect to the automatic depletion of its
/// bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepletionState {
    /// No state claimed the limiter yet.
    Unset,
    /// The limit is not auto-depleting, pausing has no effect on the bucket.
    Inert,
    Active,
    Paused,
    /// Terminal, reached through destroy or definitely_stop_depletion.
    Stopped,
}

/// Manages a limit for a single state.
///
/// A limiter is not meant to be shared between threads: every concurrently
/// running state gets its own limiter through [`Limiter::child`], all of them
/// sharing the same bucket. Pause and resume take `&mut self` for that reason.
/// [`destroy`](Self::destroy) and
/// [`definitely_stop_depletion`](Self::definitely_stop_depletion) can race
/// with each other and release the pause contribution exactly once.
pub struct Limiter {
    limit: Limit,
    /// Shared with the parent if this is a child limiter.
    bucket: Arc<TokenBucket>,
    root: bool,
    state_id: Option<StateId>,
    paused_depletion: bool,
    definitely_stopped: AtomicBool,
}

impl Limiter {
    /// Create a root limiter owning a fresh bucket.
    pub fn new(limit: Limit, config: TokenBucketConfig) -> Result<Self, LimitError> {
        Ok(Self {
            limit,
            bucket: TokenBucket::new(config)?,
            root: true,
            state_id: None,
            paused_depletion: false,
            definitely_stopped: AtomicBool::new(false),
        })
    }

    /// Create a limiter sharing this limiter's bucket, for a child state.
    pub fn child(&self) -> Limiter {
        trace!(limit = %self.limit.name, "Creating child limiter");
        Limiter {
            limit: self.limit.clone(),
            bucket: Arc::clone(&self.bucket),
            root: false,
            state_id: None,
            paused_depletion: false,
            definitely_stopped: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> &Limit {
        &self.limit
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    pub fn is_child(&self) -> bool {
        !self.root
    }

    pub fn state_id(&self) -> Option<StateId> {
        self.state_id
    }

    /// Record the state owning this limiter.
    ///
    /// Depletion of an auto-depleting limit is paused until a state claims the
    /// limiter, so no time is charged before code actually runs under it.
    #[track_caller]
    pub fn set_state_once(&mut self, id: StateId) {
        if self.state_id.is_some() {
            violation(LimitError::StateIdAlreadySet);
        }
        self.state_id = Some(id);

        if self.limit.is_auto_depleting() && !self.is_stopped() {
            self.bucket.resume_one_state_depletion();
            debug!(limit = %self.limit.name, state = %id, "Depletion started");
        }
    }

    /// Attach the context to the bucket. Children share a bucket whose context
    /// is already set, so only a root limiter does it.
    pub fn set_context_if_not_child(&self, ctx: ContextHandle) {
        if self.root {
            self.bucket.set_context(ctx);
        }
    }

    pub fn available(&self) -> i64 {
        self.bucket.available()
    }

    pub fn total(&self) -> Result<i64, LimitError> {
        if self.limit.kind != LimitKind::TotalLimit {
            return Err(LimitError::NotATotalLimit(self.limit.name.clone()));
        }
        Ok(self.bucket.available())
    }

    /// Take `count` tokens.
    ///
    /// On a bounded total limit the caller is expected to have checked the
    /// availability before committing to an irreversible operation: taking
    /// more than what is available is a contract violation.
    #[track_caller]
    pub fn take(&self, count: i64) -> Result<(), LimitError> {
        self.check_total_availability(count);
        self.bucket.take(count)
    }

    /// Like [`take`](Self::take), but a wait for tokens ends with
    /// [`LimitError::ContextCancelled`] once `ctx` is cancelled, even if the
    /// bucket belongs to another context.
    #[track_caller]
    pub fn take_cancellable(&self, count: i64, ctx: &ContextHandle) -> Result<(), LimitError> {
        self.check_total_availability(count);
        self.bucket.take_cancellable(count, ctx)
    }

    /// Async counterpart of [`take`](Self::take).
    pub async fn take_async(&self, count: i64) -> Result<(), LimitError> {
        self.check_total_availability(count);
        self.bucket.take_async(count).await
    }

    /// Async counterpart of [`take_cancellable`](Self::take_cancellable).
    pub async fn take_async_cancellable(
        &self,
        count: i64,
        ctx: &ContextHandle,
    ) -> Result<(), LimitError> {
        self.check_total_availability(count);
        self.bucket.take_async_cancellable(count, ctx).await
    }

    /// Take `count` tokens if available. Always succeeds on an unbounded total
    /// limit, which still records the count.
    pub fn try_take(&self, count: i64) -> bool {
        if self.limit.is_unbounded_total() {
            return self.bucket.take(count).is_ok();
        }
        self.bucket.try_take(count)
    }

    /// Returns immediately on an unbounded total limit.
    pub fn wait(&self, count: i64) -> Result<(), LimitError> {
        if self.limit.is_unbounded_total() {
            return Ok(());
        }
        self.bucket.wait(count)
    }

    pub fn give_back(&self, count: i64) {
        self.bucket.give_back(count);
    }

    #[track_caller]
    fn check_total_availability(&self, count: i64) {
        if self.limit.kind != LimitKind::TotalLimit || self.limit.is_unbounded_total() {
            return;
        }
        let available = self.bucket.available();
        if available < count {
            violation(LimitError::InsufficientTokens {
                name: self.limit.name.clone(),
                count,
                available,
            });
        }
    }

    #[track_caller]
    pub fn pause_depletion(&mut self) {
        if self.is_stopped() {
            return;
        }
        if self.state_id.is_none() {
            violation(LimitError::StateIdNotSet);
        }
        if self.paused_depletion {
            violation(LimitError::TokenDepletionAlreadyPaused);
        }

        if self.limit.is_auto_depleting() {
            self.bucket.pause_one_state_depletion();
        }
        self.paused_depletion = true;
    }

    #[track_caller]
    pub fn pause_depletion_if_not_paused(&mut self) {
        if self.paused_depletion {
            return;
        }
        self.pause_depletion();
    }

    #[track_caller]
    pub fn resume_depletion(&mut self) {
        if self.is_stopped() {
            return;
        }
        if self.state_id.is_none() {
            violation(LimitError::StateIdNotSet);
        }
        if !self.paused_depletion {
            violation(LimitError::TokenDepletionNotPaused);
        }

        if self.limit.is_auto_depleting() {
            self.bucket.resume_one_state_depletion();
        }
        self.paused_depletion = false;
    }

    pub fn is_depletion_paused(&self) -> bool {
        self.paused_depletion
    }

    pub fn depletion_state(&self) -> DepletionState {
        if self.is_stopped() {
            DepletionState::Stopped
        } else if self.state_id.is_none() {
            DepletionState::Unset
        } else if !self.limit.is_auto_depleting() {
            DepletionState::Inert
        } else if self.paused_depletion {
            DepletionState::Paused
        } else {
            DepletionState::Active
        }
    }

    fn is_stopped(&self) -> bool {
        self.definitely_stopped.load(Ordering::Acquire)
    }

    /// Whether this limiter currently counts as a depleting state.
    fn is_depleting(&self) -> bool {
        self.state_id.is_some() && self.limit.is_auto_depleting() && !self.paused_depletion
    }

    /// Stop this limiter's participation in the bucket's depletion for good.
    /// Idempotent.
    pub fn definitely_stop_depletion(&self) {
        if self
            .definitely_stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.is_depleting() {
            self.bucket.pause_one_state_depletion();
        }
        trace!(limit = %self.limit.name, "Depletion definitely stopped");
    }

    /// A root limiter destroys the bucket; a child only releases its own
    /// depletion contribution since the bucket is owned by the root.
    pub fn destroy(&self) {
        if self.root {
            self.definitely_stopped.store(true, Ordering::Release);
            self.bucket.destroy();
        } else {
            self.definitely_stop_depletion();
        }
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("limit", &self.limit)
            .field("root", &self.root)
            .field("state_id", &self.state_id)
            .field("depletion", &self.depletion_state())
            .finish()
    }
}
