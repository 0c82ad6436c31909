//! Timeline semaphores: monotonic stage counters for cooperative multitasking
//!
//! Unlike binary or counting semaphores, a timeline semaphore is a monotonic
//! counter over the stages of a multi-step operation. One primitive encodes
//! the progress of the whole operation and can be awaited at any stage by any
//! number of tasks. Awaiting is a snapshot comparison rather than a blocking
//! handoff, so a stalled producer can never deadlock its consumers; they
//! simply observe the stage as not yet reached.

use crate::sync::backoff::yielding_backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Await-list stage value meaning "wait for full completion".
pub const AWAIT_COMPLETION: u64 = u64::MAX;

/// A monotonic stage counter for a multi-step operation.
///
/// The counter starts at stage 0 and only ever moves forward, clamped to
/// `num_stages`. Reaching `num_stages` means every stage has been passed.
pub struct TimelineSemaphore {
    /// Number of stages in the operation
    num_stages: u64,

    /// Currently active stage
    stage: AtomicU64,
}

impl TimelineSemaphore {
    /// Create a semaphore with `num_stages` stages, starting at stage 0.
    pub fn new(num_stages: u64) -> Self {
        assert!(num_stages >= 1, "a timeline semaphore needs at least one stage");
        Self {
            num_stages,
            stage: AtomicU64::new(0),
        }
    }

    /// Number of stages in the operation.
    pub fn num_stages(&self) -> u64 {
        self.num_stages
    }

    /// Current stage being worked on.
    pub fn stage(&self) -> u64 {
        self.stage.load(Ordering::Acquire)
    }

    /// True once the last stage has been passed.
    pub fn is_completed(&self) -> bool {
        self.stage() == self.num_stages
    }

    /// Advance the semaphore to stage `next`, clamped to the stage count.
    ///
    /// Returns `false` without touching the counter if `next` has already
    /// been reached or passed. The counter never moves backward.
    pub fn signal(&self, next: u64) -> bool {
        let next = next.min(self.num_stages);
        let mut current = self.stage.load(Ordering::Relaxed);
        loop {
            if next <= current {
                return false;
            }
            match self
                .stage
                .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Advance the semaphore by `delta` stages, saturating at the stage
    /// count. Never wraps.
    pub fn increment(&self, delta: u64) {
        let mut current = self.stage.load(Ordering::Relaxed);
        loop {
            let target = current.saturating_add(delta).min(self.num_stages);
            if target == current {
                return;
            }
            match self
                .stage
                .compare_exchange_weak(current, target, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Create an independently allocated, shareable semaphore handle.
pub fn create_semaphore(num_stages: u64) -> Arc<TimelineSemaphore> {
    Arc::new(TimelineSemaphore::new(num_stages))
}

/// One entry of an await list: a semaphore and the stage to wait for.
///
/// A stage of [`AWAIT_COMPLETION`] waits for the final stage.
#[derive(Clone)]
pub struct StageAwait {
    pub semaphore: Arc<TimelineSemaphore>,
    pub stage: u64,
}

impl StageAwait {
    /// Non-blocking snapshot check of this entry.
    pub fn is_ready(&self) -> bool {
        let target = if self.stage == AWAIT_COMPLETION {
            self.semaphore.num_stages() - 1
        } else {
            self.stage
        };
        self.semaphore.stage() >= target
    }
}

/// Await every entry for at most `timeout`.
///
/// A zero timeout performs a single snapshot pass with no syscalls. A
/// `Duration::MAX` timeout polls forever. Anything in between samples the
/// clock lazily, only after the first failed pass.
pub fn await_semaphores(awaits: &[StageAwait], timeout: Duration) -> bool {
    let mut poll = 0u64;
    let mut begin: Option<Instant> = None;

    // resume where the previous pass stopped; stages are monotonic, so an
    // entry that was ready stays ready
    let mut next = 0;

    loop {
        while next < awaits.len() {
            if !awaits[next].is_ready() {
                break;
            }
            next += 1;
        }

        if next == awaits.len() {
            return true;
        }

        if timeout.is_zero() {
            return false;
        }

        if timeout != Duration::MAX {
            let begin = *begin.get_or_insert_with(Instant::now);
            if begin.elapsed() > timeout {
                return false;
            }
        }

        yielding_backoff(poll);
        poll += 1;
    }
}
