//! Lock-free and spin-based synchronization primitives

mod backoff;
mod semaphore;
mod spin;
mod stop;

pub use backoff::{
    backoff_action, sleepy_backoff, yielding_backoff, BackoffAction, HOT_SPIN_POLLS, SPIN_POLLS,
    YIELD_POLLS,
};
pub use semaphore::{
    await_semaphores, create_semaphore, StageAwait, TimelineSemaphore, AWAIT_COMPLETION,
};
pub use spin::{RwReadGuard, RwSpinLock, RwWriteGuard, SpinLock, SpinLockGuard};
pub use stop::{create_stop_token, StopToken};
