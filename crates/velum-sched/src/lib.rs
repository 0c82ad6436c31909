//! velum-sched: the Velum engine's stage-based cooperative task scheduler
//!
//! The engine's subsystems (rendering, layout, text, asset streaming) hand
//! units of work to this crate and read progress back through timeline
//! semaphores. The scheduler provides:
//!
//! - [`TimelineSemaphore`]: monotonic stage counters expressing partial
//!   progress of multi-step operations, with lock-free signal/increment and
//!   non-blocking awaits;
//! - [`StopToken`]: cooperative, stage-keyed cancellation;
//! - [`Scheduler`]: a static thread pool of dedicated and worker threads
//!   plus a main-thread queue pumped from the host application's own loop,
//!   allocating task memory from recyclable arenas;
//! - combinators ([`once`](SchedulerHandle::once),
//!   [`loop_fn`](SchedulerHandle::loop_fn),
//!   [`repeat`](SchedulerHandle::repeat),
//!   [`shard`](SchedulerHandle::shard)) for the common submission shapes.
//!
//! Everything is cooperative: tasks declare their dependencies as semaphore
//! stages and are requeued until ready, so no executor thread ever blocks on
//! another task's progress.

pub mod sched;
pub mod sync;

pub use sched::{
    Delay, Poller, Ready, Scheduler, SchedulerConfig, SchedulerHandle, ShardDescriptor,
    ShardFrame, StageIncrement, StageSignal, Target, TaskBody, TaskDescriptor, TaskFrame,
    TaskInstance, MAX_TASK_FRAME_SIZE,
};
pub use sync::{
    await_semaphores, create_semaphore, create_stop_token, StageAwait, StopToken,
    TimelineSemaphore, AWAIT_COMPLETION,
};
