//! Stage-based cooperative task scheduler
//!
//! Tasks are carved from recyclable arenas, linked into intrusive FIFO
//! queues, and driven by a fixed pool of dedicated and worker threads plus
//! an explicitly pumped main-thread queue. Dependencies between tasks are
//! expressed through timeline semaphores, never through blocking waits.

mod arena;
mod queue;
mod scheduler;
mod spawn;
mod task;
mod worker;

pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerHandle, Target, DEFAULT_WORKER_SLEEP,
};
pub use spawn::{Delay, Poller, Ready};
pub use task::{
    ShardDescriptor, ShardFrame, StageIncrement, StageSignal, TaskBody, TaskDescriptor, TaskFrame,
    TaskInstance, MAX_TASK_FRAME_SIZE,
};
