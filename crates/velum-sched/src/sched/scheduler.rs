//! Scheduler: thread ownership, task submission, main-thread pumping

use crate::sched::arena::ArenaPool;
use crate::sched::queue::TaskQueue;
use crate::sched::task::{
    spawn_frame, spawn_shard, ShardDescriptor, ShardFrame, TaskDescriptor, TaskFrame,
};
use crate::sched::worker::{main_thread_loop, TaskThread};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Default max idle sleep for pooled worker threads.
pub const DEFAULT_WORKER_SLEEP: Duration = Duration::from_micros(100);

/// Scheduler construction parameters.
///
/// Each entry is one thread's maximum idle sleep; the vector lengths set the
/// thread counts. Dedicated threads get short sleeps for latency-sensitive
/// work (audio, video); worker threads can afford longer ones.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max idle sleep per dedicated thread.
    pub dedicated_sleep: Vec<Duration>,

    /// Max idle sleep per worker thread.
    pub worker_sleep: Vec<Duration>,
}

impl Default for SchedulerConfig {
    /// One worker per CPU core, no dedicated threads.
    fn default() -> Self {
        Self {
            dedicated_sleep: Vec::new(),
            worker_sleep: vec![DEFAULT_WORKER_SLEEP; num_cpus::get()],
        }
    }
}

/// Where to run a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Target {
    /// Any pooled worker thread
    Worker,

    /// A specific dedicated thread
    Dedicated(u32),

    /// The main-thread queue, drained only by explicit pumps
    Main,
}

struct Core {
    pool: Arc<ArenaPool>,
    dedicated_queues: Vec<Arc<TaskQueue>>,
    worker_queue: Arc<TaskQueue>,
    main_queue: Arc<TaskQueue>,
}

impl Core {
    fn queue(&self, target: Target) -> &TaskQueue {
        match target {
            Target::Worker => &self.worker_queue,
            Target::Dedicated(index) => {
                let count = self.dedicated_queues.len();
                assert!(
                    (index as usize) < count,
                    "dedicated thread index {} out of range ({} dedicated threads)",
                    index,
                    count
                );
                &self.dedicated_queues[index as usize]
            }
            Target::Main => &self.main_queue,
        }
    }
}

/// Cloneable handle submitting work to a [`Scheduler`].
///
/// This is the injection point for subsystems (and for tasks that schedule
/// further tasks): pass a clone at construction time instead of reaching for
/// a global.
#[derive(Clone)]
pub struct SchedulerHandle {
    core: Arc<Core>,
}

impl SchedulerHandle {
    /// Create the task described by `descriptor` and push it onto `target`'s
    /// queue.
    pub fn schedule<F: TaskFrame + Send + 'static>(
        &self,
        descriptor: TaskDescriptor<F>,
        target: Target,
    ) {
        let queue = self.core.queue(target);
        spawn_frame(&self.core.pool, descriptor, |task| queue.push_back(task));
    }

    /// Fan `descriptor`'s instances out onto `target`'s queue.
    pub fn schedule_shard<G: ShardFrame + Send + 'static>(
        &self,
        descriptor: ShardDescriptor<G>,
        target: Target,
    ) {
        let queue = self.core.queue(target);
        spawn_shard(&self.core.pool, descriptor, |task| queue.push_back(task));
    }

    /// Schedule onto a specific dedicated thread's private queue.
    pub fn schedule_dedicated<F: TaskFrame + Send + 'static>(
        &self,
        index: u32,
        descriptor: TaskDescriptor<F>,
    ) {
        self.schedule(descriptor, Target::Dedicated(index));
    }

    /// Schedule onto the shared worker queue.
    pub fn schedule_worker<F: TaskFrame + Send + 'static>(&self, descriptor: TaskDescriptor<F>) {
        self.schedule(descriptor, Target::Worker);
    }

    /// Schedule onto the main-thread queue.
    pub fn schedule_main<F: TaskFrame + Send + 'static>(&self, descriptor: TaskDescriptor<F>) {
        self.schedule(descriptor, Target::Main);
    }
}

/// Static thread pool scheduler.
///
/// Owns two kinds of long-lived executor threads plus the main-thread queue:
///
/// - **dedicated** threads each drain a private queue, for latency-sensitive
///   work that must not contend with the pool;
/// - **worker** threads all drain one shared queue;
/// - the **main** queue only progresses through
///   [`execute_main_thread_work`](Scheduler::execute_main_thread_work),
///   pumped from the embedding application's own loop. Work submitted there
///   must be lightweight and non-blocking.
///
/// All tasks execute out of order; ordering is established solely through
/// timeline semaphores. Construction records the calling thread as the main
/// thread.
pub struct Scheduler {
    core: Arc<Core>,
    dedicated: Vec<TaskThread>,
    workers: Vec<TaskThread>,
    main_thread: ThreadId,
    joined: bool,
}

impl Scheduler {
    /// Create a scheduler and spawn its executor threads.
    pub fn new(config: SchedulerConfig) -> Self {
        let pool = Arc::new(ArenaPool::new());

        let dedicated_queues: Vec<_> = config
            .dedicated_sleep
            .iter()
            .map(|_| Arc::new(TaskQueue::new()))
            .collect();
        let worker_queue = Arc::new(TaskQueue::new());
        let main_queue = Arc::new(TaskQueue::new());

        let dedicated = config
            .dedicated_sleep
            .iter()
            .enumerate()
            .map(|(index, &sleep)| {
                TaskThread::spawn(
                    format!("velum-dedicated-{}", index),
                    dedicated_queues[index].clone(),
                    pool.clone(),
                    sleep,
                )
            })
            .collect();

        let workers = config
            .worker_sleep
            .iter()
            .enumerate()
            .map(|(index, &sleep)| {
                TaskThread::spawn(
                    format!("velum-worker-{}", index),
                    worker_queue.clone(),
                    pool.clone(),
                    sleep,
                )
            })
            .collect();

        Self {
            core: Arc::new(Core {
                pool,
                dedicated_queues,
                worker_queue,
                main_queue,
            }),
            dedicated,
            workers,
            main_thread: thread::current().id(),
            joined: false,
        }
    }

    pub fn num_dedicated(&self) -> u32 {
        self.core.dedicated_queues.len() as u32
    }

    pub fn num_workers(&self) -> u32 {
        self.workers.len() as u32
    }

    /// Cloneable submission handle.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            core: self.core.clone(),
        }
    }

    /// See [`SchedulerHandle::schedule`].
    pub fn schedule<F: TaskFrame + Send + 'static>(
        &self,
        descriptor: TaskDescriptor<F>,
        target: Target,
    ) {
        self.handle().schedule(descriptor, target);
    }

    /// See [`SchedulerHandle::schedule_shard`].
    pub fn schedule_shard<G: ShardFrame + Send + 'static>(
        &self,
        descriptor: ShardDescriptor<G>,
        target: Target,
    ) {
        self.handle().schedule_shard(descriptor, target);
    }

    /// See [`SchedulerHandle::schedule_dedicated`].
    pub fn schedule_dedicated<F: TaskFrame + Send + 'static>(
        &self,
        index: u32,
        descriptor: TaskDescriptor<F>,
    ) {
        self.handle().schedule_dedicated(index, descriptor);
    }

    /// See [`SchedulerHandle::schedule_worker`].
    pub fn schedule_worker<F: TaskFrame + Send + 'static>(&self, descriptor: TaskDescriptor<F>) {
        self.handle().schedule_worker(descriptor);
    }

    /// See [`SchedulerHandle::schedule_main`].
    pub fn schedule_main<F: TaskFrame + Send + 'static>(&self, descriptor: TaskDescriptor<F>) {
        self.handle().schedule_main(descriptor);
    }

    /// Drain the main queue inline for at most `timeout`, returning as soon
    /// as it is empty.
    ///
    /// Must be called periodically from the embedding application's main
    /// loop; this is the only way main-queue tasks ever run.
    pub fn execute_main_thread_work(&self, timeout: Duration) {
        main_thread_loop(&self.core.main_queue, &self.core.pool, timeout);
    }

    /// Stop and join every executor thread.
    ///
    /// Must run on the thread that constructed the scheduler. Executor
    /// threads finish the work already on their queues before exiting; the
    /// main queue must have been drained by the embedder.
    pub fn shutdown(&mut self) {
        if self.joined {
            return;
        }
        assert_eq!(
            thread::current().id(),
            self.main_thread,
            "scheduler must be shut down on the main thread"
        );

        for thread in &self.dedicated {
            thread.request_stop();
        }
        for thread in &self.workers {
            thread.request_stop();
        }
        for thread in &mut self.dedicated {
            thread.join();
        }
        for thread in &mut self.workers {
            thread.join();
        }

        assert!(
            self.core.worker_queue.is_empty(),
            "worker queue not empty after shutdown"
        );
        for queue in &self.core.dedicated_queues {
            assert!(queue.is_empty(), "dedicated queue not empty after shutdown");
        }
        assert!(
            self.core.main_queue.is_empty(),
            "main queue not drained before shutdown"
        );

        self.joined = true;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
