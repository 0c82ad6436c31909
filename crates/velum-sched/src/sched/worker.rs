//! Executor threads and the poll/execute loop

use crate::sched::arena::ArenaPool;
use crate::sched::queue::TaskQueue;
use crate::sync::sleepy_backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A long-lived executor thread (dedicated or worker).
pub(crate) struct TaskThread {
    /// Per-thread stop flag, honored once the queue runs dry.
    stop: Arc<AtomicBool>,

    handle: Option<JoinHandle<()>>,
}

impl TaskThread {
    /// Spawn a named executor thread looping over `queue`.
    pub(crate) fn spawn(
        name: String,
        queue: Arc<TaskQueue>,
        pool: Arc<ArenaPool>,
        max_sleep: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || thread_loop(&queue, &pool, &thread_stop, max_sleep))
            .expect("failed to spawn executor thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Ask the thread to stop once its queue drains.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Join the thread.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("executor thread panicked");
        }
    }
}

/// Poll/execute loop shared by dedicated and worker threads.
///
/// The stop flag is observed only when the queue runs dry, so queued work is
/// drained before the thread exits; whatever is still pending after that is
/// purged without running.
fn thread_loop(queue: &TaskQueue, pool: &ArenaPool, stop: &AtomicBool, max_sleep: Duration) {
    let mut poll = 0u64;

    loop {
        let Some(mut task) = queue.pop_front() else {
            if stop.load(Ordering::Acquire) {
                break;
            }
            sleepy_backoff(poll, max_sleep);
            poll += 1;
            continue;
        };

        if !task.is_ready() {
            // back of the queue; pending tasks get their turn first
            queue.push_back(task);
            continue;
        }

        // gotten a ready task: reset the idle counter
        poll = 0;

        if task.execute() {
            queue.push_back(task);
        } else {
            task.release(pool);
        }
    }

    // purge whatever was still queued
    while let Some(task) = queue.pop_front() {
        task.release(pool);
    }

    #[cfg(debug_assertions)]
    eprintln!(
        "{} shutting down",
        thread::current().name().unwrap_or("executor")
    );
}

/// Inline main-thread pump: the same readiness/execute/requeue logic as the
/// executor loop, bounded by `timeout` and returning as soon as the queue is
/// empty. Never blocks waiting for new work.
pub(crate) fn main_thread_loop(queue: &TaskQueue, pool: &ArenaPool, timeout: Duration) {
    let begin = Instant::now();

    loop {
        if begin.elapsed() > timeout {
            break;
        }

        let Some(mut task) = queue.pop_front() else {
            break;
        };

        if !task.is_ready() {
            queue.push_back(task);
            continue;
        }

        if task.execute() {
            queue.push_back(task);
        } else {
            task.release(pool);
        }
    }
}
