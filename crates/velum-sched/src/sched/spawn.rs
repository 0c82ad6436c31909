//! Task submission combinators
//!
//! Thin builders translating the common shapes (run once, loop until done,
//! repeat n times, fan out shards) into scheduler submissions.

use crate::sched::scheduler::{Scheduler, SchedulerHandle, Target};
use crate::sched::task::{
    ShardDescriptor, ShardFrame, TaskDescriptor, TaskFrame, TaskInstance,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Non-blocking readiness predicate for combinator-built tasks.
///
/// Evaluated every time an executor considers the task, alongside its await
/// list; must be cheap.
pub trait Poller: Send + 'static {
    fn poll(&mut self) -> bool;
}

/// Always ready.
#[derive(Debug, Default, Copy, Clone)]
pub struct Ready;

impl Poller for Ready {
    fn poll(&mut self) -> bool {
        true
    }
}

/// Ready once `delay` has elapsed since `from`.
#[derive(Debug, Copy, Clone)]
pub struct Delay {
    from: Instant,
    delay: Duration,
}

impl Delay {
    /// Delay for `delay`, measured from now.
    pub fn new(delay: Duration) -> Self {
        Self {
            from: Instant::now(),
            delay,
        }
    }

    /// Delay for `delay`, measured from `from`.
    pub fn starting_at(from: Instant, delay: Duration) -> Self {
        Self { from, delay }
    }
}

impl Poller for Delay {
    fn poll(&mut self) -> bool {
        self.delay.is_zero() || self.from.elapsed() >= self.delay
    }
}

struct OnceFrame<F, P> {
    f: Option<F>,
    poller: P,
}

impl<F, P> TaskFrame for OnceFrame<F, P>
where
    F: FnOnce(),
    P: Poller,
{
    fn poll(&mut self) -> bool {
        self.poller.poll()
    }

    fn run(&mut self) -> bool {
        if let Some(f) = self.f.take() {
            f();
        }
        false
    }
}

struct LoopFrame<F, P> {
    f: F,
    poller: P,
}

impl<F, P> TaskFrame for LoopFrame<F, P>
where
    F: FnMut() -> bool,
    P: Poller,
{
    fn poll(&mut self) -> bool {
        self.poller.poll()
    }

    fn run(&mut self) -> bool {
        (self.f)()
    }
}

struct RepeatFrame<F, P> {
    f: F,
    n: u64,
    i: u64,
    poller: P,
}

impl<F, P> TaskFrame for RepeatFrame<F, P>
where
    F: FnMut(u64) -> bool,
    P: Poller,
{
    fn poll(&mut self) -> bool {
        self.poller.poll()
    }

    fn run(&mut self) -> bool {
        let done = (self.f)(self.i);
        self.i += 1;
        !done && self.i < self.n
    }
}

struct ShardBody<S, F> {
    state: Arc<S>,
    f: F,
}

impl<S, F> ShardFrame for ShardBody<S, F>
where
    S: Send + Sync,
    F: Fn(TaskInstance, &S) + Sync,
{
    fn run_shard(&self, instance: TaskInstance) {
        (self.f)(instance, &self.state)
    }
}

/// Gating task for a fan-out: owns the poller, and dispatches all instances
/// at once when it passes. Keeps the poller off the concurrent path, so it
/// does not need to be thread-safe across instances.
struct GateFrame<S, F, P> {
    handle: SchedulerHandle,
    target: Target,
    shard: Option<ShardDescriptor<ShardBody<S, F>>>,
    poller: P,
}

impl<S, F, P> TaskFrame for GateFrame<S, F, P>
where
    S: Send + Sync + 'static,
    F: Fn(TaskInstance, &S) + Send + Sync + 'static,
    P: Poller,
{
    fn poll(&mut self) -> bool {
        self.poller.poll()
    }

    fn run(&mut self) -> bool {
        if let Some(shard) = self.shard.take() {
            self.handle.schedule_shard(shard, self.target);
        }
        false
    }
}

impl SchedulerHandle {
    /// Run `f` exactly once, once `poller` passes.
    pub fn once<F, P>(&self, f: F, poller: P, target: Target)
    where
        F: FnOnce() + Send + 'static,
        P: Poller,
    {
        self.schedule(
            TaskDescriptor::new(OnceFrame { f: Some(f), poller }),
            target,
        );
    }

    /// Call `f` repeatedly until it returns false.
    pub fn loop_fn<F, P>(&self, f: F, poller: P, target: Target)
    where
        F: FnMut() -> bool + Send + 'static,
        P: Poller,
    {
        self.schedule(TaskDescriptor::new(LoopFrame { f, poller }), target);
    }

    /// Call `f(i)` for `i` in `0..n`; `f` may end the run early by returning
    /// true. `n == 0` schedules nothing.
    pub fn repeat<F, P>(&self, f: F, n: u64, poller: P, target: Target)
    where
        F: FnMut(u64) -> bool + Send + 'static,
        P: Poller,
    {
        if n == 0 {
            return;
        }
        self.schedule(
            TaskDescriptor::new(RepeatFrame {
                f,
                n,
                i: 0,
                poller,
            }),
            target,
        );
    }

    /// Fan `n` concurrent shard instances out over the shared `state` once
    /// `poller` passes.
    ///
    /// A single gating task owns the poller; when it fires, every instance
    /// is dispatched at once. Instances draw unique indices from a shared
    /// counter and run with no ordering guarantee among them. `n == 0`
    /// schedules nothing.
    pub fn shard<S, F, P>(&self, state: Arc<S>, f: F, n: u64, poller: P, target: Target)
    where
        S: Send + Sync + 'static,
        F: Fn(TaskInstance, &S) + Send + Sync + 'static,
        P: Poller,
    {
        if n == 0 {
            return;
        }
        let shard = ShardDescriptor::new(ShardBody { state, f }, n);
        self.schedule(
            TaskDescriptor::new(GateFrame {
                handle: self.clone(),
                target,
                shard: Some(shard),
                poller,
            }),
            target,
        );
    }
}

impl Scheduler {
    /// See [`SchedulerHandle::once`].
    pub fn once<F, P>(&self, f: F, poller: P, target: Target)
    where
        F: FnOnce() + Send + 'static,
        P: Poller,
    {
        self.handle().once(f, poller, target);
    }

    /// See [`SchedulerHandle::loop_fn`].
    pub fn loop_fn<F, P>(&self, f: F, poller: P, target: Target)
    where
        F: FnMut() -> bool + Send + 'static,
        P: Poller,
    {
        self.handle().loop_fn(f, poller, target);
    }

    /// See [`SchedulerHandle::repeat`].
    pub fn repeat<F, P>(&self, f: F, n: u64, poller: P, target: Target)
    where
        F: FnMut(u64) -> bool + Send + 'static,
        P: Poller,
    {
        self.handle().repeat(f, n, poller, target);
    }

    /// See [`SchedulerHandle::shard`].
    pub fn shard<S, F, P>(&self, state: Arc<S>, f: F, n: u64, poller: P, target: Target)
    where
        S: Send + Sync + 'static,
        F: Fn(TaskInstance, &S) + Send + Sync + 'static,
        P: Poller,
    {
        self.handle().shard(state, f, n, poller, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::scheduler::SchedulerConfig;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::thread;

    fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
        let begin = Instant::now();
        while !condition() {
            if begin.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            dedicated_sleep: Vec::new(),
            worker_sleep: vec![Duration::from_micros(100); workers],
        }
    }

    #[test]
    fn test_once_runs_exactly_once() {
        let scheduler = Scheduler::new(config(2));
        let counter = Arc::new(AtomicU32::new(0));

        {
            let counter = counter.clone();
            scheduler.once(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                Ready,
                Target::Worker,
            );
        }

        assert!(wait_until(
            || counter.load(Ordering::Relaxed) == 1,
            Duration::from_secs(5)
        ));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_once_on_main_pump() {
        let scheduler = Scheduler::new(config(1));
        let counter = Arc::new(AtomicU32::new(0));

        {
            let counter = counter.clone();
            scheduler.once(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                Ready,
                Target::Main,
            );
        }

        assert_eq!(counter.load(Ordering::Relaxed), 0);
        scheduler.execute_main_thread_work(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_once_with_delay_poller() {
        let scheduler = Scheduler::new(config(1));
        let counter = Arc::new(AtomicU32::new(0));
        let begin = Instant::now();

        {
            let counter = counter.clone();
            scheduler.once(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                Delay::new(Duration::from_millis(50)),
                Target::Worker,
            );
        }

        assert!(wait_until(
            || counter.load(Ordering::Relaxed) == 1,
            Duration::from_secs(5)
        ));
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_loop_runs_until_done() {
        let scheduler = Scheduler::new(config(1));
        let runs = Arc::new(AtomicU32::new(0));

        {
            let runs = runs.clone();
            // counter checked before increment: 3 requeues + 1 terminal run
            scheduler.loop_fn(
                move || {
                    let count = runs.fetch_add(1, Ordering::Relaxed);
                    count < 3
                },
                Ready,
                Target::Worker,
            );
        }

        assert!(wait_until(
            || runs.load(Ordering::Relaxed) == 4,
            Duration::from_secs(5)
        ));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_repeat_passes_indices() {
        let scheduler = Scheduler::new(config(1));
        let sum = Arc::new(AtomicU64::new(0));
        let runs = Arc::new(AtomicU32::new(0));

        {
            let sum = sum.clone();
            let runs = runs.clone();
            scheduler.repeat(
                move |i| {
                    sum.fetch_add(i, Ordering::Relaxed);
                    runs.fetch_add(1, Ordering::Relaxed);
                    false
                },
                5,
                Ready,
                Target::Worker,
            );
        }

        assert!(wait_until(
            || runs.load(Ordering::Relaxed) == 5,
            Duration::from_secs(5)
        ));
        assert_eq!(sum.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_repeat_early_exit() {
        let scheduler = Scheduler::new(config(1));
        let runs = Arc::new(AtomicU32::new(0));

        {
            let runs = runs.clone();
            scheduler.repeat(
                move |i| {
                    runs.fetch_add(1, Ordering::Relaxed);
                    i == 1
                },
                100,
                Ready,
                Target::Worker,
            );
        }

        assert!(wait_until(
            || runs.load(Ordering::Relaxed) == 2,
            Duration::from_secs(5)
        ));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_repeat_zero_schedules_nothing() {
        let mut scheduler = Scheduler::new(config(1));
        scheduler.repeat(|_| false, 0, Ready, Target::Worker);
        scheduler.shutdown();
    }

    #[test]
    fn test_shard_fans_out_unique_indices() {
        struct ShardState {
            seen: Vec<AtomicU32>,
            total: AtomicU32,
        }

        let scheduler = Scheduler::new(config(4));
        let state = Arc::new(ShardState {
            seen: (0..8).map(|_| AtomicU32::new(0)).collect(),
            total: AtomicU32::new(0),
        });

        scheduler.shard(
            state.clone(),
            |instance, state: &ShardState| {
                assert_eq!(instance.count, 8);
                state.seen[instance.index as usize].fetch_add(1, Ordering::Relaxed);
                state.total.fetch_add(1, Ordering::Relaxed);
            },
            8,
            Ready,
            Target::Worker,
        );

        assert!(wait_until(
            || state.total.load(Ordering::Relaxed) == 8,
            Duration::from_secs(5)
        ));
        for slot in &state.seen {
            assert_eq!(slot.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_shard_gates_on_poller() {
        let scheduler = Scheduler::new(config(2));
        let state = Arc::new(AtomicU32::new(0));
        let begin = Instant::now();

        scheduler.shard(
            state.clone(),
            |_, state: &AtomicU32| {
                state.fetch_add(1, Ordering::Relaxed);
            },
            4,
            Delay::new(Duration::from_millis(50)),
            Target::Worker,
        );

        assert!(wait_until(
            || state.load(Ordering::Relaxed) == 4,
            Duration::from_secs(5)
        ));
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_shard_zero_schedules_nothing() {
        let mut scheduler = Scheduler::new(config(1));
        scheduler.shard(Arc::new(()), |_, _| {}, 0, Ready, Target::Worker);
        scheduler.shutdown();
    }
}
