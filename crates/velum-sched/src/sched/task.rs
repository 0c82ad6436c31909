//! Task nodes, frames, and descriptors
//!
//! A task is one arena carve holding its queue header(s), its await / signal
//! / increment lists, the shared instance block for fan-out tasks, and the
//! caller's frame, in that order. Executors drive the task through a
//! monomorphized vtable; nothing about the frame type survives to runtime
//! except the three erased entry points.

use crate::sched::arena::{ArenaPool, TaskArena, ARENA_ALIGN, TASK_ARENA_SIZE};
use crate::sync::{await_semaphores, StageAwait, TimelineSemaphore, AWAIT_COMPLETION};
use std::alloc::Layout;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Maximum size of a task frame in bytes.
pub const MAX_TASK_FRAME_SIZE: usize = 2 * 1024;

const _: () = assert!(TASK_ARENA_SIZE >= MAX_TASK_FRAME_SIZE << 2);

/// One entry of a signal list: drive a semaphore to an absolute stage after
/// every run of the task.
#[derive(Clone)]
pub struct StageSignal {
    pub semaphore: Arc<TimelineSemaphore>,
    pub stage: u64,
}

/// One entry of an increment list: advance a semaphore by a relative number
/// of stages after every run of the task.
#[derive(Clone)]
pub struct StageIncrement {
    pub semaphore: Arc<TimelineSemaphore>,
    pub delta: u64,
}

/// A task's private frame: its state plus the poll/run entry points.
///
/// `poll` must be lightweight and non-blocking; it is evaluated together
/// with the await list every time an executor considers the task. `run`
/// returns true to be requeued, false when the task is finished.
///
/// Panics must not escape either entry point; a task reports failure through
/// its own state, the executor only understands the requeue decision.
pub trait TaskFrame {
    fn poll(&mut self) -> bool {
        true
    }

    fn run(&mut self) -> bool;
}

/// Closure adapter for [`TaskFrame`].
pub struct TaskBody<P, R> {
    pub poll: P,
    pub run: R,
}

impl<P, R> TaskFrame for TaskBody<P, R>
where
    P: FnMut() -> bool,
    R: FnMut() -> bool,
{
    fn poll(&mut self) -> bool {
        (self.poll)()
    }

    fn run(&mut self) -> bool {
        (self.run)()
    }
}

/// Identity of one instance of a fan-out task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskInstance {
    /// Total number of instances
    pub count: u64,

    /// This instance's index in `0..count`
    pub index: u64,
}

/// Frame shared by every instance of a fan-out task.
///
/// Instances run concurrently against the same frame, so access is by
/// shared reference and the frame must be `Sync`. Instances cannot request
/// requeue; each runs exactly once.
pub trait ShardFrame: Sync {
    fn poll(&self) -> bool {
        true
    }

    fn run_shard(&self, instance: TaskInstance);
}

/// Descriptor for a single-instance task: the frame plus its await list and
/// completion effects. This is the unit of work external callers construct.
pub struct TaskDescriptor<F> {
    frame: F,
    awaits: Vec<StageAwait>,
    signals: Vec<StageSignal>,
    increments: Vec<StageIncrement>,
}

impl<F: TaskFrame + Send + 'static> TaskDescriptor<F> {
    pub fn new(frame: F) -> Self {
        const {
            assert!(
                mem::size_of::<F>() <= MAX_TASK_FRAME_SIZE,
                "task frame exceeds the frame budget"
            );
            assert!(mem::align_of::<F>() <= ARENA_ALIGN);
        }
        Self {
            frame,
            awaits: Vec::new(),
            signals: Vec::new(),
            increments: Vec::new(),
        }
    }

    /// Gate execution on `semaphore` reaching `stage`
    /// ([`AWAIT_COMPLETION`] for the final stage).
    pub fn await_stage(mut self, semaphore: Arc<TimelineSemaphore>, stage: u64) -> Self {
        assert!(
            stage == AWAIT_COMPLETION || stage < semaphore.num_stages(),
            "await stage out of range"
        );
        self.awaits.push(StageAwait { semaphore, stage });
        self
    }

    /// Signal `semaphore` to the absolute `stage` after every run.
    pub fn signal_stage(mut self, semaphore: Arc<TimelineSemaphore>, stage: u64) -> Self {
        self.signals.push(StageSignal { semaphore, stage });
        self
    }

    /// Advance `semaphore` by `delta` stages after every run.
    pub fn increment_stage(mut self, semaphore: Arc<TimelineSemaphore>, delta: u64) -> Self {
        self.increments.push(StageIncrement { semaphore, delta });
        self
    }
}

/// Descriptor for a fan-out task: `instances` concurrent copies sharing one
/// frame, each handed a unique index from a shared counter.
pub struct ShardDescriptor<G> {
    frame: G,
    instances: u64,
    awaits: Vec<StageAwait>,
    signals: Vec<StageSignal>,
    increments: Vec<StageIncrement>,
}

impl<G: ShardFrame + Send + 'static> ShardDescriptor<G> {
    pub fn new(frame: G, instances: u64) -> Self {
        const {
            assert!(
                mem::size_of::<G>() <= MAX_TASK_FRAME_SIZE,
                "task frame exceeds the frame budget"
            );
            assert!(mem::align_of::<G>() <= ARENA_ALIGN);
        }
        assert!(instances >= 1, "a fan-out task needs at least one instance");
        assert!(instances <= u32::MAX as u64, "instance count exceeds u32 range");
        Self {
            frame,
            instances,
            awaits: Vec::new(),
            signals: Vec::new(),
            increments: Vec::new(),
        }
    }

    /// Gate every instance on `semaphore` reaching `stage`.
    pub fn await_stage(mut self, semaphore: Arc<TimelineSemaphore>, stage: u64) -> Self {
        assert!(
            stage == AWAIT_COMPLETION || stage < semaphore.num_stages(),
            "await stage out of range"
        );
        self.awaits.push(StageAwait { semaphore, stage });
        self
    }

    /// Signal `semaphore` to the absolute `stage` after every instance run.
    pub fn signal_stage(mut self, semaphore: Arc<TimelineSemaphore>, stage: u64) -> Self {
        self.signals.push(StageSignal { semaphore, stage });
        self
    }

    /// Advance `semaphore` by `delta` stages after every instance run.
    pub fn increment_stage(mut self, semaphore: Arc<TimelineSemaphore>, delta: u64) -> Self {
        self.increments.push(StageIncrement { semaphore, delta });
        self
    }
}

/// Erased entry points of a task, monomorphized per frame type.
pub(crate) struct TaskVTable {
    poll: unsafe fn(&RawTask) -> bool,
    run: unsafe fn(&RawTask) -> bool,
    drop_frame: unsafe fn(&RawTask),
}

/// In-arena array of effect entries. Plain pointer plus length; the entries
/// live in the task's own carve and are dropped by the last finishing
/// instance.
struct EffectList<T> {
    ptr: NonNull<T>,
    len: u32,
}

impl<T> EffectList<T> {
    /// # Safety
    ///
    /// The backing array must still be initialized.
    unsafe fn slice<'a>(&self) -> &'a [T] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize)
    }

    /// # Safety
    ///
    /// Must be called at most once, after all reads of the array.
    unsafe fn drop_in_place(&self) {
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
            self.ptr.as_ptr(),
            self.len as usize,
        ));
    }
}

/// Bookkeeping shared by the instances of a fan-out task.
struct InstanceShared {
    /// Next instance index to hand out.
    next_index: AtomicU64,

    /// Instances not yet finished; the last one drops the frame and lists.
    remaining: AtomicU64,

    instances: u64,
}

/// Task node header. Lives at the start of the task's arena carve; the
/// effect lists, the shared instance block, and the frame follow it in the
/// same carve. The queue links are touched only under the owning queue's
/// lock.
pub(crate) struct RawTask {
    pub(crate) next: Option<NonNull<RawTask>>,
    pub(crate) prev: Option<NonNull<RawTask>>,
    vtable: &'static TaskVTable,

    /// Arena this task was carved from; one alias is held per header.
    arena: ManuallyDrop<Arc<TaskArena>>,

    awaits: EffectList<StageAwait>,
    signals: EffectList<StageSignal>,
    increments: EffectList<StageIncrement>,

    /// Fan-out bookkeeping; `None` for single-instance tasks.
    shared: Option<NonNull<InstanceShared>>,

    frame: NonNull<u8>,
}

/// Exclusively owned reference to a task node.
///
/// Between queue transfers a node has exactly one owner: the queue it is
/// linked into, or the executor that popped it.
pub(crate) struct TaskRef(NonNull<RawTask>);

// SAFETY: frames are Send and a node has a single owner at a time
unsafe impl Send for TaskRef {}

impl TaskRef {
    pub(crate) fn into_node(self) -> NonNull<RawTask> {
        self.0
    }

    /// # Safety
    ///
    /// `node` must be an initialized, unlinked task node with no other
    /// owner.
    pub(crate) unsafe fn from_node(node: NonNull<RawTask>) -> Self {
        Self(node)
    }

    /// All awaits met (non-blocking snapshot) and the frame reports ready.
    pub(crate) fn is_ready(&mut self) -> bool {
        // SAFETY: the node is owned by this reference and fully initialized
        unsafe {
            let task = self.0.as_ref();
            if !await_semaphores(task.awaits.slice(), Duration::ZERO) {
                return false;
            }
            (task.vtable.poll)(task)
        }
    }

    /// Run the task, then apply its signal and increment lists regardless of
    /// the requeue decision. Returns that decision.
    pub(crate) fn execute(&mut self) -> bool {
        // SAFETY: the node is owned by this reference and fully initialized
        unsafe {
            let task = self.0.as_ref();
            let requeue = (task.vtable.run)(task);

            for signal in task.signals.slice() {
                let _ = signal.semaphore.signal(signal.stage);
            }
            for increment in task.increments.slice() {
                increment.semaphore.increment(increment.delta);
            }

            requeue
        }
    }

    /// Terminally release the task: drop the frame and effect lists (last
    /// finishing instance only for fan-out tasks), then release the arena
    /// alias, which may recycle the whole block.
    pub(crate) fn release(self, pool: &ArenaPool) {
        // SAFETY: the node is owned by this reference; nothing touches it
        // after the arena alias is released
        unsafe {
            let task = self.0.as_ptr();

            let last = match (*task).shared {
                Some(shared) => shared.as_ref().remaining.fetch_sub(1, Ordering::AcqRel) == 1,
                None => true,
            };
            if last {
                ((*task).vtable.drop_frame)(&*task);
                (*task).awaits.drop_in_place();
                (*task).signals.drop_in_place();
                (*task).increments.drop_in_place();
            }

            // the header itself lives in the arena: move the Arc out before
            // the alias release can recycle the block
            let arena = ManuallyDrop::into_inner(ptr::read(ptr::addr_of!((*task).arena)));
            pool.release(arena);
        }
    }
}

unsafe fn frame_poll<F: TaskFrame>(task: &RawTask) -> bool {
    // SAFETY: single-instance frames are owned by the executing thread
    (*task.frame.as_ptr().cast::<F>()).poll()
}

unsafe fn frame_run<F: TaskFrame>(task: &RawTask) -> bool {
    // SAFETY: single-instance frames are owned by the executing thread
    (*task.frame.as_ptr().cast::<F>()).run()
}

unsafe fn shard_poll<G: ShardFrame>(task: &RawTask) -> bool {
    // SAFETY: shard frames are Sync and only accessed by shared reference
    (*task.frame.as_ptr().cast::<G>().cast_const()).poll()
}

unsafe fn shard_run<G: ShardFrame>(task: &RawTask) -> bool {
    // SAFETY: shard frames are Sync and only accessed by shared reference
    let frame = &*task.frame.as_ptr().cast::<G>();
    let instance = match task.shared {
        Some(shared) => {
            let shared = shared.as_ref();
            TaskInstance {
                count: shared.instances,
                index: shared.next_index.fetch_add(1, Ordering::Relaxed),
            }
        }
        None => TaskInstance { count: 1, index: 0 },
    };
    frame.run_shard(instance);
    false
}

unsafe fn drop_frame_in_place<T>(task: &RawTask) {
    ptr::drop_in_place(task.frame.as_ptr().cast::<T>());
}

fn frame_vtable<F: TaskFrame + Send + 'static>() -> &'static TaskVTable {
    const {
        &TaskVTable {
            poll: frame_poll::<F>,
            run: frame_run::<F>,
            drop_frame: drop_frame_in_place::<F>,
        }
    }
}

fn shard_vtable<G: ShardFrame + Send + 'static>() -> &'static TaskVTable {
    const {
        &TaskVTable {
            poll: shard_poll::<G>,
            run: shard_run::<G>,
            drop_frame: drop_frame_in_place::<G>,
        }
    }
}

/// Create a single-instance task from `descriptor` and hand it to `enqueue`.
pub(crate) fn spawn_frame<F: TaskFrame + Send + 'static>(
    pool: &ArenaPool,
    descriptor: TaskDescriptor<F>,
    enqueue: impl FnMut(TaskRef),
) {
    let TaskDescriptor {
        frame,
        awaits,
        signals,
        increments,
    } = descriptor;

    // SAFETY: the vtable and layout are those of `F`, and the frame is moved
    // into the carve before any node is enqueued
    unsafe {
        create_instances(
            pool,
            frame_vtable::<F>(),
            Layout::new::<F>(),
            1,
            awaits,
            signals,
            increments,
            move |dst| unsafe { dst.cast::<F>().as_ptr().write(frame) },
            enqueue,
        );
    }
}

/// Create `descriptor.instances` task nodes sharing one frame and hand each
/// to `enqueue`.
pub(crate) fn spawn_shard<G: ShardFrame + Send + 'static>(
    pool: &ArenaPool,
    descriptor: ShardDescriptor<G>,
    enqueue: impl FnMut(TaskRef),
) {
    let ShardDescriptor {
        frame,
        instances,
        awaits,
        signals,
        increments,
    } = descriptor;

    // SAFETY: the vtable and layout are those of `G`, and the frame is moved
    // into the carve before any node is enqueued
    unsafe {
        create_instances(
            pool,
            shard_vtable::<G>(),
            Layout::new::<G>(),
            instances,
            awaits,
            signals,
            increments,
            move |dst| unsafe { dst.cast::<G>().as_ptr().write(frame) },
            enqueue,
        );
    }
}

/// Carve one allocation holding `instances` headers, the three effect
/// lists, the shared instance block (fan-out only), and the frame; then
/// initialize everything and enqueue the nodes.
///
/// # Safety
///
/// `vtable` and `frame_layout` must describe the frame `write_frame`
/// initializes, and the poll/run entry points must tolerate the sharing
/// discipline of `instances` (exclusive for 1, shared beyond that).
#[allow(clippy::too_many_arguments)]
unsafe fn create_instances(
    pool: &ArenaPool,
    vtable: &'static TaskVTable,
    frame_layout: Layout,
    instances: u64,
    awaits: Vec<StageAwait>,
    signals: Vec<StageSignal>,
    increments: Vec<StageIncrement>,
    write_frame: impl FnOnce(NonNull<u8>),
    mut enqueue: impl FnMut(TaskRef),
) {
    assert!(instances >= 1);
    assert!(awaits.len() <= u32::MAX as usize, "await list exceeds u32 range");
    assert!(signals.len() <= u32::MAX as usize, "signal list exceeds u32 range");
    assert!(
        increments.len() <= u32::MAX as usize,
        "increment list exceeds u32 range"
    );

    let n = instances as usize;
    let overflow = "task layout overflow";

    let layout = Layout::array::<RawTask>(n).expect(overflow);
    let (layout, awaits_offset) = layout
        .extend(Layout::array::<StageAwait>(awaits.len()).expect(overflow))
        .expect(overflow);
    let (layout, signals_offset) = layout
        .extend(Layout::array::<StageSignal>(signals.len()).expect(overflow))
        .expect(overflow);
    let (layout, increments_offset) = layout
        .extend(Layout::array::<StageIncrement>(increments.len()).expect(overflow))
        .expect(overflow);
    let (layout, shared_offset) = layout
        .extend(Layout::new::<InstanceShared>())
        .expect(overflow);
    let (layout, frame_offset) = layout.extend(frame_layout).expect(overflow);

    let (arena, carve) = pool.alloc(layout);
    // one alias per header; the pool already took the first
    for _ in 1..n {
        arena.alias();
    }

    let base = carve.as_ptr();

    let awaits_len = awaits.len() as u32;
    let awaits_ptr = base.add(awaits_offset).cast::<StageAwait>();
    for (i, entry) in awaits.into_iter().enumerate() {
        awaits_ptr.add(i).write(entry);
    }

    let signals_len = signals.len() as u32;
    let signals_ptr = base.add(signals_offset).cast::<StageSignal>();
    for (i, entry) in signals.into_iter().enumerate() {
        signals_ptr.add(i).write(entry);
    }

    let increments_len = increments.len() as u32;
    let increments_ptr = base.add(increments_offset).cast::<StageIncrement>();
    for (i, entry) in increments.into_iter().enumerate() {
        increments_ptr.add(i).write(entry);
    }

    let shared = if n > 1 {
        let shared = base.add(shared_offset).cast::<InstanceShared>();
        shared.write(InstanceShared {
            next_index: AtomicU64::new(0),
            remaining: AtomicU64::new(instances),
            instances,
        });
        Some(NonNull::new_unchecked(shared))
    } else {
        None
    };

    let frame = NonNull::new_unchecked(base.add(frame_offset));
    write_frame(frame);

    // everything the nodes point at is initialized; publish them
    let headers = base.cast::<RawTask>();
    for i in 0..n {
        let header = headers.add(i);
        header.write(RawTask {
            next: None,
            prev: None,
            vtable,
            arena: ManuallyDrop::new(arena.clone()),
            awaits: EffectList {
                ptr: NonNull::new_unchecked(awaits_ptr),
                len: awaits_len,
            },
            signals: EffectList {
                ptr: NonNull::new_unchecked(signals_ptr),
                len: signals_len,
            },
            increments: EffectList {
                ptr: NonNull::new_unchecked(increments_ptr),
                len: increments_len,
            },
            shared,
            frame,
        });
        enqueue(TaskRef(NonNull::new_unchecked(header)));
    }
}
