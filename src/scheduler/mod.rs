//! Task Scheduler / Service (spec.md §4.B): owns the worker pool, task
//! registry, submission and priority propagation, and the four composition
//! operators.

pub mod compose;
mod pool;
mod timer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::BodyCause;
use crate::task::{
    Function, MainLoop, Priority, ResultSlot, Task, TaskBody, TaskRef, TaskSubmitter, TimeoutGuard,
    WeakTask,
};
use pool::WorkerPool;
use timer::TimerService;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables for a [`TaskScheduler`]; see spec.md §6 for the defaults.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool floor; clamped up to 4 (spec.md §6).
    pub min_workers: usize,
    /// Whether `run_sync` is allowed to block the main thread. Off by
    /// default (spec.md §4.A/§7: "synchronous run on main thread without
    /// opt-in" is a `PreconditionViolation`).
    pub allow_sync_on_main: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { min_workers: 4, allow_sync_on_main: false }
    }
}

struct SchedulerInner {
    id: u64,
    config: SchedulerConfig,
    pool: Arc<WorkerPool>,
    timers: Arc<TimerService>,
    main_loop: Arc<MainLoop>,
    thread_priority: Mutex<HashMap<ThreadId, Priority>>,
    registry: Mutex<Vec<WeakTask>>,
}

impl TaskSubmitter for SchedulerInner {
    fn submit(&self, task: Arc<Task>, priority: Priority) {
        self.pool.submit(task, priority);
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn arm_timeout(&self, task: Arc<Task>, ms: i64) -> Option<Box<dyn TimeoutGuard>> {
        self.timers.arm(task, ms).map(|g| Box::new(g) as Box<dyn TimeoutGuard>)
    }

    fn mark_running(&self, priority: Priority) {
        self.thread_priority.lock().insert(std::thread::current().id(), priority);
    }
}

/// Owns a worker pool and the [`MainLoop`] every task it creates delivers
/// callbacks through. A `Task` may only be run by the scheduler that
/// created it (spec.md §3, §7 `ForeignTask`).
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    main_loop: Arc<MainLoop>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let pool = WorkerPool::new(config.min_workers);
        let timers = TimerService::start();
        let main_loop = Arc::new(MainLoop::new());
        let inner = Arc::new(SchedulerInner {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            pool,
            timers,
            main_loop: main_loop.clone(),
            thread_priority: Mutex::new(HashMap::new()),
            registry: Mutex::new(Vec::new()),
        });
        Self { inner, main_loop }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn main_loop(&self) -> &Arc<MainLoop> {
        &self.main_loop
    }

    pub fn grow_workers(&self, extra: usize) {
        self.inner.pool.grow_by(extra);
    }

    /// Priority a newly-submitted task inherits when none is given
    /// explicitly: the priority of whatever task is currently running on
    /// the calling worker thread, else `Normal` (spec.md §4.B).
    fn inherited_priority(&self) -> Priority {
        self.inner
            .thread_priority
            .lock()
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or_default()
    }

    fn submitter(&self) -> Arc<dyn TaskSubmitter> {
        self.inner.clone()
    }

    /// Creates a task wrapping `body`, inheriting the caller's priority as
    /// its initial default (overridable at `run_unmanaged`/`run_sync`
    /// time).
    pub fn spawn(
        &self,
        name: Option<String>,
        body: impl FnOnce(&Task) -> Result<(), BodyCause> + Send + 'static,
    ) -> TaskRef {
        let task = Task::new(
            self.submitter(),
            self.main_loop.clone(),
            self.inner.config.allow_sync_on_main,
            Some(Box::new(body) as TaskBody),
            name,
        );
        task.set_initial_priority(self.inherited_priority());
        self.remember(&task);
        task
    }

    pub fn spawn_function<T, F>(&self, name: Option<String>, body: F) -> Function<T>
    where
        T: Send + Sync + Clone + 'static,
        F: FnOnce(&Task, ResultSlot<T>) -> Result<(), BodyCause> + Send + 'static,
    {
        let func = Function::new(
            self.submitter(),
            self.main_loop.clone(),
            self.inner.config.allow_sync_on_main,
            name,
            body,
        );
        func.task().set_initial_priority(self.inherited_priority());
        self.remember(func.task());
        func
    }

    /// A task with no body. Running it is a `PreconditionViolation`
    /// (spec.md §7).
    pub fn spawn_noop(&self) -> TaskRef {
        Task::no_op(self.submitter(), self.main_loop.clone())
    }

    fn remember(&self, task: &TaskRef) {
        let mut registry = self.inner.registry.lock();
        registry.retain(|w| w.strong_count() > 0);
        registry.push(Arc::downgrade(task));
    }

    /// Snapshot of every task this scheduler has created and not yet
    /// dropped, for diagnostics.
    pub fn live_tasks(&self) -> Vec<TaskRef> {
        self.inner
            .registry
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// Runs `children` in order; the first non-`Finished` outcome ends the
    /// parent with it and the rest never start (spec.md §4.B).
    pub fn sequence(&self, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
        compose::sequence(self, name, children)
    }

    /// Runs `children` in order; the first that `Finish`es ends the parent
    /// as `Finished` (spec.md §4.B).
    pub fn fallback(&self, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
        compose::fallback(self, name, children)
    }

    /// Runs `children` concurrently; the parent finishes only once all of
    /// them do (spec.md §4.B).
    pub fn parallel(&self, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
        compose::parallel(self, name, children)
    }

    /// Runs `children` concurrently; the parent finishes as soon as any one
    /// of them does (spec.md §4.B).
    pub fn attempt(&self, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
        compose::attempt(self, name, children)
    }
}
