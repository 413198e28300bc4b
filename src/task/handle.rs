use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::trace;

use super::callback::{deliver, Action, CallbackRegistry, DeliverOn, Handler, HandlerKind, HandlerToken};
use super::main_loop::MainLoop;
use super::priority::Priority;
use super::state::{Family, TaskState};
use crate::error::{BodyCause, CoreError, CoreResult};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque task identifier, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// The callable a [`Task`] wraps. Receives the task itself so the body can
/// cooperatively check `task.is_cancel_requested()` / report progress.
pub type TaskBody = Box<dyn FnOnce(&Task) -> Result<(), BodyCause> + Send + 'static>;

/// Submission seam back to the owning scheduler, so `Task` does not need to
/// know the scheduler's concrete type. `id()` backs the `ForeignTask` check
/// (spec.md §7): a task may only be run by the scheduler that created it.
pub(crate) trait TaskSubmitter: Send + Sync {
    fn submit(&self, task: Arc<Task>, priority: Priority);
    fn id(&self) -> u64;
    /// Arms a one-shot timeout, returning a guard to disarm it early. `None`
    /// if `ms <= 0` (no timeout requested).
    fn arm_timeout(&self, task: Arc<Task>, ms: i64) -> Option<Box<dyn TimeoutGuard>>;
    /// Records `priority` as the priority running on the calling (worker)
    /// thread right now, so a task spawned from inside this task's body
    /// inherits it (spec.md §4.B). Called from `Task::execute` once the
    /// task has actually started running, not at submission time.
    fn mark_running(&self, priority: Priority);
}

/// Cancels a previously armed timeout. Implemented by the scheduler's timer
/// service; kept as a trait object here so `task` does not need to depend
/// on the scheduler's concrete timer type.
pub(crate) trait TimeoutGuard: Send {
    fn disarm(self: Box<Self>);
}

pub(crate) struct TaskCore {
    pub state: TaskState,
    pub priority: Priority,
    pub timeout_ms: i64,
    pub progress: u8,
    pub auto_remove: bool,
    pub failure_cause: Option<BodyCause>,
    pub maintained: SmallVec<[Arc<dyn Any + Send + Sync>; 2]>,
    pub subtasks: Vec<Weak<Task>>,
    pub callbacks: CallbackRegistry,
    pub remove_requested: bool,
    pub removed: bool,
}

/// One of the four settling transitions a running task can take, plus the
/// initial `Starting -> Running` step. Carried separately from
/// [`Family`](super::state::Family) because `Starting` has no "is this a
/// terminal family" notion and is reachable only from `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Settle(Family),
}

impl Phase {
    fn source(self) -> TaskState {
        match self {
            Phase::Start => TaskState::NotStarted,
            Phase::Settle(_) => TaskState::Running,
        }
    }
    fn pending(self) -> TaskState {
        match self {
            Phase::Start => TaskState::Starting,
            Phase::Settle(f) => f.pending(),
        }
    }
    fn settled(self) -> TaskState {
        match self {
            Phase::Start => TaskState::Running,
            Phase::Settle(f) => f.settled(),
        }
    }
    fn handler_kind(self) -> HandlerKind {
        match self {
            Phase::Start => HandlerKind::Started,
            Phase::Settle(Family::Finish) => HandlerKind::Finished,
            Phase::Settle(Family::Fail) => HandlerKind::Failed,
            Phase::Settle(Family::Cancel) => HandlerKind::Canceled,
            Phase::Settle(Family::Timeout) => HandlerKind::TimedOut,
        }
    }
}

/// Unit of asynchronous work with a lifecycle state machine (spec.md §3).
///
/// `Task`s are always held behind an `Arc` (aliased nowhere to keep the
/// ownership story explicit to readers); every API that "returns a task"
/// in spec.md returns `Arc<Task>`. `self_ref` lets the handful of methods
/// that must hand `self` to another thread (submission, callback delivery)
/// recover an `Arc<Task>` from a plain `&self` receiver.
pub struct Task {
    id: TaskId,
    name: Option<String>,
    scheduler: Arc<dyn TaskSubmitter>,
    main_loop: Arc<MainLoop>,
    allow_sync_on_main: bool,
    self_ref: Weak<Task>,
    body: Mutex<Option<TaskBody>>,
    core: Mutex<TaskCore>,
    terminal_cv: Condvar,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

pub type WeakTask = Weak<Task>;

impl Task {
    pub(crate) fn new(
        scheduler: Arc<dyn TaskSubmitter>,
        main_loop: Arc<MainLoop>,
        allow_sync_on_main: bool,
        body: Option<TaskBody>,
        name: Option<String>,
    ) -> Arc<Task> {
        Arc::new_cyclic(|weak| Task {
            id: TaskId::next(),
            name,
            scheduler,
            main_loop,
            allow_sync_on_main,
            self_ref: weak.clone(),
            body: Mutex::new(body),
            core: Mutex::new(TaskCore {
                state: TaskState::NotStarted,
                priority: Priority::Normal,
                timeout_ms: 0,
                progress: 0,
                auto_remove: false,
                failure_cause: None,
                maintained: SmallVec::new(),
                subtasks: Vec::new(),
                callbacks: CallbackRegistry::default(),
                remove_requested: false,
                removed: false,
            }),
            terminal_cv: Condvar::new(),
        })
    }

    /// A task with no body; running it is a `PreconditionViolation`.
    pub(crate) fn no_op(scheduler: Arc<dyn TaskSubmitter>, main_loop: Arc<MainLoop>) -> Arc<Task> {
        Self::new(scheduler, main_loop, false, None, Some("no-op".into()))
    }

    /// Recovers the `Arc<Task>` backing this handle, for the few call
    /// sites that must hand ownership to another thread.
    fn self_arc(&self) -> Arc<Task> {
        self.self_ref.upgrade().expect("task dropped while a method was running on it")
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> TaskState {
        self.core.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.core.lock().priority
    }

    pub fn progress(&self) -> u8 {
        self.core.lock().progress
    }

    pub fn timeout_ms(&self) -> i64 {
        self.core.lock().timeout_ms
    }

    pub fn is_removed(&self) -> bool {
        self.core.lock().removed
    }

    pub fn failure_cause(&self) -> Option<BodyCause> {
        self.core.lock().failure_cause.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        matches!(self.state(), TaskState::Cancelling | TaskState::Terminated)
    }

    pub fn belongs_to(&self, scheduler_id: u64) -> bool {
        self.scheduler.id() == scheduler_id
    }

    pub(crate) fn scheduler_id(&self) -> u64 {
        self.scheduler.id()
    }

    // -- configuration -----------------------------------------------

    pub fn set_timeout(&self, ms: i64) {
        self.core.lock().timeout_ms = ms;
    }

    /// Sets the task's priority before it has been run. Used by the
    /// scheduler to implement priority inheritance at creation time
    /// (spec.md §4.B); has no effect once the task has left `NotStarted`.
    pub(crate) fn set_initial_priority(&self, p: Priority) {
        let mut core = self.core.lock();
        if core.state == TaskState::NotStarted {
            core.priority = p;
        }
    }

    pub fn set_auto_remove(&self, enabled: bool) {
        self.core.lock().auto_remove = enabled;
    }

    pub fn report_progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.core.lock().progress = percent;
        let handlers = self.core.lock().callbacks.snapshot(HandlerKind::Progress);
        for h in handlers {
            self.invoke_progress(&h, percent);
        }
    }

    pub fn store_failure(&self, cause: BodyCause) {
        self.core.lock().failure_cause = Some(cause);
    }

    pub fn maintain(&self, object: Arc<dyn Any + Send + Sync>) {
        self.core.lock().maintained.push(object);
    }

    pub(crate) fn add_subtask(&self, sub: WeakTask) {
        self.core.lock().subtasks.push(sub);
    }

    pub(crate) fn subtasks(&self) -> Vec<WeakTask> {
        self.core.lock().subtasks.clone()
    }

    // -- running --------------------------------------------------------

    pub fn run_unmanaged(&self, priority: Option<Priority>) -> CoreResult<()> {
        self.begin(priority)
    }

    pub fn run_sync(&self, rethrow_failure: bool, priority: Option<Priority>) -> CoreResult<()> {
        if self.main_loop.is_main_thread() && !self.allow_sync_on_main {
            return Err(CoreError::PreconditionViolation(
                "run_sync on the main thread requires explicit opt-in".into(),
            ));
        }
        self.begin(priority)?;
        self.block_until_terminal();
        if rethrow_failure && self.state() == TaskState::Failed {
            if let Some(cause) = self.failure_cause() {
                return Err(CoreError::BodyFailure(cause));
            }
        }
        Ok(())
    }

    fn begin(&self, priority: Option<Priority>) -> CoreResult<()> {
        if self.is_removed() {
            return Err(CoreError::PreconditionViolation("task already removed".into()));
        }
        if self.body.lock().is_none() {
            return Err(CoreError::PreconditionViolation("cannot run a no-op task".into()));
        }
        {
            let mut core = self.core.lock();
            if core.state != TaskState::NotStarted {
                return Err(CoreError::PreconditionViolation(format!(
                    "task already {:?}",
                    core.state
                )));
            }
            if let Some(p) = priority {
                core.priority = p;
            }
        }
        let effective_priority = self.priority();
        self.scheduler.submit(self.self_arc(), effective_priority);
        Ok(())
    }

    fn block_until_terminal(&self) {
        let mut core = self.core.lock();
        while !core.state.is_terminal() {
            self.terminal_cv.wait(&mut core);
        }
    }

    /// Called by the worker that popped this task off the pool queue. Runs
    /// `Starting -> Running`, executes the body, then drives the matching
    /// settling transition unless the body itself already moved the task
    /// somewhere else (spec.md §4.B).
    pub(crate) fn execute(&self) {
        if !self.transition(Phase::Start) {
            return;
        }
        self.scheduler.mark_running(self.priority());
        let timeout_ms = self.timeout_ms();
        let timer_guard = self.scheduler.arm_timeout(self.self_arc(), timeout_ms);
        let body = self.body.lock().take();
        let result = match body {
            Some(b) => b(self),
            None => Ok(()),
        };
        if let Some(guard) = timer_guard {
            guard.disarm();
        }
        match self.state() {
            TaskState::Running => match result {
                Ok(()) => {
                    self.transition(Phase::Settle(Family::Finish));
                }
                Err(cause) => {
                    self.core.lock().failure_cause = Some(cause);
                    self.transition(Phase::Settle(Family::Fail));
                }
            },
            // `cancel()` only moves the task into this pending state and
            // leaves settling to whichever worker observes the body
            // returning, so the body's own `is_cancel_requested` poll has a
            // real window to see it (spec.md §5).
            TaskState::Cancelling => {
                self.settle_pending(Phase::Settle(Family::Cancel));
            }
            TaskState::TimingOut => {
                self.transition(Phase::Settle(Family::Timeout));
            }
            _ => {
                // Terminated (or already settled by a reentrant call):
                // nothing left to drive.
                if let Err(cause) = result {
                    self.core.lock().failure_cause = Some(cause);
                }
            }
        }
        self.maybe_auto_remove();
    }

    /// Requests cancellation of a running task and cascades the same
    /// request to its subtasks. Only moves `Running -> Cancelling`; the
    /// body is expected to notice `is_cancel_requested()` and return on its
    /// own, at which point `execute` settles `Cancelling -> Canceled`
    /// (mirroring how `request_timeout` hands off to the worker, except
    /// timeout settling doesn't need to wait on a cooperative body check).
    pub fn cancel(&self) {
        if !self.enter_pending(Phase::Settle(Family::Cancel)) {
            return;
        }
        for weak in self.subtasks() {
            if let Some(sub) = weak.upgrade() {
                sub.cancel();
            }
        }
    }

    pub(crate) fn request_timeout(&self) {
        self.transition(Phase::Settle(Family::Timeout));
    }

    pub fn terminate(&self) {
        let already = {
            let mut core = self.core.lock();
            if core.state == TaskState::Terminated {
                true
            } else {
                core.state = TaskState::Terminated;
                false
            }
        };
        if already {
            return;
        }
        trace!(task = self.id.0, "terminated");
        self.terminal_cv.notify_all();
        let handlers = self.core.lock().callbacks.snapshot(HandlerKind::Terminated);
        for h in handlers {
            self.invoke_basic(&h);
        }
        for weak in self.subtasks() {
            if let Some(sub) = weak.upgrade() {
                sub.terminate();
            }
        }
        self.maybe_auto_remove();
    }

    pub fn remove(&self) {
        let mut core = self.core.lock();
        core.removed = true;
        core.callbacks.clear();
    }

    pub fn remove_later(&self) {
        self.core.lock().remove_requested = true;
    }

    fn maybe_auto_remove(&self) {
        let mut core = self.core.lock();
        if core.state.is_terminal() && (core.auto_remove || core.remove_requested) {
            core.removed = true;
            core.callbacks.clear();
        }
    }

    /// Drives one full settling transition: moves into `phase.pending()`
    /// then immediately settles it. Returns whether the task actually
    /// reached `phase.settled()`. Used by phases that don't need a window
    /// for outside observers between the two halves; `Cancel` instead
    /// drives `enter_pending`/`settle_pending` separately so a polling
    /// body gets a chance to observe `Cancelling`.
    fn transition(&self, phase: Phase) -> bool {
        if !self.enter_pending(phase) {
            return false;
        }
        self.settle_pending(phase)
    }

    /// Moves the task from `phase.source()` into `phase.pending()`. Returns
    /// whether the move happened (the source state matched).
    fn enter_pending(&self, phase: Phase) -> bool {
        let mut core = self.core.lock();
        if core.state != phase.source() {
            return false;
        }
        core.state = phase.pending();
        drop(core);
        trace!(task = self.id.0, state = ?phase.pending(), "entered pending state");
        true
    }

    /// Fires the handlers registered for `phase` and, if nothing hijacked
    /// the state in the meantime (e.g. a concurrent `terminate()`), moves
    /// the task from `phase.pending()` into `phase.settled()`. Returns
    /// whether settlement actually landed on `phase.settled()`.
    fn settle_pending(&self, phase: Phase) -> bool {
        let handlers = self.core.lock().callbacks.snapshot(phase.handler_kind());
        for h in handlers {
            if self.state() != phase.pending() {
                break; // interrupted, e.g. concurrent terminate()
            }
            self.invoke_basic(&h);
        }

        let final_state = {
            let mut core = self.core.lock();
            if core.state == phase.pending() {
                core.state = phase.settled();
            }
            core.state
        };
        if final_state.is_terminal() {
            self.terminal_cv.notify_all();
        }
        trace!(task = self.id.0, state = ?final_state, "settled");

        if let Phase::Settle(family) = phase {
            if final_state == phase.settled() {
                let handlers = self.core.lock().callbacks.snapshot(HandlerKind::Ended);
                for h in handlers {
                    self.invoke_ended(&h, family.is_success());
                }
            }
        }
        final_state == phase.settled()
    }

    // -- callback registration -------------------------------------------

    fn add(&self, kind: HandlerKind, deliver_on: DeliverOn, action: Action) -> HandlerToken {
        self.core.lock().callbacks.add(kind, deliver_on, action)
    }

    pub fn on_started(&self, deliver_on: DeliverOn, f: impl Fn(&Task) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Started, deliver_on, Action::Basic(Arc::new(f)))
    }
    pub fn on_finished(&self, deliver_on: DeliverOn, f: impl Fn(&Task) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Finished, deliver_on, Action::Basic(Arc::new(f)))
    }
    pub fn on_failed(&self, deliver_on: DeliverOn, f: impl Fn(&Task) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Failed, deliver_on, Action::Basic(Arc::new(f)))
    }
    pub fn on_canceled(&self, deliver_on: DeliverOn, f: impl Fn(&Task) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Canceled, deliver_on, Action::Basic(Arc::new(f)))
    }
    pub fn on_timeout(&self, deliver_on: DeliverOn, f: impl Fn(&Task) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::TimedOut, deliver_on, Action::Basic(Arc::new(f)))
    }
    pub fn on_terminated(&self, deliver_on: DeliverOn, f: impl Fn(&Task) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Terminated, deliver_on, Action::Basic(Arc::new(f)))
    }
    pub fn on_ended(&self, deliver_on: DeliverOn, f: impl Fn(&Task, bool) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Ended, deliver_on, Action::Ended(Arc::new(f)))
    }
    pub fn on_progress(&self, deliver_on: DeliverOn, f: impl Fn(&Task, u8) + Send + Sync + 'static) -> HandlerToken {
        self.add(HandlerKind::Progress, deliver_on, Action::Progress(Arc::new(f)))
    }

    pub fn remove_handler(&self, token: HandlerToken) -> bool {
        self.core.lock().callbacks.remove(token)
    }

    fn is_terminated(&self) -> bool {
        self.state() == TaskState::Terminated
    }

    fn invoke_basic(&self, h: &Handler) {
        if let Action::Basic(f) = h.action.clone() {
            let task = self.self_arc();
            let guard = self.self_arc();
            deliver(h.deliver_on, &self.main_loop, move || guard.is_terminated(), move || f(&task));
        }
    }

    fn invoke_ended(&self, h: &Handler, success: bool) {
        if let Action::Ended(f) = h.action.clone() {
            let task = self.self_arc();
            let guard = self.self_arc();
            deliver(h.deliver_on, &self.main_loop, move || guard.is_terminated(), move || {
                f(&task, success)
            });
        }
    }

    fn invoke_progress(&self, h: &Handler, percent: u8) {
        if let Action::Progress(f) = h.action.clone() {
            let task = self.self_arc();
            let guard = self.self_arc();
            deliver(h.deliver_on, &self.main_loop, move || guard.is_terminated(), move || {
                f(&task, percent)
            });
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut core = self.core.lock();
        if core.state.is_terminal() {
            return true;
        }
        let result = self.terminal_cv.wait_for(&mut core, timeout);
        core.state.is_terminal() || !result.timed_out()
    }
}
