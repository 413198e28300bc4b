//! Task Manager (spec.md §4.C): a scope guard that owns a set of weak task
//! references and cancels or awaits them when it goes out of scope.
//!
//! The original description tracks each managed task via a guard object
//! whose destructor auto-unregisters finished tasks; we get the same
//! effect idiomatically by hooking each task's `on_ended` callback instead
//! of modelling a separate guard type.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::task::{DeliverOn, TaskId, TaskRef, WeakTask};

/// What a manager does to a task it still owns when the manager itself is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// The manager's destruction awaits outstanding work; a task with this
    /// behavior still running at drop time is merely logged.
    WaitOnExit,
    /// The manager's destruction terminates the task outright.
    CancelOnExit,
}

/// Which [`Behavior`]s a [`TaskManager`] accepts, fixed at the type level
/// so a `CancellableOnly` manager cannot accidentally be asked to track a
/// `WaitOnExit` task (spec.md §4.C).
pub trait ManagerPolicy: Send + Sync + 'static {
    const ALLOWS_WAIT_ON_EXIT: bool;
}

/// Accepts `CancelOnExit` only.
pub struct CancellableOnly;
/// Accepts both behaviors; the root of a manager tree.
pub struct WaitOnExitEnabledRoot;
/// Accepts both behaviors; has a parent and forwards "tasks updated"
/// notifications upward.
pub struct WaitOnExitEnabledChild;

impl ManagerPolicy for CancellableOnly {
    const ALLOWS_WAIT_ON_EXIT: bool = false;
}
impl ManagerPolicy for WaitOnExitEnabledRoot {
    const ALLOWS_WAIT_ON_EXIT: bool = true;
}
impl ManagerPolicy for WaitOnExitEnabledChild {
    const ALLOWS_WAIT_ON_EXIT: bool = true;
}

struct Entry {
    task: WeakTask,
    behavior: Behavior,
}

/// Bubbles a "tasks changed" signal up to a parent manager, without the
/// parent needing to know the child's concrete policy type.
trait ParentLink: Send + Sync {
    fn child_changed(&self);
}

/// Lets a parent manager ask a child (of unknown concrete policy) whether
/// it still has `WaitOnExit` work outstanding.
trait ChildQuery: Send + Sync {
    fn has_pending_work(&self) -> bool;
}

struct Inner {
    entries: Vec<Entry>,
    children: Vec<Weak<dyn ChildQuery>>,
    listeners: Vec<Arc<dyn Fn() + Send + Sync>>,
    deleting: bool,
}

/// Scope guard over a set of tasks (spec.md §4.C). Construct via
/// [`TaskManager::root`], [`TaskManager::cancellable`] or
/// [`TaskManager::child`] depending on the tree position needed; the
/// generic parameter is one of [`CancellableOnly`], [`WaitOnExitEnabledRoot`]
/// or [`WaitOnExitEnabledChild`].
pub struct TaskManager<P: ManagerPolicy> {
    self_ref: Weak<TaskManager<P>>,
    inner: Mutex<Inner>,
    parent: Option<Arc<dyn ParentLink>>,
    _policy: PhantomData<P>,
}

impl<P: ManagerPolicy> TaskManager<P> {
    fn new_internal(parent: Option<Arc<dyn ParentLink>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| TaskManager {
            self_ref: weak.clone(),
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                children: Vec::new(),
                listeners: Vec::new(),
                deleting: false,
            }),
            parent,
            _policy: PhantomData,
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("manager dropped while a method was running on it")
    }

    /// Starts tracking `task` with the given behavior. Fails if `behavior`
    /// is `WaitOnExit` and this policy does not allow it, or if the
    /// manager is already being torn down.
    pub fn manage(&self, task: &TaskRef, behavior: Behavior) -> CoreResult<()> {
        if behavior == Behavior::WaitOnExit && !P::ALLOWS_WAIT_ON_EXIT {
            return Err(CoreError::PreconditionViolation(
                "this manager only accepts cancel-on-exit tasks".into(),
            ));
        }
        {
            let mut inner = self.inner.lock();
            if inner.deleting {
                return Err(CoreError::PreconditionViolation("manager is shutting down".into()));
            }
            inner.entries.push(Entry { task: Arc::downgrade(task), behavior });
        }
        self.fire_tasks_updated();

        let manager = self.self_arc();
        let id = task.id();
        task.on_ended(DeliverOn::Caller, move |_task, _success| {
            manager.unregister(id);
        });
        Ok(())
    }

    fn unregister(&self, id: TaskId) {
        let changed = {
            let mut inner = self.inner.lock();
            let before = inner.entries.len();
            inner.entries.retain(|e| e.task.upgrade().map(|t| t.id() != id).unwrap_or(false));
            inner.entries.len() != before
        };
        if changed {
            self.fire_tasks_updated();
        }
    }

    /// True iff any `WaitOnExit` task is still managed here or in a
    /// descendant manager (spec.md §4.C).
    pub fn pending_work(&self) -> bool {
        let inner = self.inner.lock();
        let own = inner
            .entries
            .iter()
            .any(|e| e.behavior == Behavior::WaitOnExit && e.task.strong_count() > 0);
        if own {
            return true;
        }
        inner.children.iter().any(|w| w.upgrade().map(|c| c.has_pending_work()).unwrap_or(false))
    }

    /// Registers a listener fired whenever a task is added, removed, or a
    /// descendant manager's set changes (spec.md §4.C: "forwards the
    /// tasks-updated signal so a UI observer sees aggregate state").
    pub fn on_tasks_updated(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().listeners.push(Arc::new(f));
    }

    fn fire_tasks_updated(&self) {
        let listeners = self.inner.lock().listeners.clone();
        for l in listeners {
            l();
        }
        if let Some(parent) = &self.parent {
            parent.child_changed();
        }
    }

    /// Snapshot of currently-managed tasks still alive, for diagnostics.
    pub fn managed_tasks(&self) -> Vec<TaskRef> {
        self.inner.lock().entries.iter().filter_map(|e| e.task.upgrade()).collect()
    }
}

impl TaskManager<CancellableOnly> {
    pub fn cancellable() -> Arc<Self> {
        Self::new_internal(None)
    }
}

impl TaskManager<WaitOnExitEnabledRoot> {
    pub fn root() -> Arc<Self> {
        Self::new_internal(None)
    }
}

impl TaskManager<WaitOnExitEnabledChild> {
    /// Creates a child manager linked to `parent`: its `pending_work`
    /// contributes to the parent's, and its "tasks updated" signal bubbles
    /// up to the parent's listeners.
    pub fn child<R: ManagerPolicy>(parent: &Arc<TaskManager<R>>) -> Arc<Self> {
        let link: Arc<dyn ParentLink> = parent.clone();
        let mgr = Self::new_internal(Some(link));
        let dyn_mgr: Arc<dyn ChildQuery> = mgr.clone();
        let query: Weak<dyn ChildQuery> = Arc::downgrade(&dyn_mgr);
        parent.inner.lock().children.push(query);
        mgr
    }
}

impl<P: ManagerPolicy> ParentLink for TaskManager<P> {
    fn child_changed(&self) {
        self.fire_tasks_updated();
    }
}

impl<P: ManagerPolicy> ChildQuery for TaskManager<P> {
    fn has_pending_work(&self) -> bool {
        self.pending_work()
    }
}

impl<P: ManagerPolicy> Drop for TaskManager<P> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.deleting = true;
        for entry in inner.entries.drain(..) {
            let Some(task) = entry.task.upgrade() else { continue };
            match entry.behavior {
                Behavior::CancelOnExit => task.terminate(),
                Behavior::WaitOnExit => {
                    warn!(task = task.id().value(), "manager dropped with a wait-on-exit task still outstanding");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskScheduler;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn cancellable_only_rejects_wait_on_exit() {
        let scheduler = TaskScheduler::new(Default::default());
        let manager = TaskManager::<CancellableOnly>::cancellable();
        let task = scheduler.spawn_noop();
        assert!(manager.manage(&task, Behavior::WaitOnExit).is_err());
        assert!(manager.manage(&task, Behavior::CancelOnExit).is_ok());
    }

    #[test]
    fn dropping_terminates_cancel_on_exit_tasks() {
        let scheduler = TaskScheduler::new(Default::default());
        let task = scheduler.spawn(None, |task| {
            while !task.is_cancel_requested() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        task.run_unmanaged(None).unwrap();
        {
            let manager = TaskManager::<CancellableOnly>::cancellable();
            manager.manage(&task, Behavior::CancelOnExit).unwrap();
        }
        assert!(task.wait_timeout(Duration::from_millis(500)));
        assert_eq!(task.state(), crate::task::TaskState::Terminated);
    }

    #[test]
    fn finished_tasks_auto_unregister() {
        let scheduler = TaskScheduler::new(Default::default());
        let manager = TaskManager::<WaitOnExitEnabledRoot>::root();
        let task = scheduler.spawn(None, |_| Ok(()));
        manager.manage(&task, Behavior::WaitOnExit).unwrap();
        assert!(manager.pending_work());
        task.run_sync(true, None).unwrap();
        assert!(!manager.pending_work());
        assert!(manager.managed_tasks().is_empty());
    }

    #[test]
    fn child_pending_work_surfaces_on_root() {
        let scheduler = TaskScheduler::new(Default::default());
        let root = TaskManager::<WaitOnExitEnabledRoot>::root();
        let child = TaskManager::<WaitOnExitEnabledChild>::child(&root);

        let notified = Arc::new(AtomicBool::new(false));
        let n = notified.clone();
        root.on_tasks_updated(move || n.store(true, Ordering::SeqCst));

        let task = scheduler.spawn(None, |task| {
            while !task.is_cancel_requested() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        task.run_unmanaged(None).unwrap();
        child.manage(&task, Behavior::WaitOnExit).unwrap();

        assert!(root.pending_work());
        assert!(notified.load(Ordering::SeqCst));

        task.cancel();
        assert!(task.wait_timeout(Duration::from_millis(500)));
        assert!(!root.pending_work());
    }
}
