//! Delayed Lock Service (spec.md §4.F): a FIFO queue of lock requests that
//! couldn't be granted immediately, retried on every `locks_changed` event
//! from a [`LockManager`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::lock::{LockManager, Owner};
use crate::resource::{LockableResource, ResourceLockType};
use crate::scheduler::TaskScheduler;
use crate::task::{DeliverOn, TaskRef};

const TIMEOUT_POLL: Duration = Duration::from_millis(20);

/// A queued acquisition intent awaiting a favorable `locks_changed` event
/// (spec.md §3 `AsyncLock`, GLOSSARY "Delayed Lock").
#[derive(Clone)]
struct AsyncLock {
    id: u64,
    owner: Owner,
    resources: HashMap<LockableResource, ResourceLockType>,
    body: TaskRef,
    timeout_task: Option<TaskRef>,
    created_at: Instant,
}

/// Owns the retry queue and the `in_progress`/`missed_signal` pair that
/// serializes retry passes (spec.md §4.F).
pub struct DelayedLockService {
    self_ref: Weak<DelayedLockService>,
    scheduler: TaskScheduler,
    lock_manager: Arc<LockManager>,
    queue: Mutex<VecDeque<AsyncLock>>,
    in_progress: AtomicBool,
    missed_signal: AtomicBool,
    next_id: AtomicU64,
    last_task_ended_listeners: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl DelayedLockService {
    pub fn new(scheduler: TaskScheduler, lock_manager: Arc<LockManager>) -> Arc<Self> {
        let service = Arc::new_cyclic(|weak| DelayedLockService {
            self_ref: weak.clone(),
            scheduler,
            lock_manager: lock_manager.clone(),
            queue: Mutex::new(VecDeque::new()),
            in_progress: AtomicBool::new(false),
            missed_signal: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            last_task_ended_listeners: Mutex::new(Vec::new()),
        });

        let watcher = Arc::downgrade(&service);
        lock_manager.listen_locks_changed("", Vec::new(), false, move |_changes| {
            if let Some(service) = watcher.upgrade() {
                service.run_retry_pass();
            }
        });

        service
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("delayed lock service dropped while a method was running on it")
    }

    /// Queue length, for diagnostics and tests.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Registers `f` to run after any retry pass leaves the queue empty
    /// (spec.md §4.F `last_task_ended`).
    pub fn on_last_task_ended(&self, f: impl Fn() + Send + Sync + 'static) {
        self.last_task_ended_listeners.lock().push(Arc::new(f));
    }

    fn fire_last_task_ended(&self) {
        let listeners = self.last_task_ended_listeners.lock().clone();
        for l in listeners {
            l();
        }
    }

    /// spec.md §4.F submission: try immediately, else queue and arm a
    /// timeout.
    pub fn submit(
        &self,
        owner: Owner,
        resources: HashMap<LockableResource, ResourceLockType>,
        body: TaskRef,
        timeout_ms: i64,
        timeout_task: Option<TaskRef>,
    ) {
        if self.lock_manager.try_acquire_now(&owner, &resources) {
            self.start_body(body, owner, resources);
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back(AsyncLock {
            id,
            owner,
            resources,
            body: body.clone(),
            timeout_task: timeout_task.clone(),
            created_at: Instant::now(),
        });

        if timeout_ms > 0 {
            self.arm_timeout(id, timeout_ms, body, timeout_task);
        }
    }

    fn start_body(&self, body: TaskRef, owner: Owner, resources: HashMap<LockableResource, ResourceLockType>) {
        let lock_manager = self.lock_manager.clone();
        body.on_ended(DeliverOn::Caller, move |_task, _success| {
            lock_manager.release_now(&owner, &resources);
        });
        if let Err(e) = body.run_unmanaged(None) {
            warn!(error = %e, "delayed lock service could not start a granted body task");
        }
    }

    fn dequeue(&self, id: u64) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|e| e.id != id);
        queue.len() != before
    }

    fn arm_timeout(&self, id: u64, timeout_ms: i64, body: TaskRef, timeout_task: Option<TaskRef>) {
        let service = self.self_arc();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(0) as u64);
        let watcher = self.scheduler.spawn(Some("delayed-lock-timeout".into()), move |task| {
            while Instant::now() < deadline {
                if task.is_cancel_requested() {
                    return Ok(());
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(remaining.min(TIMEOUT_POLL));
            }
            if service.dequeue(id) {
                body.terminate();
                if let Some(timeout_task) = timeout_task {
                    if let Err(e) = timeout_task.run_unmanaged(None) {
                        warn!(error = %e, "delayed lock service could not start a timeout task");
                    }
                }
            }
            Ok(())
        });
        watcher.set_auto_remove(true);
        let _ = watcher.run_unmanaged(None);
    }

    /// Runs one retry pass immediately, or arranges for a fresh one to run
    /// as soon as the in-flight pass finishes (spec.md §4.F "missed
    /// signal").
    fn run_retry_pass(&self) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            self.missed_signal.store(true, Ordering::SeqCst);
            return;
        }
        loop {
            self.retry_once();
            if !self.missed_signal.swap(false, Ordering::SeqCst) {
                break;
            }
        }
        self.in_progress.store(false, Ordering::SeqCst);
    }

    /// A single scan of the queue in FIFO order; entries that grant are
    /// started and removed, the rest are left for the next pass (spec.md
    /// §4.F: "the pass is a single scan, no cross-entry reordering").
    fn retry_once(&self) {
        let snapshot: Vec<AsyncLock> = self.queue.lock().iter().cloned().collect();
        for entry in snapshot {
            if self.lock_manager.try_acquire_now(&entry.owner, &entry.resources) {
                self.dequeue(entry.id);
                self.start_body(entry.body, entry.owner, entry.resources);
            }
        }
        if self.queue.lock().is_empty() {
            self.fire_last_task_ended();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::context::CallerContext;
    use crate::entity::test_support::FakeEntityStore;
    use crate::scheduler::SchedulerConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fixture() -> (TaskScheduler, Arc<LockManager>, Arc<DelayedLockService>) {
        let scheduler = TaskScheduler::new(SchedulerConfig::default());
        let entities = Arc::new(FakeEntityStore::new().with_admin(1, "alice", "Alice").with_admin(2, "bob", "Bob"));
        let lock_manager = LockManager::new(scheduler.clone(), entities, Arc::new(SystemClock));
        let delayed = DelayedLockService::new(scheduler.clone(), lock_manager.clone());
        (scheduler, lock_manager, delayed)
    }

    fn resources(id: i64) -> HashMap<LockableResource, ResourceLockType> {
        HashMap::from([(LockableResource::row("User", id), ResourceLockType::Write)])
    }

    #[test]
    fn immediate_grant_runs_the_body_right_away() {
        let (scheduler, _lock_manager, delayed) = fixture();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let body = scheduler.spawn(None, move |_| {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });

        delayed.submit(Owner::Caller { admin_id: 1, token: "ta".into() }, resources(1), body.clone(), 0, None);
        assert!(body.wait_timeout(Duration::from_millis(500)));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(delayed.pending_count(), 0);
    }

    #[test]
    fn queued_request_is_granted_and_released_on_locks_changed() {
        let (scheduler, lock_manager, delayed) = fixture();
        let a = CallerContext::new("ta", "alice");
        let b_owner = Owner::Caller { admin_id: 2, token: "tb".into() };

        lock_manager.acquire_locks(resources(1), a.clone()).run_sync(true, None).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let body = scheduler.spawn(None, move |_| {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });

        delayed.submit(b_owner, resources(1), body.clone(), 0, None);
        assert_eq!(delayed.pending_count(), 1);

        lock_manager.release_locks(resources(1), a).run_sync(true, None).unwrap();

        assert!(body.wait_timeout(Duration::from_millis(500)));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(delayed.pending_count(), 0);

        let locks = lock_manager.get_locks("User").run_sync(true, None).unwrap();
        assert!(locks.is_empty(), "the delayed body's lock should be released once it ends");
    }

    #[test]
    fn timeout_terminates_body_and_runs_timeout_task() {
        let (scheduler, lock_manager, delayed) = fixture();
        let a = CallerContext::new("ta", "alice");
        lock_manager.acquire_locks(resources(1), a).run_sync(true, None).unwrap();

        let body = scheduler.spawn(None, |task| {
            loop {
                if task.is_cancel_requested() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        let timed_out = Arc::new(AtomicBool::new(false));
        let t = timed_out.clone();
        let timeout_task = scheduler.spawn(None, move |_| {
            t.store(true, Ordering::SeqCst);
            Ok(())
        });

        delayed.submit(
            Owner::Caller { admin_id: 2, token: "tb".into() },
            resources(1),
            body.clone(),
            50,
            Some(timeout_task.clone()),
        );

        assert!(timeout_task.wait_timeout(Duration::from_millis(1000)));
        assert!(timed_out.load(Ordering::SeqCst));
        assert_eq!(delayed.pending_count(), 0);
    }

    #[test]
    fn last_task_ended_fires_once_queue_drains() {
        let (scheduler, lock_manager, delayed) = fixture();
        let a = CallerContext::new("ta", "alice");
        lock_manager.acquire_locks(resources(1), a.clone()).run_sync(true, None).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        delayed.on_last_task_ended(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let body = scheduler.spawn(None, |_| Ok(()));
        delayed.submit(Owner::Caller { admin_id: 2, token: "tb".into() }, resources(1), body.clone(), 0, None);

        lock_manager.release_locks(resources(1), a).run_sync(true, None).unwrap();
        assert!(body.wait_timeout(Duration::from_millis(500)));
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
