//! Composition operators (spec.md §4.B): parent tasks whose body runs,
//! waits on and judges a fixed set of children instead of doing work
//! itself. Each operator spawns the parent through the same
//! [`TaskScheduler`](super::TaskScheduler) the caller used, so it inherits
//! the same priority, main loop and removal policy as any other task.

mod attempt;
mod fallback;
mod parallel;
mod sequence;

pub use attempt::attempt;
pub use fallback::fallback;
pub use parallel::parallel;
pub use sequence::sequence;

use std::sync::Arc;

use crate::error::{BodyCause, CoreError};
use crate::task::{Task, TaskRef};

/// A child with no explicit timeout of its own inherits the parent's, set
/// fresh on every child start so sequential and concurrent children alike
/// each get their own independently-armed timer (spec.md §4.B).
fn inherit_timeout(parent: &Task, child: &TaskRef) {
    let parent_timeout = parent.timeout_ms();
    if parent_timeout > 0 && child.timeout_ms() <= 0 {
        child.set_timeout(parent_timeout);
    }
}

fn core_err_to_cause(e: CoreError) -> BodyCause {
    BodyCause::new(e)
}

/// Registers every child as a subtask of `parent` so terminating the
/// parent cascades to children that are still running (spec.md §4.A).
fn register_subtasks(parent: &TaskRef, children: &[TaskRef]) {
    for child in children {
        parent.add_subtask(Arc::downgrade(child));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskScheduler;
    use crate::task::TaskState;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn sequence_runs_in_order_and_stops_on_failure() {
        let scheduler = TaskScheduler::new(Default::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let c1 = scheduler.spawn(Some("c1".into()), move |_| {
            o.lock().unwrap().push(1);
            Ok(())
        });
        let o = order.clone();
        let c2 = scheduler.spawn(Some("c2".into()), move |_| {
            o.lock().unwrap().push(2);
            Err(BodyCause::from_message("boom"))
        });
        let o = order.clone();
        let c3 = scheduler.spawn(Some("c3".into()), move |_| {
            o.lock().unwrap().push(3);
            Ok(())
        });

        let parent = sequence(&scheduler, None, vec![c1, c2, c3]);
        parent.run_sync(false, None).unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(parent.state(), TaskState::Failed);
    }

    #[test]
    fn fallback_stops_at_first_success() {
        let scheduler = TaskScheduler::new(Default::default());
        let tried = Arc::new(Mutex::new(Vec::new()));

        let t = tried.clone();
        let c1 = scheduler.spawn(None, move |_| {
            t.lock().unwrap().push(1);
            Err(BodyCause::from_message("no"))
        });
        let t = tried.clone();
        let c2 = scheduler.spawn(None, move |_| {
            t.lock().unwrap().push(2);
            Ok(())
        });
        let t = tried.clone();
        let c3 = scheduler.spawn(None, move |_| {
            t.lock().unwrap().push(3);
            Ok(())
        });

        let parent = fallback(&scheduler, None, vec![c1, c2, c3]);
        parent.run_sync(false, None).unwrap();

        assert_eq!(*tried.lock().unwrap(), vec![1, 2]);
        assert_eq!(parent.state(), TaskState::Finished);
    }

    #[test]
    fn parallel_fails_with_first_cause_and_cancels_rest() {
        let scheduler = TaskScheduler::new(Default::default());

        let c1 = scheduler.spawn(None, |_| {
            std::thread::sleep(Duration::from_millis(10));
            Err(BodyCause::from_message("first"))
        });
        let c2 = scheduler.spawn(None, |task| {
            for _ in 0..50 {
                if task.is_cancel_requested() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        });

        let parent = parallel(&scheduler, None, vec![c1, c2.clone()]);
        parent.run_sync(false, None).unwrap();

        assert_eq!(parent.state(), TaskState::Failed);
        assert_eq!(c2.state(), TaskState::Canceled);
    }

    #[test]
    fn attempt_returns_as_soon_as_any_finishes() {
        let scheduler = TaskScheduler::new(Default::default());

        let fast = scheduler.spawn(None, |_| Ok(()));
        let slow = scheduler.spawn(None, |task| {
            for _ in 0..50 {
                if task.is_cancel_requested() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        });

        let parent = attempt(&scheduler, None, vec![fast, slow.clone()]);
        parent.run_sync(false, None).unwrap();

        assert_eq!(parent.state(), TaskState::Finished);
        assert!(slow.wait_timeout(Duration::from_millis(500)));
        assert_eq!(slow.state(), TaskState::Canceled);
    }
}
