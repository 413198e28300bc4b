use std::sync::Arc;

use parking_lot::Mutex;

use super::callback::DeliverOn;
use super::handle::{Task, TaskSubmitter};
use super::main_loop::MainLoop;
use super::priority::Priority;
use super::state::TaskState;
use crate::error::{BodyCause, CoreError, CoreResult};

/// A [`Task`] that additionally carries a typed result.
///
/// `set_result` is only legal while the underlying task is `Running`;
/// `get_result` fails if no result was ever set (spec.md §4.A).
pub struct Function<T> {
    task: Arc<Task>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send + Sync + Clone + 'static> Function<T> {
    pub(crate) fn new(
        scheduler: Arc<dyn TaskSubmitter>,
        main_loop: Arc<MainLoop>,
        allow_sync_on_main: bool,
        name: Option<String>,
        body: impl FnOnce(&Task, ResultSlot<T>) -> Result<(), BodyCause> + Send + 'static,
    ) -> Self {
        let slot = Arc::new(Mutex::new(None));
        let slot_for_body = slot.clone();
        let task = Task::new(
            scheduler,
            main_loop,
            allow_sync_on_main,
            Some(Box::new(move |t| body(t, ResultSlot { slot: slot_for_body }))),
            name,
        );
        Self { task, slot }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Reads the stored result. Fails if the task has not set one — either
    /// because it hasn't finished yet, or because it finished without ever
    /// calling [`ResultSlot::set`].
    pub fn get_result(&self) -> CoreResult<T> {
        self.slot
            .lock()
            .clone()
            .ok_or_else(|| CoreError::PreconditionViolation("no result has been set".into()))
    }

    /// Sugar over `on_finished`: delivers the typed result, or raises a
    /// `PreconditionViolation` if the task finished without ever setting
    /// one (spec.md §4.A).
    pub fn on_result_available(
        &self,
        deliver_on: DeliverOn,
        f: impl Fn(&Task, CoreResult<T>) + Send + Sync + 'static,
    ) -> super::callback::HandlerToken {
        let slot = self.slot.clone();
        self.task.on_finished(deliver_on, move |t| {
            let result = slot.lock().clone().ok_or_else(|| {
                CoreError::PreconditionViolation("finished without a result".into())
            });
            f(t, result);
        })
    }

    pub fn run_unmanaged(&self, priority: Option<Priority>) -> CoreResult<()> {
        self.task.run_unmanaged(priority)
    }

    pub fn run_sync(&self, rethrow_failure: bool, priority: Option<Priority>) -> CoreResult<T> {
        self.task.run_sync(rethrow_failure, priority)?;
        self.get_result()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }
}

/// Handed to a `Function<T>` body so it can publish its result. Wraps the
/// same invariant `set_result` carries in spec.md: only meaningful while
/// the task is still `Running`.
#[derive(Clone)]
pub struct ResultSlot<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> ResultSlot<T> {
    pub fn set(&self, task: &Task, value: T) -> CoreResult<()> {
        if task.state() != TaskState::Running {
            return Err(CoreError::PreconditionViolation(
                "set_result is only legal while the task is running".into(),
            ));
        }
        *self.slot.lock() = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskScheduler;
    use std::time::Duration;

    #[test]
    fn result_round_trips_through_finish() {
        let scheduler = TaskScheduler::new(Default::default());
        let func = scheduler.spawn_function::<i32, _>(Some("answer".into()), |task, slot| {
            slot.set(task, 42).map_err(BodyCause::new)
        });
        func.run_sync(true, None).unwrap();
        assert_eq!(func.get_result().unwrap(), 42);
    }

    #[test]
    fn missing_result_is_a_precondition_violation() {
        let scheduler = TaskScheduler::new(Default::default());
        let func = scheduler.spawn_function::<i32, _>(None, |_task, _slot| Ok(()));
        func.run_sync(true, None).unwrap();
        assert!(func.get_result().is_err());
    }

    #[allow(dead_code)]
    fn unused(_: Duration) {}
}
