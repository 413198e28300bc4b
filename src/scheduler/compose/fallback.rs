use crate::error::BodyCause;
use crate::task::TaskRef;

use super::{core_err_to_cause, inherit_timeout, register_subtasks};
use crate::scheduler::TaskScheduler;

/// Runs `children` one after another. The first child that `Finish`es ends
/// the parent as `Finished`; if every child runs out without one, the
/// parent fails with the last child's cause (spec.md §4.B).
pub fn fallback(scheduler: &TaskScheduler, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
    let scheduler = scheduler.clone();
    let body_children = children.clone();
    let parent = scheduler.spawn(name, move |parent_task| {
        let mut last_cause = None;
        for child in &body_children {
            if parent_task.is_cancel_requested() {
                child.terminate();
                return Err(BodyCause::from_message("fallback cancelled before any child finished"));
            }
            inherit_timeout(parent_task, child);
            child.run_sync(false, None).map_err(core_err_to_cause)?;
            if child.state().is_success() {
                return Ok(());
            }
            last_cause = child.failure_cause().or(last_cause);
        }
        Err(last_cause.unwrap_or_else(|| BodyCause::from_message("no child in the fallback finished")))
    });
    register_subtasks(&parent, &children);
    parent
}
