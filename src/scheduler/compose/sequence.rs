use crate::error::BodyCause;
use crate::task::{TaskRef, TaskState};

use super::{core_err_to_cause, inherit_timeout, register_subtasks};
use crate::scheduler::TaskScheduler;

/// Runs `children` one after another. The first child that does not
/// `Finish` ends the parent with that same non-success outcome and the
/// remaining children never start (spec.md §4.B).
pub fn sequence(scheduler: &TaskScheduler, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
    let scheduler = scheduler.clone();
    let body_children = children.clone();
    let parent = scheduler.spawn(name, move |parent_task| {
        for child in &body_children {
            if parent_task.is_cancel_requested() {
                child.terminate();
                return Err(BodyCause::from_message("sequence cancelled before all children ran"));
            }
            inherit_timeout(parent_task, child);
            child.run_sync(false, None).map_err(core_err_to_cause)?;
            match child.state() {
                TaskState::Finished => continue,
                TaskState::Failed => {
                    return Err(child
                        .failure_cause()
                        .unwrap_or_else(|| BodyCause::from_message("sequence child failed")));
                }
                // The parent adopts the child's own terminal state rather
                // than failing generically (spec.md §4.B).
                TaskState::Canceled => {
                    parent_task.cancel();
                    return Ok(());
                }
                TaskState::TimedOut => {
                    parent_task.request_timeout();
                    return Ok(());
                }
                TaskState::Terminated => {
                    parent_task.terminate();
                    return Ok(());
                }
                other => {
                    return Err(BodyCause::from_message(format!(
                        "sequence child ended as {other:?}"
                    )));
                }
            }
        }
        Ok(())
    });
    register_subtasks(&parent, &children);
    parent
}
