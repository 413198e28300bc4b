use std::time::Duration;

use crate::error::BodyCause;
use crate::task::TaskRef;

use super::{core_err_to_cause, inherit_timeout, register_subtasks};
use crate::scheduler::TaskScheduler;

const POLL: Duration = Duration::from_millis(20);

/// Runs `children` concurrently. The parent finishes as soon as any child
/// finishes and cancels the rest; if every child ends without finishing,
/// the parent fails with one of their causes (spec.md §4.B).
pub fn attempt(scheduler: &TaskScheduler, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
    scheduler.grow_workers(1);
    let scheduler = scheduler.clone();
    let body_children = children.clone();
    let parent = scheduler.spawn(name, move |parent_task| {
        for child in &body_children {
            inherit_timeout(parent_task, child);
        }
        for child in &body_children {
            child.run_unmanaged(None).map_err(core_err_to_cause)?;
        }

        loop {
            if body_children.iter().any(|c| c.state().is_success()) {
                for c in &body_children {
                    if !c.state().is_terminal() {
                        c.cancel();
                    }
                }
                return Ok(());
            }
            if body_children.iter().all(|c| c.state().is_terminal()) {
                let cause = body_children
                    .iter()
                    .find_map(|c| c.failure_cause())
                    .unwrap_or_else(|| BodyCause::from_message("no child in the attempt finished"));
                return Err(cause);
            }
            if let Some(running) = body_children.iter().find(|c| !c.state().is_terminal()) {
                running.wait_timeout(POLL);
            }
        }
    });
    register_subtasks(&parent, &children);
    parent
}
