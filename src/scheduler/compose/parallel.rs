use std::time::Duration;

use crate::error::BodyCause;
use crate::task::{TaskRef, TaskState};

use super::{core_err_to_cause, inherit_timeout, register_subtasks};
use crate::scheduler::TaskScheduler;

const POLL: Duration = Duration::from_millis(20);

/// Runs `children` concurrently. The parent finishes only once every child
/// has finished; the first child to end any other way cancels the rest and
/// the parent fails with that first cause. The controller borrows one
/// extra pool slot so its own blocking wait never starves the children it
/// is waiting on (spec.md §4.B).
pub fn parallel(scheduler: &TaskScheduler, name: Option<String>, children: Vec<TaskRef>) -> TaskRef {
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

        let mut failure: Option<BodyCause> = None;
        loop {
            let mut all_terminal = true;
            for child in &body_children {
                let state = child.state();
                if state == TaskState::Terminated {
                    // A terminated child carries no failure cause of its own;
                    // the parent mirrors the same fate rather than failing.
                    parent_task.terminate();
                    return Err(BodyCause::from_message("parallel child was terminated"));
                }
                if !state.is_terminal() {
                    all_terminal = false;
                } else if !state.is_success() && failure.is_none() {
                    failure = Some(
                        child
                            .failure_cause()
                            .unwrap_or_else(|| BodyCause::from_message(format!("parallel child ended as {state:?}"))),
                    );
                }
            }
            if failure.is_some() {
                for child in &body_children {
                    if !child.state().is_terminal() {
                        child.cancel();
                    }
                }
            }
            if all_terminal {
                break;
            }
            if let Some(running) = body_children.iter().find(|c| !c.state().is_terminal()) {
                running.wait_timeout(POLL);
            }
        }

        match failure {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    });
    register_subtasks(&parent, &children);
    parent
}
