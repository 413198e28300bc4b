//! Task primitives: lifecycle states, event callbacks and result carriers
//! (spec.md §4.A).

mod callback;
mod function;
mod handle;
mod main_loop;
mod priority;
mod state;

pub use callback::{DeliverOn, HandlerToken};
pub(crate) use callback::{Action, CallbackRegistry, Handler, HandlerKind};
pub use function::{Function, ResultSlot};
pub use handle::{Task, TaskBody, TaskId, WeakTask};
pub(crate) use handle::{TaskSubmitter, TimeoutGuard};
pub use main_loop::MainLoop;
pub use priority::Priority;
pub use state::{Family, TaskState};

/// Every API that "returns a task" in spec.md returns this.
pub type TaskRef = std::sync::Arc<Task>;
