//! Collaboration concurrency core: an async task engine (lifecycle states,
//! callbacks, composition operators, a scheduler and a scope-guarding task
//! manager) paired with a resource lock manager and a delayed lock service,
//! for coordinating several administrators editing shared entities at once.

pub mod clock;
pub mod context;
pub mod delayed;
pub mod entity;
pub mod error;
pub mod lock;
pub mod manager;
pub mod resource;
pub mod scheduler;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::CallerContext;
pub use delayed::DelayedLockService;
pub use entity::{AdminRef, EntityStore};
pub use error::{BodyCause, CoreError, CoreResult};
pub use lock::{LockChange, LockManager, ListenerToken, Owner, ResourceLock};
pub use manager::{Behavior, CancellableOnly, ManagerPolicy, TaskManager, WaitOnExitEnabledChild, WaitOnExitEnabledRoot};
pub use resource::{LockableResource, ResourceLockType};
pub use scheduler::{SchedulerConfig, TaskScheduler};
pub use task::{DeliverOn, Function, HandlerToken, Priority, Task, TaskId, TaskRef, TaskState};
