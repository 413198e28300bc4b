//! Resource Lock Manager (spec.md §4.E): an advisory, timed, reader/writer
//! lock registry keyed by `(resource-set, instance-id)`, with caller-context
//! ownership and change notifications fanned out to interested listeners.
//!
//! The lock table is a plain `parking_lot::Mutex<LockTable>` rather than the
//! reentrant mutex the scanning algorithm's original description calls for
//! (spec.md §9 explicitly allows this): every operation collects its
//! evictions, renewals and creations in the scan proper
//! ([`table::scan`]/[`table::acquire`]/[`table::renew_if_possible`]) and
//! takes the table lock exactly once per call, so there is never a
//! recursive acquisition to support.

mod events;
mod manager;
mod table;
mod types;

pub use events::ListenerToken;
pub use manager::LockManager;
pub use types::{LockChange, Owner, ResourceLock};

use std::time::Duration;

/// Default time-to-live for a newly created or renewed lock (spec.md §6).
pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(120);
