use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::main_loop::MainLoop;
use super::handle::Task;

/// Where a registered callback is actually invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOn {
    /// Run inline, on whatever thread is emitting the transition.
    Caller,
    /// Marshal onto the main/UI thread (spec.md §4.A "restore context").
    Main,
}

impl Default for DeliverOn {
    fn default() -> Self {
        DeliverOn::Main
    }
}

/// Opaque token returned by `on_*` registration, usable to remove the
/// handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl HandlerToken {
    pub(crate) fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum HandlerKind {
    Started,
    Finished,
    Failed,
    Canceled,
    TimedOut,
    Ended,
    Terminated,
    Progress,
}

pub(crate) enum Action {
    Basic(Arc<dyn Fn(&Task) + Send + Sync>),
    Ended(Arc<dyn Fn(&Task, bool) + Send + Sync>),
    Progress(Arc<dyn Fn(&Task, u8) + Send + Sync>),
}

impl Clone for Action {
    fn clone(&self) -> Self {
        match self {
            Action::Basic(a) => Action::Basic(a.clone()),
            Action::Ended(a) => Action::Ended(a.clone()),
            Action::Progress(a) => Action::Progress(a.clone()),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Handler {
    pub token: HandlerToken,
    pub kind: HandlerKind,
    pub deliver_on: DeliverOn,
    pub action: Action,
}

/// Per-task store of registered handlers. Registration order is preserved
/// within each [`HandlerKind`] since spec.md §5 requires handlers to
/// observe transitions "in that order".
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    handlers: Vec<Handler>,
}

impl CallbackRegistry {
    pub fn add(&mut self, kind: HandlerKind, deliver_on: DeliverOn, action: Action) -> HandlerToken {
        let token = HandlerToken::next();
        self.handlers.push(Handler { token, kind, deliver_on, action });
        token
    }

    pub fn remove(&mut self, token: HandlerToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| h.token != token);
        self.handlers.len() != before
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Snapshot of every handler of `kind`, in registration order. Cloning
    /// the `Arc`-backed actions here means emission never holds the task's
    /// own lock, so handlers are free to register/remove handlers of their
    /// own without deadlocking.
    pub fn snapshot(&self, kind: HandlerKind) -> Vec<Handler> {
        self.handlers.iter().filter(|h| h.kind == kind).cloned().collect()
    }
}

/// A single-use rendezvous used to block a worker thread until a callback
/// posted to the main loop has actually run, or the task it's bound to is
/// terminated. Modeled on the wakeup primitive used to implement blocking
/// `TaskHandle::wait` in the thread-pool reference file in the example
/// pack, simplified to a single pending/done bit.
pub(crate) struct Gate {
    state: Mutex<bool>,
    condvar: Condvar,
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

impl Gate {
    pub fn new() -> Self {
        Self { state: Mutex::new(false), condvar: Condvar::new() }
    }

    pub fn complete(&self) {
        let mut done = self.state.lock();
        *done = true;
        self.condvar.notify_all();
    }

    /// Blocks until `complete()` is called or `aborted()` starts returning
    /// true, whichever comes first.
    pub fn wait_unless(&self, aborted: impl Fn() -> bool) {
        let mut done = self.state.lock();
        while !*done && !aborted() {
            self.condvar.wait_for(&mut done, POLL_INTERVAL);
        }
    }
}

/// Delivers `f` according to `deliver_on`, blocking the caller until `f`
/// has actually run unless `is_aborted` starts returning true first (the
/// task having been terminated out from under the wait, per spec.md §4.A).
pub(crate) fn deliver(
    deliver_on: DeliverOn,
    main_loop: &MainLoop,
    is_aborted: impl Fn() -> bool + Send + Sync + 'static,
    f: impl FnOnce() + Send + 'static,
) {
    match deliver_on {
        DeliverOn::Caller => f(),
        DeliverOn::Main if main_loop.is_main_thread() => f(),
        DeliverOn::Main => {
            let gate = Arc::new(Gate::new());
            let gate_for_main = gate.clone();
            main_loop.post(move || {
                f();
                gate_for_main.complete();
            });
            gate.wait_unless(is_aborted);
        }
    }
}
