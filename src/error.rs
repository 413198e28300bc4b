use std::fmt;

/// Errors observable at the core boundary.
///
/// Terminal task outcomes (timeout, cancellation, termination) are *not*
/// represented here: they are observed through the corresponding callback
/// families (see [`crate::task`]), never raised as a `CoreError`.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// An unknown administrator name was used, or a null/invalid callback
    /// was registered.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was requested in a state that does not allow it, e.g.
    /// running an uninitialized task, re-running a running task, running
    /// the no-op task, or calling `get_result` without a set result.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// A task was handed to a scheduler that did not create it.
    #[error("task does not belong to this scheduler")]
    ForeignTask,

    /// The task body raised an error; the cause is stored on the task and
    /// surfaces here only when synchronously re-raised by `run_sync`.
    #[error("task body failed: {0}")]
    BodyFailure(#[source] BodyCause),

    /// A delayed-lock acquire attempt errored outright (as opposed to
    /// failing compatibility checks). The entry is dropped; this variant
    /// exists so the failure can be logged, it is never returned to a
    /// waiter per spec.
    #[error("delayed acquire failed: {0}")]
    AcquireFailure(String),
}

/// Opaque, cloneable carrier for a body failure cause.
///
/// Task bodies may fail with any `Send + Sync` error; we box it once and
/// keep a `Display`-friendly summary around so the cause can be cloned onto
/// both the failing task and a parent composition task (spec.md §4.B,
/// Sequence/Parallel "re-raises the first such cause").
#[derive(Clone)]
pub struct BodyCause(std::sync::Arc<dyn std::error::Error + Send + Sync + 'static>);

impl BodyCause {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(std::sync::Arc::new(err))
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for BodyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for BodyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for BodyCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug)]
struct MessageError(String);
impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::error::Error for MessageError {}

pub type CoreResult<T> = Result<T, CoreError>;
