/// Lifecycle state of a [`Task`](super::Task).
///
/// Every non-`NotStarted`, non-`Terminated` state has a single "pending"
/// (`…ing`) variant that is emitted before settling to its final twin, so a
/// handler always observes a stable state when invoked (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    NotStarted,
    Starting,
    Running,
    Finishing,
    Finished,
    Failing,
    Failed,
    Cancelling,
    Canceled,
    TimingOut,
    TimedOut,
    Terminated,
}

impl TaskState {
    pub fn is_pending(self) -> bool {
        use TaskState::*;
        matches!(self, Starting | Finishing | Failing | Cancelling | TimingOut)
    }

    pub fn is_terminal(self) -> bool {
        use TaskState::*;
        matches!(self, Finished | Failed | Canceled | TimedOut | Terminated)
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

/// One of the four settling transitions a `Running` task may take. Each has
/// a pending ("…ing") and a settled twin; `Terminated` is deliberately not
/// a `Family` member since it has no pending variant and is reachable from
/// any state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Finish,
    Fail,
    Cancel,
    Timeout,
}

impl Family {
    pub fn pending(self) -> TaskState {
        match self {
            Family::Finish => TaskState::Finishing,
            Family::Fail => TaskState::Failing,
            Family::Cancel => TaskState::Cancelling,
            Family::Timeout => TaskState::TimingOut,
        }
    }

    pub fn settled(self) -> TaskState {
        match self {
            Family::Finish => TaskState::Finished,
            Family::Fail => TaskState::Failed,
            Family::Cancel => TaskState::Canceled,
            Family::Timeout => TaskState::TimedOut,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Family::Finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_and_settled_round_trip() {
        for family in [Family::Finish, Family::Fail, Family::Cancel, Family::Timeout] {
            assert!(family.pending().is_pending());
            assert!(family.settled().is_terminal());
        }
    }

    #[test]
    fn only_finish_is_success() {
        assert!(Family::Finish.is_success());
        assert!(!Family::Fail.is_success());
        assert!(!Family::Cancel.is_success());
        assert!(!Family::Timeout.is_success());
    }
}
