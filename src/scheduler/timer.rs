//! Single-shot timeout timer.
//!
//! spec.md §4.B describes the timer as "bound to the main thread"; we
//! implement the same single-shot, re-armable semantics with one dedicated
//! timer thread driving a min-heap of deadlines instead, since this crate
//! does not assume the embedding application's UI loop ticks often enough
//! to drive timing itself. On expiry the task is transitioned to
//! `TimingOut` regardless of which thread its body is running on.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::task::{TaskRef, TimeoutGuard};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
struct ArmId(u64);

struct Armed {
    deadline: Instant,
    id: ArmId,
    task: TaskRef,
}

// Ordered by deadline, earliest first, via `Reverse` in the heap.
impl PartialEq for Armed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Armed {}
impl PartialOrd for Armed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Armed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<Armed>>,
    cancelled: std::collections::HashSet<ArmId>,
}

pub struct TimerService {
    state: Mutex<State>,
    wake: Condvar,
    next_id: AtomicU64,
}

/// A handle to an armed timeout; drop or call `disarm` to cancel it before
/// it fires.
pub struct TimerArm {
    service: Arc<TimerService>,
    id: ArmId,
}

impl TimerArm {
    pub fn disarm(self) {
        self.service.state.lock().cancelled.insert(self.id);
    }
}

impl TimeoutGuard for TimerArm {
    fn disarm(self: Box<Self>) {
        TimerArm::disarm(*self)
    }
}

impl TimerService {
    pub fn start() -> Arc<Self> {
        let service = Arc::new(Self {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            next_id: AtomicU64::new(1),
        });
        let driver = service.clone();
        std::thread::Builder::new()
            .name("collab-timer".into())
            .spawn(move || driver.drive())
            .expect("failed to spawn timer thread");
        service
    }

    /// Arms a one-shot timeout on `task`, firing `task.request_timeout()`
    /// after `ms` milliseconds unless disarmed first. `ms <= 0` means "no
    /// timeout" and is a no-op (spec.md §3).
    pub fn arm(self: &Arc<Self>, task: TaskRef, ms: i64) -> Option<TimerArm> {
        if ms <= 0 {
            return None;
        }
        let id = ArmId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + Duration::from_millis(ms as u64);
        {
            let mut state = self.state.lock();
            state.heap.push(Reverse(Armed { deadline, id, task }));
        }
        self.wake.notify_all();
        Some(TimerArm { service: self.clone(), id })
    }

    fn drive(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            match state.heap.peek() {
                None => {
                    self.wake.wait(&mut state);
                }
                Some(Reverse(top)) => {
                    let now = Instant::now();
                    if top.deadline <= now {
                        let Reverse(armed) = state.heap.pop().unwrap();
                        let was_cancelled = state.cancelled.remove(&armed.id);
                        if !was_cancelled {
                            parking_lot::MutexGuard::unlocked(&mut state, || {
                                armed.task.request_timeout();
                            });
                        }
                        continue;
                    }
                    let wait_for = top.deadline - now;
                    self.wake.wait_for(&mut state, wait_for);
                }
            }
        }
    }
}
