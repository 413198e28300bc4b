//! Fixed-size worker pool with a coarse priority bias.
//!
//! Grounded in the thread-pool reference file from the example pack (a
//! rayon-backed global pool with named workers); we use a plain
//! `crossbeam-channel` per priority tier instead of a work-stealing
//! scheduler, since spec.md §6 only asks that priority be "passed to the
//! underlying pool as integer hints", not that it be strictly observed
//! under contention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::task::{Priority, TaskRef};

const TIERS: usize = 5;

fn tier_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::AboveNormal => 1,
        Priority::Normal => 2,
        Priority::BelowNormal => 3,
        Priority::Low => 4,
    }
}

struct Job(TaskRef);

pub struct WorkerPool {
    senders: [Sender<Job>; TIERS],
    receivers: [Receiver<Job>; TIERS],
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// `min_workers` is clamped up to spec.md §6's default floor of 4.
    pub fn new(min_workers: usize) -> Arc<Self> {
        let worker_count = min_workers.max(4);
        let mut senders = Vec::with_capacity(TIERS);
        let mut receivers = Vec::with_capacity(TIERS);
        for _ in 0..TIERS {
            let (s, r) = bounded(4096);
            senders.push(s);
            receivers.push(r);
        }
        let pool = Arc::new(Self {
            senders: senders.try_into().ok().unwrap(),
            receivers: receivers.try_into().ok().unwrap(),
            workers: parking_lot::Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        pool.spawn_workers(worker_count);
        pool
    }

    /// Adds extra workers beyond the initial floor (spec.md §4.B:
    /// "ownership of a worker pool (minimum 4 workers, growable)").
    pub fn grow_by(self: &Arc<Self>, extra: usize) {
        self.spawn_workers(extra);
    }

    fn spawn_workers(self: &Arc<Self>, count: usize) {
        let mut guard = self.workers.lock();
        for i in 0..count {
            let pool = self.clone();
            let idx = guard.len() + i;
            let handle = std::thread::Builder::new()
                .name(format!("collab-worker-{idx}"))
                .spawn(move || pool.worker_loop())
                .expect("failed to spawn worker thread");
            guard.push(handle);
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.next_job() {
                Some(job) => job.0.execute(),
                None => continue, // timed out waiting; re-check shutdown flag
            }
        }
    }

    /// Pulls the next job, biased toward higher tiers, blocking briefly on
    /// the lowest tier so idle workers don't spin.
    fn next_job(&self) -> Option<Job> {
        for r in &self.receivers {
            if let Ok(job) = r.try_recv() {
                return Some(job);
            }
        }
        crossbeam_channel::select! {
            recv(self.receivers[0]) -> msg => msg.ok(),
            recv(self.receivers[1]) -> msg => msg.ok(),
            recv(self.receivers[2]) -> msg => msg.ok(),
            recv(self.receivers[3]) -> msg => msg.ok(),
            recv(self.receivers[4]) -> msg => msg.ok(),
            default(std::time::Duration::from_millis(50)) => None,
        }
    }

    pub fn submit(&self, task: TaskRef, priority: Priority) {
        let _ = self.senders[tier_index(priority)].send(Job(task));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
