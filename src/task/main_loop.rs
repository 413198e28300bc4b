//! Distinguished "UI thread" target for callback delivery.
//!
//! Modeled after the queued-invocation pattern used to marshal background
//! results back onto a UI thread (see the thread-pool reference file in the
//! example pack for the shape this takes in a Qt/GUI-adjacent Rust
//! codebase): a plain MPMC channel of boxed closures that whichever thread
//! owns the event loop drains by calling [`MainLoop::run_pending`].

use std::thread::ThreadId;

use crossbeam_channel::{unbounded, Receiver, Sender};

type Posted = Box<dyn FnOnce() + Send + 'static>;

pub struct MainLoop {
    main_thread: ThreadId,
    sender: Sender<Posted>,
    receiver: Receiver<Posted>,
}

impl MainLoop {
    /// Creates a loop and marks the calling thread as "main". All
    /// `DeliverOn::Main` callbacks invoked from any other thread are queued
    /// here until [`MainLoop::run_pending`] is called on this thread.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            main_thread: std::thread::current().id(),
            sender,
            receiver,
        }
    }

    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }

    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        // The receiving side only ever goes away with the loop itself, and
        // we hold an `Arc<MainLoop>` everywhere a sender is handed out, so
        // a dropped receiver cannot happen while `post` is reachable.
        let _ = self.sender.send(Box::new(f));
    }

    /// Drains and runs every closure currently queued, without blocking for
    /// more. Intended to be called periodically by whatever owns the event
    /// loop (e.g. once per GUI frame/tick).
    pub fn run_pending(&self) {
        while let Ok(f) = self.receiver.try_recv() {
            f();
        }
    }

    /// Blocks until at least one queued closure has run, or `timeout`
    /// elapses. Returns whether anything ran.
    pub fn run_one(&self, timeout: std::time::Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(f) => {
                f();
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn posted_work_runs_on_drain() {
        let main = MainLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        main.post(move || ran2.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        main.run_pending();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn current_thread_is_main_until_moved() {
        let main = MainLoop::new();
        assert!(main.is_main_thread());
        let handle = std::thread::spawn(move || main.is_main_thread());
        assert!(!handle.join().unwrap());
    }
}
