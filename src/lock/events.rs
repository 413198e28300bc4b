//! `locks_changed` listener registry (spec.md §4.E, §5): dispatch is
//! serialized through the same mutex that guards the listener list, with a
//! cloned snapshot taken before any callback runs so a listener is free to
//! register or remove another listener from within its own callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::types::LockChange;

/// Opaque handle returned by [`super::LockManager::listen_locks_changed`],
/// used to remove the listener again. The original description identifies a
/// listener by the callback pointer itself ("stop by callback"); a token is
/// the idiomatic substitute already used for task handlers
/// ([`crate::task::HandlerToken`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

impl ListenerToken {
    fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

struct Listener {
    token: ListenerToken,
    own_token: String,
    filter: Vec<String>,
    ignore_own: bool,
    callback: Arc<dyn Fn(&[LockChange]) + Send + Sync>,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<Listener>>>,
}

impl ListenerRegistry {
    pub fn add(
        &self,
        own_token: String,
        filter: Vec<String>,
        ignore_own: bool,
        callback: Arc<dyn Fn(&[LockChange]) + Send + Sync>,
    ) -> ListenerToken {
        let token = ListenerToken::next();
        self.listeners.lock().push(Arc::new(Listener { token, own_token, filter, ignore_own, callback }));
        token
    }

    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.token != token);
        listeners.len() != before
    }

    /// Dispatches each listener's subset of `changes` on the calling
    /// thread. A listener whose `filter` is non-empty only sees changes
    /// whose entity set is in the filter; `ignore_own` additionally drops
    /// changes whose owning token equals the listener's own.
    pub fn dispatch(&self, changes: &[LockChange]) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let relevant: Vec<LockChange> = changes
                .iter()
                .filter(|c| {
                    if listener.ignore_own {
                        if let Some(tok) = c.owner_token() {
                            if tok == listener.own_token {
                                return false;
                            }
                        }
                    }
                    listener.filter.is_empty() || listener.filter.iter().any(|s| s == c.entity_set())
                })
                .cloned()
                .collect();
            if !relevant.is_empty() {
                (listener.callback)(&relevant);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::types::{Owner, ResourceLock};
    use crate::resource::{LockableResource, ResourceLockType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn dummy_change(entity_set: &str, token: &str) -> LockChange {
        let now = Instant::now();
        LockChange::added(ResourceLock::new(
            LockableResource::row(entity_set, 1),
            ResourceLockType::Write,
            now,
            now,
            Owner::Caller { admin_id: 1, token: token.into() },
        ))
    }

    #[test]
    fn filter_restricts_to_named_entity_sets() {
        let registry = ListenerRegistry::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        registry.add("tb".into(), vec!["Fruit".into()], false, Arc::new(move |changes| {
            s.fetch_add(changes.len(), Ordering::SeqCst);
        }));

        registry.dispatch(&[dummy_change("User", "ta")]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        registry.dispatch(&[dummy_change("Fruit", "ta")]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ignore_own_drops_changes_with_matching_token() {
        let registry = ListenerRegistry::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        registry.add("ta".into(), Vec::new(), true, Arc::new(move |changes| {
            s.fetch_add(changes.len(), Ordering::SeqCst);
        }));

        registry.dispatch(&[dummy_change("User", "ta")]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        registry.dispatch(&[dummy_change("User", "tb")]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_receives_nothing_further() {
        let registry = ListenerRegistry::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let token = registry.add("tb".into(), Vec::new(), false, Arc::new(move |changes| {
            s.fetch_add(changes.len(), Ordering::SeqCst);
        }));
        assert!(registry.remove(token));
        registry.dispatch(&[dummy_change("User", "ta")]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
