use std::time::Instant;

use crate::resource::{LockableResource, ResourceLockType};

/// Identifies who holds a lock: a logged-in administrator's session, or a
/// system-initiated lock tagged with a free-form string (spec.md §9: the
/// `std::variant<CallerContext, QString>` from the original description
/// becomes this tagged sum).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Caller { admin_id: i64, token: String },
    System { tag: String },
}

impl Owner {
    /// Bucket an owner's locks live under in the lock table (spec.md §3:
    /// "mapping admin_id -> ordered list of ResourceLock"; system locks use
    /// the reserved `admin_id = -1` bucket).
    pub(crate) fn bucket_key(&self) -> i64 {
        match self {
            Owner::Caller { admin_id, .. } => *admin_id,
            Owner::System { .. } => -1,
        }
    }

    /// Exact-identity match used by the acquire scan to decide whether an
    /// existing lock is "ours": same `(admin_id, token)` for a caller lock,
    /// same `tag` for a system lock. A caller and a system owner never
    /// match each other.
    pub(crate) fn is_same_owner(&self, other: &Owner) -> bool {
        match (self, other) {
            (Owner::Caller { admin_id: a1, token: t1 }, Owner::Caller { admin_id: a2, token: t2 }) => {
                a1 == a2 && t1 == t2
            }
            (Owner::System { tag: a }, Owner::System { tag: b }) => a == b,
            _ => false,
        }
    }
}

/// A single held lock (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLock {
    pub(crate) id: u64,
    pub resource: LockableResource,
    pub lock_type: ResourceLockType,
    pub acquired_at: Instant,
    pub expires_at: Instant,
    pub owner: Owner,
}

impl ResourceLock {
    pub(crate) fn new(
        resource: LockableResource,
        lock_type: ResourceLockType,
        acquired_at: Instant,
        expires_at: Instant,
        owner: Owner,
    ) -> Self {
        Self { id: 0, resource, lock_type, acquired_at, expires_at, owner }
    }

    pub fn resource_key(&self) -> String {
        self.resource.resource_key()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }
}

/// One entry of a `locks_changed` notification: a lock that disappeared, one
/// that appeared, or (not currently emitted, see spec.md §4.E step 3) both.
#[derive(Debug, Clone)]
pub struct LockChange {
    pub before: Option<ResourceLock>,
    pub after: Option<ResourceLock>,
}

impl LockChange {
    pub(crate) fn removed(old: ResourceLock) -> Self {
        Self { before: Some(old), after: None }
    }

    pub(crate) fn added(new: ResourceLock) -> Self {
        Self { before: None, after: Some(new) }
    }

    fn reference_lock(&self) -> &ResourceLock {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .expect("a lock change always carries a before or an after")
    }

    /// The owning caller's session token, for `ignore_own` filtering. `None`
    /// for system locks, which never match a listener's own token.
    pub(crate) fn owner_token(&self) -> Option<&str> {
        match &self.reference_lock().owner {
            Owner::Caller { token, .. } => Some(token.as_str()),
            Owner::System { .. } => None,
        }
    }

    pub(crate) fn entity_set(&self) -> &str {
        &self.reference_lock().resource.entity_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_owners_match_on_admin_id_and_token() {
        let a = Owner::Caller { admin_id: 1, token: "ta".into() };
        let b = Owner::Caller { admin_id: 1, token: "ta".into() };
        let c = Owner::Caller { admin_id: 1, token: "tb".into() };
        assert!(a.is_same_owner(&b));
        assert!(!a.is_same_owner(&c));
    }

    #[test]
    fn system_owners_match_on_tag_only() {
        let a = Owner::System { tag: "import".into() };
        let b = Owner::System { tag: "import".into() };
        let c = Owner::Caller { admin_id: -1, token: String::new() };
        assert!(a.is_same_owner(&b));
        assert!(!a.is_same_owner(&c));
    }
}
