//! The lock table itself and the pure scanning/applying algorithm behind
//! `acquire_locks`, `renew_if_possible` and `release_locks` (spec.md §4.E).
//! Kept free of scheduling and entity-resolution concerns so it can be unit
//! tested directly against a table and a clock reading.

use std::collections::HashMap;
use std::time::Instant;

use crate::resource::{LockableResource, ResourceLockType};

use super::types::{LockChange, Owner, ResourceLock};
use super::DEFAULT_TTL;

#[derive(Default)]
pub(crate) struct LockTable {
    by_admin: HashMap<i64, Vec<ResourceLock>>,
    next_id: u64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn all_matching<'a>(&'a self, resource: &'a LockableResource) -> impl Iterator<Item = &'a ResourceLock> {
        self.by_admin.values().flatten().filter(move |l| l.resource.matches(resource))
    }

    pub fn find(&self, id: u64) -> Option<&ResourceLock> {
        self.by_admin.values().flatten().find(|l| l.id == id)
    }

    pub fn find_mut(&mut self, id: u64) -> Option<&mut ResourceLock> {
        self.by_admin.values_mut().flatten().find(|l| l.id == id)
    }

    pub fn remove(&mut self, id: u64) -> Option<ResourceLock> {
        for locks in self.by_admin.values_mut() {
            if let Some(pos) = locks.iter().position(|l| l.id == id) {
                return Some(locks.remove(pos));
            }
        }
        None
    }

    pub fn insert(&mut self, mut lock: ResourceLock) -> u64 {
        let id = self.next_id();
        lock.id = id;
        self.by_admin.entry(lock.owner.bucket_key()).or_default().push(lock);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceLock> {
        self.by_admin.values().flatten()
    }
}

/// Result of scanning every requested `(resource, type)` pair against the
/// table: lock ids staged for renewal, requests no existing "ours" lock
/// satisfied, and any expired foreign locks evicted along the way (these
/// are committed to `table` immediately regardless of overall outcome,
/// spec.md §8 invariant 5).
struct ScanOutcome {
    renewals: Vec<u64>,
    unmet: Vec<(LockableResource, ResourceLockType)>,
    changes: Vec<LockChange>,
}

/// Shared first half of the acquire/renew algorithm (spec.md §4.E steps 1-2).
/// Returns `Err(changes)` the moment an incompatible, non-expired foreign
/// lock is found — `changes` still carries whatever expired locks were
/// evicted before the conflict was hit.
fn scan(
    table: &mut LockTable,
    now: Instant,
    owner: &Owner,
    wants: &[(LockableResource, ResourceLockType)],
) -> Result<ScanOutcome, Vec<LockChange>> {
    let mut changes = Vec::new();
    let mut renewals = Vec::new();
    let mut unmet = Vec::new();

    for (resource, want_type) in wants {
        let mut satisfied = false;
        let candidate_ids: Vec<u64> = table.all_matching(resource).map(|l| l.id).collect();
        for id in candidate_ids {
            let Some(lock) = table.find(id) else { continue };
            if owner.is_same_owner(&lock.owner) {
                if lock.lock_type == *want_type {
                    renewals.push(id);
                    satisfied = true;
                }
                // A held lock of a different type doesn't satisfy this
                // request; a separate lock for the new type is created.
                continue;
            }
            if lock.is_expired(now) {
                if let Some(evicted) = table.remove(id) {
                    changes.push(LockChange::removed(evicted));
                }
                continue;
            }
            if lock.lock_type.compatible_with(*want_type) {
                continue;
            }
            return Err(changes);
        }
        if !satisfied {
            unmet.push((resource.clone(), *want_type));
        }
    }

    Ok(ScanOutcome { renewals, unmet, changes })
}

fn apply_renewals(table: &mut LockTable, now: Instant, renewals: &[u64]) {
    for &id in renewals {
        if let Some(lock) = table.find_mut(id) {
            lock.expires_at = now + DEFAULT_TTL;
        }
    }
}

/// `acquire_locks` / `acquire_system_locks` body (spec.md §4.E). All-or-
/// nothing: on failure no renewal or creation is applied, but evictions of
/// already-expired foreign locks observed during the scan remain.
pub(crate) fn acquire(
    table: &mut LockTable,
    now: Instant,
    owner: &Owner,
    wants: &[(LockableResource, ResourceLockType)],
) -> (bool, Vec<LockChange>) {
    let ScanOutcome { renewals, unmet, mut changes } = match scan(table, now, owner, wants) {
        Ok(outcome) => outcome,
        Err(changes) => return (false, changes),
    };

    apply_renewals(table, now, &renewals);
    for (resource, want_type) in unmet {
        let lock = ResourceLock::new(resource, want_type, now, now + DEFAULT_TTL, owner.clone());
        changes.push(LockChange::added(lock.clone()));
        table.insert(lock);
    }
    (true, changes)
}

/// `renew_if_possible` body: succeeds only if every requested resource is
/// already held by `owner` with the matching type, i.e. `unmet` ends up
/// empty (spec.md §4.E, §9 open question on the type-mismatch corner case —
/// a held lock of a different type still counts as "unmet" here, so renewal
/// fails rather than silently granting a second lock).
pub(crate) fn renew_if_possible(
    table: &mut LockTable,
    now: Instant,
    owner: &Owner,
    wants: &[(LockableResource, ResourceLockType)],
) -> (bool, Vec<LockChange>) {
    let ScanOutcome { renewals, unmet, changes } = match scan(table, now, owner, wants) {
        Ok(outcome) => outcome,
        Err(changes) => return (false, changes),
    };
    if !unmet.is_empty() {
        return (false, changes);
    }
    apply_renewals(table, now, &renewals);
    (true, changes)
}

/// `release_locks` / `release_system_locks` body. Only releases locks that
/// are both owned by `owner` and match the requested resource and type
/// exactly — unlike acquire's scan, release never treats a set-wide and a
/// row-level resource as interchangeable.
pub(crate) fn release(
    table: &mut LockTable,
    owner: &Owner,
    wants: &[(LockableResource, ResourceLockType)],
) -> Vec<LockChange> {
    let mut changes = Vec::new();
    for (resource, want_type) in wants {
        let ids: Vec<u64> = table
            .iter()
            .filter(|l| l.resource == *resource && l.lock_type == *want_type && owner.is_same_owner(&l.owner))
            .map(|l| l.id)
            .collect();
        for id in ids {
            if let Some(removed) = table.remove(id) {
                changes.push(LockChange::removed(removed));
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn owner(id: i64, token: &str) -> Owner {
        Owner::Caller { admin_id: id, token: token.into() }
    }

    #[test]
    fn two_compatible_reads_then_incompatible_write_fails() {
        let mut table = LockTable::new();
        let now = Instant::now();
        let a = owner(1, "ta");
        let b = owner(2, "tb");

        let wants = vec![(LockableResource::row("User", 1), ResourceLockType::Read)];
        let (ok, _) = acquire(&mut table, now, &a, &wants);
        assert!(ok);
        let (ok, _) = acquire(&mut table, now, &b, &wants);
        assert!(ok);

        let write = vec![(LockableResource::row("User", 1), ResourceLockType::Write)];
        let (ok, changes) = acquire(&mut table, now, &a, &write);
        assert!(!ok);
        assert!(changes.is_empty());
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn expired_foreign_lock_is_evicted_and_new_owner_granted() {
        let mut table = LockTable::new();
        let t0 = Instant::now();
        let a = owner(1, "ta");
        let b = owner(2, "tb");

        let wants = vec![(LockableResource::row("Fruit", 7), ResourceLockType::Write)];
        acquire(&mut table, t0, &a, &wants);

        let t1 = t0 + Duration::from_secs(121);
        let (ok, changes) = acquire(&mut table, t1, &b, &wants);
        assert!(ok);
        assert_eq!(changes.len(), 2);
        assert!(changes[0].before.is_some() && changes[0].after.is_none());
        assert!(changes[1].before.is_none() && changes[1].after.is_some());
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.iter().next().unwrap().owner, b);
    }

    #[test]
    fn renew_if_possible_fails_when_a_new_lock_would_be_needed() {
        let mut table = LockTable::new();
        let now = Instant::now();
        let a = owner(1, "ta");

        let held = vec![(LockableResource::row("User", 1), ResourceLockType::Read)];
        acquire(&mut table, now, &a, &held);

        let extra = vec![
            (LockableResource::row("User", 1), ResourceLockType::Read),
            (LockableResource::row("User", 2), ResourceLockType::Read),
        ];
        let (ok, _) = renew_if_possible(&mut table, now, &a, &extra);
        assert!(!ok);
        assert_eq!(table.iter().count(), 1, "no new lock should have been created");
    }

    #[test]
    fn renew_if_possible_pushes_expiry_forward() {
        let mut table = LockTable::new();
        let t0 = Instant::now();
        let a = owner(1, "ta");
        let held = vec![(LockableResource::row("User", 1), ResourceLockType::Read)];
        acquire(&mut table, t0, &a, &held);

        let t1 = t0 + Duration::from_secs(60);
        let (ok, _) = renew_if_possible(&mut table, t1, &a, &held);
        assert!(ok);
        assert_eq!(table.iter().next().unwrap().expires_at, t1 + DEFAULT_TTL);
    }

    #[test]
    fn release_round_trips_to_an_empty_table() {
        let mut table = LockTable::new();
        let now = Instant::now();
        let a = owner(1, "ta");
        let wants = vec![(LockableResource::row("User", 1), ResourceLockType::Write)];
        acquire(&mut table, now, &a, &wants);
        assert_eq!(table.iter().count(), 1);

        let changes = release(&mut table, &a, &wants);
        assert_eq!(changes.len(), 1);
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn set_wide_request_conflicts_with_existing_row_lock() {
        let mut table = LockTable::new();
        let now = Instant::now();
        let a = owner(1, "ta");
        let b = owner(2, "tb");
        acquire(&mut table, now, &a, &[(LockableResource::row("User", 1), ResourceLockType::Write)]);

        let (ok, _) = acquire(&mut table, now, &b, &[(LockableResource::set_wide("User"), ResourceLockType::Write)]);
        assert!(!ok);
    }
}
