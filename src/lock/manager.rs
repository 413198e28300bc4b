//! Public API of the Resource Lock Manager (spec.md §4.E): resolves
//! `CallerContext`s against an [`EntityStore`], runs the table algorithm in
//! `table.rs` under a single mutex acquisition, and fans change lists out
//! through the listener registry in `events.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::context::CallerContext;
use crate::entity::EntityStore;
use crate::error::{BodyCause, CoreError, CoreResult};
use crate::resource::{LockableResource, ResourceLockType};
use crate::scheduler::TaskScheduler;
use crate::task::{Function, TaskRef};

use super::events::{ListenerRegistry, ListenerToken};
use super::table::{self, LockTable};
use super::types::{LockChange, Owner};

fn to_cause(e: CoreError) -> BodyCause {
    BodyCause::new(e)
}

/// Owns the lock table and the listener registry, and exposes every
/// operation in spec.md §4.E. Every table-mutating operation is returned as
/// a not-yet-started task or function, same as any other unit of work in
/// this crate, so callers compose and await it the same way.
///
/// `listen_locks_changed`/`stop_listen_locks_changed` are the exception:
/// they only touch the local listener list, so they run synchronously
/// rather than being wrapped in a task that does nothing but register a
/// callback.
pub struct LockManager {
    self_ref: Weak<LockManager>,
    scheduler: TaskScheduler,
    entity_store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    table: Mutex<LockTable>,
    listeners: ListenerRegistry,
}

impl LockManager {
    pub fn new(scheduler: TaskScheduler, entity_store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|weak| LockManager {
            self_ref: weak.clone(),
            scheduler,
            entity_store,
            clock,
            table: Mutex::new(LockTable::new()),
            listeners: ListenerRegistry::default(),
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("lock manager dropped while a method was running on it")
    }

    fn resolve_caller(&self, username: &str) -> CoreResult<i64> {
        self.entity_store
            .admin_by_username(username)
            .map(|a| a.id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown administrator {username}")))
    }

    fn dispatch_if_any(&self, changes: &[LockChange]) {
        if !changes.is_empty() {
            self.listeners.dispatch(changes);
        }
    }

    /// Synchronous acquire, used internally by the delayed lock service's
    /// initial attempt and retry passes (spec.md §4.F). Unlike
    /// [`Self::acquire_locks`] this never goes through the scheduler: a
    /// retry pass runs entirely on whatever thread observed `locks_changed`.
    pub(crate) fn try_acquire_now(&self, owner: &Owner, wants: &HashMap<LockableResource, ResourceLockType>) -> bool {
        let wants_vec: Vec<_> = wants.iter().map(|(r, t)| (r.clone(), *t)).collect();
        let (ok, changes) = {
            let mut table = self.table.lock();
            table::acquire(&mut table, self.clock.now(), owner, &wants_vec)
        };
        self.dispatch_if_any(&changes);
        ok
    }

    /// Synchronous release counterpart to [`Self::try_acquire_now`], used by
    /// the delayed lock service's `on_ended` release hook (spec.md §4.F).
    pub(crate) fn release_now(&self, owner: &Owner, wants: &HashMap<LockableResource, ResourceLockType>) {
        let wants_vec: Vec<_> = wants.iter().map(|(r, t)| (r.clone(), *t)).collect();
        let changes = {
            let mut table = self.table.lock();
            table::release(&mut table, owner, &wants_vec)
        };
        self.dispatch_if_any(&changes);
    }

    /// spec.md §4.E `acquire_locks`.
    pub fn acquire_locks(
        &self,
        wants: HashMap<LockableResource, ResourceLockType>,
        ctx: CallerContext,
    ) -> Function<bool> {
        let manager = self.self_arc();
        self.scheduler.spawn_function(Some("acquire_locks".into()), move |task, slot| {
            let admin_id = manager.resolve_caller(&ctx.username).map_err(to_cause)?;
            let owner = Owner::Caller { admin_id, token: ctx.token.clone() };
            let wants: Vec<_> = wants.into_iter().collect();
            let (ok, changes) = {
                let mut table = manager.table.lock();
                table::acquire(&mut table, manager.clock.now(), &owner, &wants)
            };
            manager.dispatch_if_any(&changes);
            slot.set(task, ok).map_err(to_cause)?;
            Ok(())
        })
    }

    /// spec.md §4.E `renew_if_possible`.
    pub fn renew_if_possible(
        &self,
        wants: HashMap<LockableResource, ResourceLockType>,
        ctx: CallerContext,
    ) -> Function<bool> {
        let manager = self.self_arc();
        self.scheduler.spawn_function(Some("renew_if_possible".into()), move |task, slot| {
            let admin_id = manager.resolve_caller(&ctx.username).map_err(to_cause)?;
            let owner = Owner::Caller { admin_id, token: ctx.token.clone() };
            let wants: Vec<_> = wants.into_iter().collect();
            let (ok, changes) = {
                let mut table = manager.table.lock();
                table::renew_if_possible(&mut table, manager.clock.now(), &owner, &wants)
            };
            manager.dispatch_if_any(&changes);
            slot.set(task, ok).map_err(to_cause)?;
            Ok(())
        })
    }

    /// spec.md §4.E `release_locks`.
    pub fn release_locks(&self, wants: HashMap<LockableResource, ResourceLockType>, ctx: CallerContext) -> TaskRef {
        let manager = self.self_arc();
        self.scheduler.spawn(Some("release_locks".into()), move |_task| {
            let admin_id = manager.resolve_caller(&ctx.username).map_err(to_cause)?;
            let owner = Owner::Caller { admin_id, token: ctx.token.clone() };
            let wants: Vec<_> = wants.into_iter().collect();
            let changes = {
                let mut table = manager.table.lock();
                table::release(&mut table, &owner, &wants)
            };
            manager.dispatch_if_any(&changes);
            Ok(())
        })
    }

    /// spec.md §4.E `acquire_system_locks`. System owners need no entity
    /// lookup: the tag is the whole identity.
    pub fn acquire_system_locks(
        &self,
        wants: HashMap<LockableResource, ResourceLockType>,
        tag: impl Into<String>,
    ) -> Function<bool> {
        let manager = self.self_arc();
        let tag = tag.into();
        self.scheduler.spawn_function(Some("acquire_system_locks".into()), move |task, slot| {
            let owner = Owner::System { tag };
            let wants: Vec<_> = wants.into_iter().collect();
            let (ok, changes) = {
                let mut table = manager.table.lock();
                table::acquire(&mut table, manager.clock.now(), &owner, &wants)
            };
            manager.dispatch_if_any(&changes);
            slot.set(task, ok).map_err(to_cause)?;
            Ok(())
        })
    }

    /// spec.md §4.E `release_system_locks`.
    pub fn release_system_locks(
        &self,
        wants: HashMap<LockableResource, ResourceLockType>,
        tag: impl Into<String>,
    ) -> TaskRef {
        let manager = self.self_arc();
        let tag = tag.into();
        self.scheduler.spawn(Some("release_system_locks".into()), move |_task| {
            let owner = Owner::System { tag };
            let wants: Vec<_> = wants.into_iter().collect();
            let changes = {
                let mut table = manager.table.lock();
                table::release(&mut table, &owner, &wants)
            };
            manager.dispatch_if_any(&changes);
            Ok(())
        })
    }

    /// spec.md §4.E `get_concurrent_lock_owner_names`: who else holds a
    /// lock incompatible with any of `wants`, excluding `ctx` itself. System
    /// locks surface as the synthetic name `("[System]", "[System]")`.
    pub fn get_concurrent_lock_owner_names(
        &self,
        wants: HashMap<LockableResource, ResourceLockType>,
        ctx: CallerContext,
    ) -> Function<HashSet<(String, String)>> {
        let manager = self.self_arc();
        self.scheduler.spawn_function(Some("get_concurrent_lock_owner_names".into()), move |task, slot| {
            let admin_id = manager.resolve_caller(&ctx.username).map_err(to_cause)?;
            let caller = Owner::Caller { admin_id, token: ctx.token.clone() };
            let now = manager.clock.now();
            let table = manager.table.lock();
            let mut names = HashSet::new();
            for (resource, want_type) in &wants {
                for lock in table.all_matching(resource) {
                    if lock.is_expired(now) {
                        continue;
                    }
                    if caller.is_same_owner(&lock.owner) {
                        continue;
                    }
                    if lock.lock_type.compatible_with(*want_type) {
                        continue;
                    }
                    match &lock.owner {
                        Owner::Caller { admin_id, .. } => {
                            if let Some(admin) = manager.entity_store.admin_by_id(*admin_id) {
                                names.insert((admin.username.clone(), admin.full_name.clone()));
                            }
                        }
                        Owner::System { .. } => {
                            names.insert(("[System]".to_string(), "[System]".to_string()));
                        }
                    }
                }
            }
            drop(table);
            slot.set(task, names).map_err(to_cause)?;
            Ok(())
        })
    }

    /// spec.md §4.E `get_locks`: a snapshot of unexpired `Write` locks over
    /// individual rows (not set-wide ones) of `entity_set`.
    pub fn get_locks(&self, entity_set: impl Into<String>) -> Function<HashMap<i64, String>> {
        let manager = self.self_arc();
        let entity_set = entity_set.into();
        self.scheduler.spawn_function(Some("get_locks".into()), move |task, slot| {
            let now = manager.clock.now();
            let table = manager.table.lock();
            let mut out = HashMap::new();
            for lock in table.iter() {
                if lock.resource.entity_set != entity_set || lock.resource.is_set_wide() {
                    continue;
                }
                if lock.lock_type != ResourceLockType::Write || lock.is_expired(now) {
                    continue;
                }
                let username = match &lock.owner {
                    Owner::Caller { admin_id, .. } => manager.entity_store.admin_by_id(*admin_id).map(|a| a.username),
                    Owner::System { tag } => Some(format!("[System:{tag}]")),
                };
                if let Some(username) = username {
                    out.insert(lock.resource.instance_id, username);
                }
            }
            drop(table);
            slot.set(task, out).map_err(to_cause)?;
            Ok(())
        })
    }

    /// spec.md §4.E `listen_locks_changed`. `own_token` is the listener's
    /// own `CallerContext::token`, compared against each change's owning
    /// token when `ignore_own` is set; an empty `filter` matches every
    /// entity set.
    pub fn listen_locks_changed(
        &self,
        own_token: impl Into<String>,
        filter: Vec<String>,
        ignore_own: bool,
        callback: impl Fn(&[LockChange]) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.listeners.add(own_token.into(), filter, ignore_own, Arc::new(callback))
    }

    /// spec.md §4.E `stop_listen_locks_changed`.
    pub fn stop_listen_locks_changed(&self, token: ListenerToken) -> bool {
        self.listeners.remove(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::test_support::FakeEntityStore;
    use crate::scheduler::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fixture() -> (Arc<LockManager>, TaskScheduler, Arc<ManualClock>) {
        let scheduler = TaskScheduler::new(SchedulerConfig::default());
        let clock = Arc::new(ManualClock::new());
        let entities = Arc::new(
            FakeEntityStore::new()
                .with_admin(1, "alice", "Alice Admin")
                .with_admin(2, "bob", "Bob Admin"),
        );
        let manager = LockManager::new(scheduler.clone(), entities, clock.clone());
        (manager, scheduler, clock)
    }

    fn wants(entity_set: &str, id: i64, ty: ResourceLockType) -> HashMap<LockableResource, ResourceLockType> {
        HashMap::from([(LockableResource::row(entity_set, id), ty)])
    }

    #[test]
    fn two_readers_then_a_writer_fails() {
        let (manager, _scheduler, _clock) = fixture();
        let a = CallerContext::new("ta", "alice");
        let b = CallerContext::new("tb", "bob");

        let f1 = manager.acquire_locks(wants("User", 1, ResourceLockType::Read), a.clone());
        assert!(f1.run_sync(true, None).unwrap());

        let f2 = manager.acquire_locks(wants("User", 1, ResourceLockType::Read), b);
        assert!(f2.run_sync(true, None).unwrap());

        let f3 = manager.acquire_locks(wants("User", 1, ResourceLockType::Write), a);
        assert!(!f3.run_sync(true, None).unwrap());
    }

    #[test]
    fn unknown_administrator_fails_the_task() {
        let (manager, _scheduler, _clock) = fixture();
        let ghost = CallerContext::new("tg", "ghost");
        let f = manager.acquire_locks(wants("User", 1, ResourceLockType::Read), ghost);
        assert!(f.run_sync(true, None).is_err());
    }

    #[test]
    fn expiry_sweep_emits_remove_then_add() {
        let (manager, _scheduler, clock) = fixture();
        let a = CallerContext::new("ta", "alice");
        let b = CallerContext::new("tb", "bob");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        manager.listen_locks_changed("", Vec::new(), false, move |changes| {
            s.lock().extend(changes.iter().map(|c| (c.before.is_some(), c.after.is_some())));
        });

        let f1 = manager.acquire_locks(wants("Fruit", 7, ResourceLockType::Write), a);
        assert!(f1.run_sync(true, None).unwrap());

        clock.advance(Duration::from_secs(121));

        let f2 = manager.acquire_locks(wants("Fruit", 7, ResourceLockType::Write), b);
        assert!(f2.run_sync(true, None).unwrap());

        let log = seen.lock().clone();
        assert_eq!(log, vec![(false, true), (true, false), (false, true)]);
    }

    #[test]
    fn release_then_reacquire_round_trips() {
        let (manager, _scheduler, _clock) = fixture();
        let a = CallerContext::new("ta", "alice");
        let w = wants("User", 9, ResourceLockType::Write);

        manager.acquire_locks(w.clone(), a.clone()).run_sync(true, None).unwrap();
        manager.release_locks(w.clone(), a.clone()).run_sync(true, None).unwrap();

        let locks = manager.get_locks("User").run_sync(true, None).unwrap();
        assert!(locks.is_empty());

        manager.acquire_locks(w, a).run_sync(true, None).unwrap();
        let locks = manager.get_locks("User").run_sync(true, None).unwrap();
        assert_eq!(locks.get(&9).map(String::as_str), Some("alice"));
    }

    #[test]
    fn system_locks_surface_as_bracketed_name() {
        let (manager, _scheduler, _clock) = fixture();
        let a = CallerContext::new("ta", "alice");
        let resource = wants("User", 4, ResourceLockType::Write);

        manager.acquire_system_locks(resource.clone(), "import").run_sync(true, None).unwrap();
        let owners = manager
            .get_concurrent_lock_owner_names(resource, a)
            .run_sync(true, None)
            .unwrap();
        assert!(owners.contains(&("[System]".to_string(), "[System]".to_string())));
    }

    #[test]
    fn listener_call_count_matches_dispatch() {
        let (manager, _scheduler, _clock) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = manager.listen_locks_changed("ignored", Vec::new(), false, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        manager
            .acquire_locks(wants("User", 1, ResourceLockType::Write), CallerContext::new("ta", "alice"))
            .run_sync(true, None)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(manager.stop_listen_locks_changed(token));
        manager
            .acquire_locks(wants("User", 2, ResourceLockType::Write), CallerContext::new("ta", "alice"))
            .run_sync(true, None)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
