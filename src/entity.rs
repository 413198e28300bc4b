/// Minimal read-only view of an administrator, as resolved from the
/// surrounding application's entity graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRef {
    pub id: i64,
    pub username: String,
    pub full_name: String,
}

/// The only seam the lock manager needs into the surrounding application's
/// entity graph (spec.md §4.G). Persistence, the object graph itself, and
/// everything else about users/fruits/administrators/relations stays out
/// of this crate's scope; implementors typically wrap an existing
/// repository/DAO.
pub trait EntityStore: Send + Sync {
    fn admin_by_username(&self, username: &str) -> Option<AdminRef>;
    fn admin_by_id(&self, id: i64) -> Option<AdminRef>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use parking_lot::RwLock;

    /// In-memory `EntityStore` used by unit and scenario tests.
    #[derive(Default)]
    pub struct FakeEntityStore {
        by_username: RwLock<HashMap<String, AdminRef>>,
    }

    impl FakeEntityStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_admin(self, id: i64, username: &str, full_name: &str) -> Self {
            self.by_username.write().insert(
                username.to_string(),
                AdminRef {
                    id,
                    username: username.to_string(),
                    full_name: full_name.to_string(),
                },
            );
            self
        }
    }

    impl EntityStore for FakeEntityStore {
        fn admin_by_username(&self, username: &str) -> Option<AdminRef> {
            self.by_username.read().get(username).cloned()
        }

        fn admin_by_id(&self, id: i64) -> Option<AdminRef> {
            self.by_username.read().values().find(|a| a.id == id).cloned()
        }
    }
}
