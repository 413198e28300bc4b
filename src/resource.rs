use std::fmt;

/// Addressable unit the lock manager can guard: either a whole entity set
/// (`instance_id == -1`, rendered `"<set>*"`) or a single row within it
/// (rendered `"<set>#<id>"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockableResource {
    pub entity_set: String,
    pub instance_id: i64,
}

impl LockableResource {
    pub const SET_WIDE: i64 = -1;

    pub fn set_wide(entity_set: impl Into<String>) -> Self {
        Self {
            entity_set: entity_set.into(),
            instance_id: Self::SET_WIDE,
        }
    }

    pub fn row(entity_set: impl Into<String>, instance_id: i64) -> Self {
        Self {
            entity_set: entity_set.into(),
            instance_id,
        }
    }

    pub fn is_set_wide(&self) -> bool {
        self.instance_id == Self::SET_WIDE
    }

    /// Canonical string key used internally as the lock table's index, e.g.
    /// `"User#1"` or `"User*"`.
    pub fn resource_key(&self) -> String {
        if self.is_set_wide() {
            format!("{}*", self.entity_set)
        } else {
            format!("{}#{}", self.entity_set, self.instance_id)
        }
    }

    /// Two resources "refer to the same key" for lock-table matching if
    /// either is set-wide and entity sets match, or both are the same row.
    pub fn matches(&self, other: &LockableResource) -> bool {
        if self.entity_set != other.entity_set {
            return false;
        }
        self.is_set_wide() || other.is_set_wide() || self.instance_id == other.instance_id
    }
}

impl fmt::Display for LockableResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_key())
    }
}

/// Extracts the entity-set prefix from a canonical resource key, i.e. the
/// text up to (not including) the first `#` or `*`.
pub fn entity_set_of_key(resource_key: &str) -> &str {
    let end = resource_key
        .find(|c| c == '#' || c == '*')
        .unwrap_or(resource_key.len());
    &resource_key[..end]
}

/// Row id parsed out of a `"<set>#<id>"` key, if the key is row-level.
pub fn instance_id_of_key(resource_key: &str) -> Option<i64> {
    let (_, rest) = resource_key.split_once('#')?;
    rest.parse().ok()
}

/// `Read` and `Write` are only compatible with themselves when both sides
/// are `Read`; any combination involving a `Write` conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLockType {
    Read,
    Write,
}

impl ResourceLockType {
    pub fn compatible_with(self, other: ResourceLockType) -> bool {
        matches!((self, other), (ResourceLockType::Read, ResourceLockType::Read))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_forms() {
        assert_eq!(LockableResource::row("User", 1).resource_key(), "User#1");
        assert_eq!(LockableResource::set_wide("User").resource_key(), "User*");
    }

    #[test]
    fn set_wide_matches_row() {
        let set = LockableResource::set_wide("User");
        let row = LockableResource::row("User", 7);
        assert!(set.matches(&row));
        assert!(row.matches(&set));
    }

    #[test]
    fn different_sets_never_match() {
        let a = LockableResource::row("User", 1);
        let b = LockableResource::row("Fruit", 1);
        assert!(!a.matches(&b));
    }

    #[test]
    fn entity_set_prefix_parsing() {
        assert_eq!(entity_set_of_key("User#1"), "User");
        assert_eq!(entity_set_of_key("User*"), "User");
        assert_eq!(instance_id_of_key("User#42"), Some(42));
        assert_eq!(instance_id_of_key("User*"), None);
    }

    #[test]
    fn read_read_is_the_only_compatible_pair() {
        use ResourceLockType::*;
        assert!(Read.compatible_with(Read));
        assert!(!Read.compatible_with(Write));
        assert!(!Write.compatible_with(Read));
        assert!(!Write.compatible_with(Write));
    }
}
