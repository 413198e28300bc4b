/// Identity of a logical editing session.
///
/// `token` is a free-form per-session string (two contexts with the same
/// `username` but different tokens are different sessions, e.g. the same
/// administrator logged in from two clients); `username` identifies the
/// administrator and is resolved against [`crate::entity::EntityStore`]
/// when a lock is first acquired.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerContext {
    pub token: String,
    pub username: String,
}

impl CallerContext {
    pub fn new(token: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            username: username.into(),
        }
    }
}
