//! Cache scoping for computed values.
//!
//! Scope is threaded explicitly through the orchestrator call signature;
//! callers construct a [`ScopeContext`] once per request and pass it down.
//! There is no ambient session/user state.

use serde::{Deserialize, Serialize};

/// Partitioning dimension for cache keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// One cache partition shared by everyone.
    #[default]
    Global,
    /// Partitioned by session id.
    Session,
    /// Partitioned by user id.
    User,
    /// Never cached; duplicate concurrent computation is accepted.
    None,
}

impl CacheScope {
    /// Returns true if values computed under this scope are cached at all.
    pub fn is_cached(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Opaque per-request identity used to pick cache partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeContext {
    /// Current session id, if any.
    pub session_id: Option<String>,

    /// Current user id, if any.
    pub user_id: Option<String>,
}

impl ScopeContext {
    /// Create an anonymous (global-only) scope context.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Builder method to set the session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Builder method to set the user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Resolve the cache partition string for a scope.
    ///
    /// Returns `Ok(None)` for [`CacheScope::None`], and an error message for
    /// session/user scopes when the matching context field is missing.
    pub fn partition(&self, scope: CacheScope) -> Result<Option<String>, MissingScope> {
        match scope {
            CacheScope::Global => Ok(Some("global".to_string())),
            CacheScope::Session => self
                .session_id
                .as_ref()
                .map(|s| Some(format!("session:{s}")))
                .ok_or(MissingScope::Session),
            CacheScope::User => self
                .user_id
                .as_ref()
                .map(|u| Some(format!("user:{u}")))
                .ok_or(MissingScope::User),
            CacheScope::None => Ok(None),
        }
    }
}

/// A scoped cache was requested without the matching identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MissingScope {
    #[error("session-scoped cache requested without a session id")]
    Session,

    #[error("user-scoped cache requested without a user id")]
    User,
}
