use crate::domain_model::{InvalidTtlPolicy, Session, SessionId};
use crate::domain_port::BackendError;
use chrono::{DateTime, Utc};

/// Every variant means "treat the request as unauthenticated" to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session not found or expired")]
    NotFound,
    #[error("session payload failed authentication")]
    Integrity,
    #[error("session payload malformed: {0}")]
    Decode(String),
    #[error("session payload could not be encoded: {0}")]
    Encode(String),
    #[error("invalid session store configuration: {0}")]
    Configuration(String),
}

impl From<BackendError> for SessionStoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(e) => SessionStoreError::Unavailable(e),
            // a command the backend refuses will not succeed on retry either,
            // but to the caller the store is still unusable
            BackendError::Rejected(e) => SessionStoreError::Unavailable(e),
            BackendError::Configuration(e) => SessionStoreError::Configuration(e),
        }
    }
}

impl From<InvalidTtlPolicy> for SessionStoreError {
    fn from(err: InvalidTtlPolicy) -> Self {
        SessionStoreError::Configuration(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { expires_at: DateTime<Utc> },
    /// Another holder is refreshing this session right now.
    Busy,
    /// Nothing to extend: the entry already lives as long as policy allows.
    Unchanged,
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a session, replacing any previous entry for its id.
    async fn save(&self, session: &Session) -> Result<(), SessionStoreError>;
    /// Fetch a session, extending its expiry when the idle window runs low.
    async fn load(&self, id: &SessionId) -> Result<Session, SessionStoreError>;
    async fn clear(&self, id: &SessionId) -> Result<(), SessionStoreError>;
    /// Extend the expiry of a stored session under the per-session lock.
    async fn refresh(&self, id: &SessionId) -> Result<RefreshOutcome, SessionStoreError>;
}
