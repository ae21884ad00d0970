use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Connection lost, timeout, failover in progress. Worth retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rejected command: {0}")]
    Rejected(String),
    #[error("backend misconfigured: {0}")]
    Configuration(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    /// `None` only for keys written without expiry by someone else.
    pub ttl: Option<Duration>,
}

/// The subset of key-value commands the session store relies on.
///
/// Every write carries a TTL; callers never pass a zero TTL.
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, BackendError>;

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
    -> Result<(), BackendError>;

    /// Atomic create. Returns false if the key already exists.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Delete only if the current value is `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError>;

    /// Rewrite the TTL of an existing key. Returns false if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}
