use crate::domain_model::{KeySpace, SessionId};
use crate::domain_port::{BackendError, KvBackend};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5);

/// Per-session mutual exclusion living in the backend.
///
/// The lock is a key created with set-if-absent and a TTL, holding a random
/// token. Only the token holder deletes it; if the holder dies the TTL
/// clears it.
#[derive(Debug, Clone)]
pub struct RefreshLock {
    keys: KeySpace,
    ttl: Duration,
}

impl RefreshLock {
    pub fn new(keys: KeySpace, ttl: Duration) -> Self {
        RefreshLock { keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Non-blocking. `Ok(None)` means someone else holds the lock.
    pub async fn acquire(
        &self,
        backend: Arc<dyn KvBackend>,
        id: &SessionId,
    ) -> Result<Option<LockGuard>, BackendError> {
        let key = self.keys.lock(id);
        let token = uuid::Uuid::new_v4().to_string();
        if backend.set_if_absent(&key, token.as_bytes(), self.ttl).await? {
            debug!(%key, "refresh lock acquired");
            Ok(Some(LockGuard {
                backend: Some(backend),
                key,
                token,
                release_timeout: self.ttl,
            }))
        } else {
            debug!(%key, "refresh lock busy");
            Ok(None)
        }
    }

    /// Unconditional removal, used when the session itself is cleared.
    pub async fn clear(&self, backend: &dyn KvBackend, id: &SessionId) -> Result<bool, BackendError> {
        backend.delete(&self.keys.lock(id)).await
    }
}

/// A held refresh lock. Release explicitly with [`LockGuard::release`];
/// a guard dropped without release (cancellation, unwinding) schedules the
/// release on the current runtime.
pub struct LockGuard {
    backend: Option<Arc<dyn KvBackend>>,
    key: String,
    token: String,
    release_timeout: Duration,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        if let Some(backend) = self.backend.take() {
            release_quietly(backend, &self.key, &self.token, self.release_timeout).await;
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.backend.is_some())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let timeout = self.release_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_quietly(backend, &key, &token, timeout).await;
                });
            }
            Err(_) => warn!(%key, "refresh lock dropped outside a runtime, leaving it to expire"),
        }
    }
}

async fn release_quietly(backend: Arc<dyn KvBackend>, key: &str, token: &str, timeout: Duration) {
    match tokio::time::timeout(timeout, backend.delete_if_equals(key, token.as_bytes())).await {
        Ok(Ok(true)) => debug!(key, "refresh lock released"),
        Ok(Ok(false)) => warn!(key, "refresh lock expired before release"),
        Ok(Err(e)) => warn!(key, error = %e, "failed to release refresh lock, leaving it to expire"),
        Err(_) => warn!(key, "timed out releasing refresh lock, leaving it to expire"),
    }
}
