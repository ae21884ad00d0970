use crate::application_impl::{RefreshLock, RetryPolicy, SessionCodec, TopologyResolver, DEFAULT_LOCK_TTL};
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::{BackendError, KvBackend};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const DEFAULT_KEY_PREFIX: &str = "_ticketvault";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub key_prefix: String,
    pub ttl: TtlPolicy,
    pub codec: SessionCodec,
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
    /// Bound on a single backend round trip.
    pub call_timeout: Duration,
    /// Bound on a whole public operation, retries included.
    pub operation_timeout: Duration,
}

impl StoreOptions {
    pub fn new(ttl: TtlPolicy) -> Self {
        StoreOptions {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl,
            codec: SessionCodec::Plain,
            lock_ttl: DEFAULT_LOCK_TTL,
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

pub struct RealSessionStore {
    resolver: Arc<TopologyResolver>,
    keys: KeySpace,
    codec: SessionCodec,
    ttl: TtlPolicy,
    lock: RefreshLock,
    retry: RetryPolicy,
    call_timeout: Duration,
    operation_timeout: Duration,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl RealSessionStore {
    pub fn new(resolver: Arc<TopologyResolver>, options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        let keys = KeySpace::new(options.key_prefix);
        RealSessionStore {
            resolver,
            lock: RefreshLock::new(keys.clone(), options.lock_ttl),
            keys,
            codec: options.codec,
            ttl: options.ttl,
            retry: options.retry,
            call_timeout: options.call_timeout,
            operation_timeout: options.operation_timeout,
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Operations started after `token` fires fail fast with `Unavailable`;
    /// operations in flight are abandoned.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    /// Check that the current backend node answers. Returns its endpoint.
    pub async fn ping(&self) -> Result<String, SessionStoreError> {
        self.bounded("ping", self.ping_inner()).await
    }

    async fn ping_inner(&self) -> Result<String, SessionStoreError> {
        self.with_backend("ping", |backend| async move { backend.ping().await })
            .await?;
        let handle = self.resolver.current().await?;
        Ok(handle.endpoint().to_string())
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, SessionStoreError>>,
    ) -> Result<T, SessionStoreError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionStoreError::Unavailable("session store is shut down".into()));
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(SessionStoreError::Unavailable("session store is shutting down".into()))
            }
            result = tokio::time::timeout(self.operation_timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(op, timeout = ?self.operation_timeout, "operation deadline exceeded");
                    Err(SessionStoreError::Unavailable(format!(
                        "{} did not complete within {:?}",
                        op, self.operation_timeout
                    )))
                }
            }
        }
    }

    /// Run `call` against the current handle, retrying transient failures
    /// with backoff. Every transient failure invalidates the handle that
    /// produced it so the next attempt goes through a fresh resolve.
    async fn with_backend<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, SessionStoreError>
    where
        F: Fn(Arc<dyn KvBackend>) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.resolver.current().await {
                Ok(handle) => {
                    let result = match tokio::time::timeout(self.call_timeout, call(handle.backend())).await {
                        Ok(result) => result,
                        Err(_) => Err(BackendError::Unavailable(format!(
                            "no reply from {} within {:?}",
                            handle.endpoint(),
                            self.call_timeout
                        ))),
                    };
                    if let Err(e) = &result {
                        if e.is_transient() {
                            self.resolver.invalidate(&handle).await;
                        }
                    }
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.retry.allows_retry_after(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(op, attempt = attempt + 1, ?delay, error = %e, "transient backend error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(op, attempts = attempt + 1, error = %e, "backend still unavailable, giving up");
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn save_inner(&self, session: &Session) -> Result<(), SessionStoreError> {
        let key = self.keys.session(&session.id);
        let key = key.as_str();
        let now = self.clock.now();

        let Some(ttl) = self.ttl.ttl_at(session.created_at, now) else {
            debug!("session outlived its maximum lifetime, dropping it");
            self.with_backend("save.drop", |backend| async move { backend.delete(key).await })
                .await?;
            return Err(SessionStoreError::NotFound);
        };

        let mut record = session.clone();
        record.last_refreshed = now;
        let bytes = self.codec.encode(&record)?;
        let bytes = bytes.as_slice();

        self.with_backend("save", |backend| async move {
            backend.set_with_ttl(key, bytes, ttl).await
        })
        .await
    }

    async fn load_inner(&self, id: &SessionId, deadline: Instant) -> Result<Session, SessionStoreError> {
        let key = self.keys.session(id);
        let key = key.as_str();
        let stored = self
            .with_backend("load", |backend| async move { backend.get_with_ttl(key).await })
            .await?;
        let Some(stored) = stored else {
            return Err(SessionStoreError::NotFound);
        };

        let session = match self.codec.decode(id, &stored.value) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "rejecting stored session");
                return Err(e.into());
            }
        };

        if let Some(remaining) = stored.ttl {
            if self.ttl.should_refresh(&session, remaining, self.clock.now()) {
                self.slide(id, deadline).await;
            }
        }
        Ok(session)
    }

    /// Sliding refresh on behalf of a load. It gets what is left of the
    /// load's budget minus a margin for returning the session, and never
    /// fails the load. A refresh cut short drops its lock guard, which
    /// releases the lock.
    async fn slide(&self, id: &SessionId, deadline: Instant) {
        let margin = self.operation_timeout / 10;
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(margin);
        if budget.is_zero() {
            debug!("no time left for sliding refresh");
            return;
        }
        match tokio::time::timeout(budget, self.refresh_inner(id)).await {
            Ok(Ok(outcome)) => debug!(?outcome, "sliding refresh"),
            Ok(Err(e)) => warn!(error = %e, "sliding refresh failed, serving session as is"),
            Err(_) => warn!(?budget, "sliding refresh ran out of time, serving session as is"),
        }
    }

    async fn clear_inner(&self, id: &SessionId) -> Result<(), SessionStoreError> {
        let key = self.keys.session(id);
        let key = key.as_str();
        self.with_backend("clear", |backend| async move { backend.delete(key).await })
            .await?;

        // the lock expires by itself, this only saves a later refresh from
        // seeing a stale holder
        let lock = &self.lock;
        if let Err(e) = self
            .with_backend("clear.lock", |backend| async move {
                lock.clear(backend.as_ref(), id).await
            })
            .await
        {
            warn!(error = %e, "could not remove refresh lock");
        }
        Ok(())
    }

    async fn refresh_inner(&self, id: &SessionId) -> Result<RefreshOutcome, SessionStoreError> {
        let lock = &self.lock;
        let guard = self
            .with_backend("refresh.lock", |backend| lock.acquire(backend, id))
            .await?;
        let Some(guard) = guard else {
            return Ok(RefreshOutcome::Busy);
        };

        let outcome = self.extend_expiry(id).await;
        guard.release().await;
        outcome
    }

    async fn extend_expiry(&self, id: &SessionId) -> Result<RefreshOutcome, SessionStoreError> {
        let key = self.keys.session(id);
        let key = key.as_str();
        let stored = self
            .with_backend("refresh.read", |backend| async move { backend.get_with_ttl(key).await })
            .await?;
        let Some(stored) = stored else {
            return Err(SessionStoreError::NotFound);
        };
        let session = self.codec.decode(id, &stored.value)?;

        let now = self.clock.now();
        let Some(ttl) = self.ttl.ttl_at(session.created_at, now) else {
            return Ok(RefreshOutcome::Unchanged);
        };
        if stored.ttl.is_some_and(|remaining| remaining >= ttl) {
            return Ok(RefreshOutcome::Unchanged);
        }

        let extended = self
            .with_backend("refresh.expire", |backend| async move { backend.expire(key, ttl).await })
            .await?;
        if !extended {
            return Err(SessionStoreError::NotFound);
        }
        let expires_at = self.ttl.compute_expiry(session.created_at, now);
        Ok(RefreshOutcome::Refreshed { expires_at })
    }
}

#[async_trait::async_trait]
impl SessionStore for RealSessionStore {
    async fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        self.bounded("save", self.save_inner(session)).await
    }

    async fn load(&self, id: &SessionId) -> Result<Session, SessionStoreError> {
        let deadline = Instant::now() + self.operation_timeout;
        self.bounded("load", self.load_inner(id, deadline)).await
    }

    async fn clear(&self, id: &SessionId) -> Result<(), SessionStoreError> {
        self.bounded("clear", self.clear_inner(id)).await
    }

    async fn refresh(&self, id: &SessionId) -> Result<RefreshOutcome, SessionStoreError> {
        self.bounded("refresh", self.refresh_inner(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::{MemoryBackend, MemoryConnector};

    async fn store_over(node: &MemoryBackend, options: StoreOptions) -> RealSessionStore {
        let connector = Arc::new(MemoryConnector::new("memory:0", node.clone()));
        let resolver = Arc::new(TopologyResolver::connect(connector).await.unwrap());
        RealSessionStore::new(resolver, options, node.clock())
    }

    fn options(idle: u64, max: u64) -> StoreOptions {
        let ttl = TtlPolicy::new(
            Duration::from_secs(idle),
            Duration::from_secs(max),
            DEFAULT_REFRESH_THRESHOLD,
        )
        .unwrap();
        let mut options = StoreOptions::new(ttl);
        options.retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        options
    }

    fn session(node: &MemoryBackend, id: &str) -> Session {
        Session::new(SessionId(id.into()), SessionPayload::for_user("alice"), node.clock().now())
    }

    #[tokio::test]
    async fn test_save_attaches_idle_ttl() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        store.save(&session(&node, "abc")).await.unwrap();

        let stored = node.get_with_ttl("_ticketvault:abc").await.unwrap().unwrap();
        assert_eq!(stored.ttl, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_save_stamps_last_refreshed() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        let s = session(&node, "abc");
        node.fast_forward(Duration::from_secs(10));
        store.save(&s).await.unwrap();

        let loaded = store.load(&s.id).await.unwrap();
        assert_eq!(loaded.created_at, s.created_at);
        assert_eq!(loaded.last_refreshed, s.created_at + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_save_after_max_lifetime_is_not_found() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 120)).await;
        let s = session(&node, "abc");
        store.save(&s).await.unwrap();

        node.fast_forward(Duration::from_secs(120));
        assert_eq!(store.save(&s).await, Err(SessionStoreError::NotFound));
        assert!(node.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_is_unchanged_for_fresh_entry() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        let s = session(&node, "abc");
        store.save(&s).await.unwrap();
        assert_eq!(store.refresh(&s.id).await, Ok(RefreshOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_refresh_extends_and_releases_lock() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        let s = session(&node, "abc");
        store.save(&s).await.unwrap();

        node.fast_forward(Duration::from_secs(40));
        let outcome = store.refresh(&s.id).await.unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Refreshed {
                expires_at: s.created_at + chrono::Duration::seconds(100)
            }
        );
        let stored = node.get_with_ttl("_ticketvault:abc").await.unwrap().unwrap();
        assert_eq!(stored.ttl, Some(Duration::from_secs(60)));
        assert!(node.get_with_ttl("_ticketvault-lock:abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_sliding_refresh_does_not_fail_load() {
        let node = MemoryBackend::new();
        let mut opts = options(60, 3600);
        opts.call_timeout = Duration::from_millis(100);
        opts.operation_timeout = Duration::from_millis(300);
        let store = store_over(&node, opts).await;
        let s = session(&node, "abc");
        store.save(&s).await.unwrap();

        // refresh is due, and every round trip is just under the call timeout
        node.fast_forward(Duration::from_secs(50));
        node.set_latency(Duration::from_millis(80));

        let loaded = store.load(&s.id).await.unwrap();
        assert_eq!(loaded.payload.user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_refresh_of_missing_session_is_not_found() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        let id = SessionId("nope".into());
        assert_eq!(store.refresh(&id).await, Err(SessionStoreError::NotFound));
        assert!(node.get_with_ttl("_ticketvault-lock:nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_entry_and_lock() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        let s = session(&node, "abc");
        store.save(&s).await.unwrap();
        node.set_with_ttl("_ticketvault-lock:abc", b"someone", Duration::from_secs(5))
            .await
            .unwrap();

        store.clear(&s.id).await.unwrap();
        assert!(node.is_empty());
        assert_eq!(store.load(&s.id).await, Err(SessionStoreError::NotFound));
        // clearing twice is fine
        store.clear(&s.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_named_like_a_lock_does_not_block_refresh() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        let s = session(&node, "abc");
        let lookalike = session(&node, "abc.lock");
        store.save(&s).await.unwrap();
        store.save(&lookalike).await.unwrap();

        node.fast_forward(Duration::from_secs(40));
        assert!(matches!(
            store.refresh(&s.id).await,
            Ok(RefreshOutcome::Refreshed { .. })
        ));
        assert!(store.load(&lookalike.id).await.is_ok());

        store.clear(&s.id).await.unwrap();
        assert!(store.load(&lookalike.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_after_retries_exhausted() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        node.set_available(false);
        let result = store.load(&SessionId("abc".into())).await;
        assert!(matches!(result, Err(SessionStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_call_timeout_maps_to_unavailable() {
        let node = MemoryBackend::new();
        let mut opts = options(60, 3600);
        opts.call_timeout = Duration::from_millis(10);
        opts.retry = RetryPolicy::no_retry();
        let store = store_over(&node, opts).await;

        node.set_latency(Duration::from_millis(200));
        let result = store.load(&SessionId("abc".into())).await;
        assert!(matches!(result, Err(SessionStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_operation_deadline_bounds_retries() {
        let node = MemoryBackend::new();
        let mut opts = options(60, 3600);
        opts.retry = RetryPolicy {
            max_attempts: 100,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            multiplier: 1.0,
        };
        opts.operation_timeout = Duration::from_millis(100);
        let store = store_over(&node, opts).await;

        node.set_available(false);
        let started = std::time::Instant::now();
        let result = store.load(&SessionId("abc".into())).await;
        assert!(matches!(result, Err(SessionStoreError::Unavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shut_down_store_refuses_work() {
        let node = MemoryBackend::new();
        let token = CancellationToken::new();
        let store = store_over(&node, options(60, 3600)).await.with_shutdown(token.clone());
        token.cancel();
        let result = store.save(&session(&node, "abc")).await;
        assert!(matches!(result, Err(SessionStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_ping_reports_endpoint() {
        let node = MemoryBackend::new();
        let store = store_over(&node, options(60, 3600)).await;
        assert_eq!(store.ping().await.unwrap(), "memory:0");
    }
}
