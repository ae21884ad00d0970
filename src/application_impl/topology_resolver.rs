use crate::domain_port::{BackendError, Connector, KvBackend};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One resolved connection. Immutable; replaced wholesale on failover.
pub struct TopologyHandle {
    generation: u64,
    endpoint: String,
    backend: Arc<dyn KvBackend>,
}

impl TopologyHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }
}

impl std::fmt::Debug for TopologyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyHandle")
            .field("generation", &self.generation)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Owns the live handle to the backend's writable node.
///
/// Readers clone an `Arc` under a shared read lock and never wait on each
/// other. Replacing the handle happens under the write lock only for the
/// pointer swap; the reconnect itself is serialized by an async mutex so a
/// burst of failures triggers one reconnect, not one per caller.
pub struct TopologyResolver {
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<TopologyHandle>>>,
    reconnecting: tokio::sync::Mutex<()>,
    generations: AtomicU64,
}

impl TopologyResolver {
    pub async fn connect(connector: Arc<dyn Connector>) -> Result<Self, BackendError> {
        let resolver = TopologyResolver {
            connector,
            current: RwLock::new(None),
            reconnecting: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
        };
        let handle = resolver.establish().await?;
        info!(endpoint = %handle.endpoint, "connected to session backend");
        resolver.install(Some(handle));
        Ok(resolver)
    }

    /// The installed handle, reconnecting first if the last reconnect failed.
    pub async fn current(&self) -> Result<Arc<TopologyHandle>, BackendError> {
        if let Some(handle) = self.snapshot() {
            return Ok(handle);
        }
        let _guard = self.reconnecting.lock().await;
        if let Some(handle) = self.snapshot() {
            return Ok(handle);
        }
        let handle = self.establish().await?;
        info!(endpoint = %handle.endpoint, "reconnected to session backend");
        self.install(Some(handle.clone()));
        Ok(handle)
    }

    /// Report that `failed` produced a connection-level error. Reconnects
    /// unless another caller already replaced that handle.
    pub async fn invalidate(&self, failed: &TopologyHandle) {
        let _guard = self.reconnecting.lock().await;
        match self.snapshot() {
            Some(installed) if installed.generation == failed.generation => {}
            _ => {
                debug!(generation = failed.generation, "handle already replaced");
                return;
            }
        }
        match self.establish().await {
            Ok(handle) => {
                info!(
                    from = %failed.endpoint,
                    to = %handle.endpoint,
                    generation = handle.generation,
                    "replaced session backend handle"
                );
                self.install(Some(handle));
            }
            Err(e) => {
                warn!(endpoint = %failed.endpoint, error = %e, "reconnect failed");
                self.install(None);
            }
        }
    }

    /// Ask the connector where the writable node is and reconnect if it
    /// moved. Returns true when the handle was replaced.
    pub async fn check_location(&self) -> Result<bool, BackendError> {
        let located = self.connector.locate().await?;
        let installed = match self.snapshot() {
            Some(handle) => handle,
            None => {
                self.current().await?;
                return Ok(true);
            }
        };
        if installed.endpoint == located {
            return Ok(false);
        }
        info!(from = %installed.endpoint, to = %located, "backend master moved");
        self.invalidate(&installed).await;
        Ok(self
            .snapshot()
            .is_some_and(|handle| handle.generation != installed.generation))
    }

    /// Poll for master changes until `cancel` fires.
    pub async fn watch(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("topology watch shutting down...");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.check_location().await {
                        warn!(error = %e, "topology check failed");
                    }
                }
            }
        }
    }

    async fn establish(&self) -> Result<Arc<TopologyHandle>, BackendError> {
        let connection = self.connector.connect().await?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(TopologyHandle {
            generation,
            endpoint: connection.endpoint,
            backend: connection.backend,
        }))
    }

    fn snapshot(&self) -> Option<Arc<TopologyHandle>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, handle: Option<Arc<TopologyHandle>>) {
        match self.current.write() {
            Ok(mut guard) => *guard = handle,
            Err(poisoned) => *poisoned.into_inner() = handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::{MemoryBackend, MemoryConnector};

    #[tokio::test]
    async fn test_connect_fails_when_nothing_reachable() {
        let node = MemoryBackend::new();
        node.set_available(false);
        let connector = Arc::new(MemoryConnector::new("a:6379", node));
        let result = TopologyResolver::connect(connector).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_invalidate_swaps_to_new_primary() {
        let primary = MemoryBackend::new();
        let replica = primary.replica();
        let connector = Arc::new(MemoryConnector::new("a:6379", primary.clone()));
        let resolver = TopologyResolver::connect(connector.clone()).await.unwrap();

        let first = resolver.current().await.unwrap();
        assert_eq!(first.endpoint(), "a:6379");

        primary.set_available(false);
        connector.fail_over_to("b:6379", replica);
        resolver.invalidate(&first).await;

        let second = resolver.current().await.unwrap();
        assert_eq!(second.endpoint(), "b:6379");
        assert!(second.generation() > first.generation());
    }

    #[tokio::test]
    async fn test_stale_invalidate_does_not_reconnect_again() {
        let node = MemoryBackend::new();
        let connector = Arc::new(MemoryConnector::new("a:6379", node));
        let resolver = TopologyResolver::connect(connector.clone()).await.unwrap();

        let first = resolver.current().await.unwrap();
        resolver.invalidate(&first).await;
        resolver.invalidate(&first).await;
        resolver.invalidate(&first).await;
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_reconnect_recovers_on_next_use() {
        let node = MemoryBackend::new();
        let connector = Arc::new(MemoryConnector::new("a:6379", node.clone()));
        let resolver = TopologyResolver::connect(connector.clone()).await.unwrap();

        let first = resolver.current().await.unwrap();
        node.set_available(false);
        resolver.invalidate(&first).await;
        assert!(resolver.current().await.is_err());

        node.set_available(true);
        let recovered = resolver.current().await.unwrap();
        assert_eq!(recovered.endpoint(), "a:6379");
    }

    #[tokio::test]
    async fn test_check_location_follows_master_change() {
        let primary = MemoryBackend::new();
        let connector = Arc::new(MemoryConnector::new("a:6379", primary.clone()));
        let resolver = TopologyResolver::connect(connector.clone()).await.unwrap();

        assert!(!resolver.check_location().await.unwrap());

        connector.fail_over_to("b:6379", primary.replica());
        assert!(resolver.check_location().await.unwrap());
        assert_eq!(resolver.current().await.unwrap().endpoint(), "b:6379");
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let connector = Arc::new(MemoryConnector::new("a:6379", MemoryBackend::new()));
        let resolver = Arc::new(TopologyResolver::connect(connector.clone()).await.unwrap());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(resolver.clone().watch(Duration::from_millis(5), cancel.clone()));
        connector.fail_over_to("b:6379", MemoryBackend::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(resolver.current().await.unwrap().endpoint(), "b:6379");
    }
}
