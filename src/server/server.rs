use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_memory::*;
use crate::infra_redis::*;
use crate::logger::*;
use crate::settings::Settings;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Server {
    store: Arc<RealSessionStore>,
    resolver: Arc<TopologyResolver>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Server {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let options = settings.session.store_options()?;

        let connector: Arc<dyn Connector>;
        let clock: Arc<dyn Clock>;
        let mut watch_interval = None;
        match settings.backend.kind.as_str() {
            "memory" => {
                // follows wall time, but stays a ManualClock so the node and
                // the store agree on "now"
                let manual = Arc::new(ManualClock::system());
                let node = MemoryBackend::with_clock(manual.clone());
                connector = Arc::new(MemoryConnector::new("memory:0", node));
                clock = manual;
            }
            "redis" => {
                let topology = settings.redis.topology()?;
                if let RedisTopology::Sentinel { .. } = topology {
                    watch_interval = Some(settings.redis.sentinel_check_interval());
                }
                connector = Arc::new(
                    RedisConnector::new(
                        topology,
                        settings.redis.credentials(),
                        settings.redis.connect_timeout(),
                    )
                    .map_err(SessionStoreError::from)?,
                );
                clock = Arc::new(SystemClock);
            }
            other => return Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        }

        let resolver = Arc::new(
            TopologyResolver::connect(connector)
                .await
                .map_err(SessionStoreError::from)?,
        );
        Ok(Self::from_parts(resolver, options, clock, watch_interval))
    }

    /// Wire a store over an already connected resolver. A watch interval
    /// starts a background task that follows master changes.
    pub fn from_parts(
        resolver: Arc<TopologyResolver>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
        watch_interval: Option<Duration>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let store = Arc::new(
            RealSessionStore::new(resolver.clone(), options, clock).with_shutdown(cancel.clone()),
        );

        let watch_handle = watch_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| tokio::spawn(resolver.clone().watch(interval, cancel.clone())));

        info!("session store ready");

        Self {
            store,
            resolver,
            watch_handle: Mutex::new(watch_handle),
            cancel,
        }
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    pub fn store(&self) -> &RealSessionStore {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<TopologyResolver> {
        &self.resolver
    }

    pub async fn shutdown(&self) {
        info!("session store shutting down...");

        self.cancel.cancel();

        let handle = match self.watch_handle.lock() {
            Ok(mut lock) => lock.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let r = handle.await;
            info!("topology watch handle dropped: {:?}", r);
        }
    }
}
