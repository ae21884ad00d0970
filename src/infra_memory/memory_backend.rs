use crate::domain_model::{Clock, ManualClock};
use crate::domain_port::{BackendError, KvBackend, StoredValue};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.and_then(|at| (at - now).to_std().ok())
    }
}

#[derive(Debug)]
struct Dataset {
    entries: DashMap<String, Slot>,
    clock: Arc<ManualClock>,
}

#[derive(Debug, Default)]
struct NodeState {
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

/// In-process key-value backend with expiring keys.
///
/// Time is read from a [`ManualClock`] so tests can jump past a TTL with
/// [`MemoryBackend::fast_forward`]. [`MemoryBackend::replica`] returns a
/// second node over the same dataset whose availability is toggled
/// independently, which is enough to play out a failover.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<Dataset>,
    node: Arc<NodeState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(ManualClock::default()))
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        MemoryBackend {
            data: Arc::new(Dataset {
                entries: DashMap::new(),
                clock,
            }),
            node: Arc::new(NodeState::default()),
        }
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.data.clock.clone()
    }

    /// Advance the backend's notion of time.
    pub fn fast_forward(&self, by: Duration) {
        self.data.clock.advance(by);
    }

    pub fn replica(&self) -> Self {
        MemoryBackend {
            data: self.data.clone(),
            node: Arc::new(NodeState::default()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.node.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.node.unavailable.load(Ordering::SeqCst)
    }

    /// Delay every command by `latency` before it touches the data.
    pub fn set_latency(&self, latency: Duration) {
        self.node
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = self.now();
        self.data
            .entries
            .iter()
            .filter(|slot| slot.value().is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now(&self) -> DateTime<Utc> {
        self.data.clock.now()
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn enter(&self) -> Result<(), BackendError> {
        let latency = self.node.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection refused".into()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryBackend {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, BackendError> {
        self.enter().await?;
        let now = self.now();
        let found = match self.data.entries.get(key) {
            Some(slot) if slot.is_live(now) => Some(StoredValue {
                value: slot.value.clone(),
                ttl: slot.remaining(now),
            }),
            _ => None,
        };
        if found.is_none() {
            self.data.entries.remove_if(key, |_, slot| !slot.is_live(now));
        }
        Ok(found)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), BackendError> {
        self.enter().await?;
        let now = self.now();
        self.data.entries.insert(
            key.to_owned(),
            Slot {
                value: value.to_vec(),
                expires_at: Some(self.expiry(now, ttl)),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.enter().await?;
        let now = self.now();
        let slot = Slot {
            value: value.to_vec(),
            expires_at: Some(self.expiry(now, ttl)),
        };
        match self.data.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(slot);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.enter().await?;
        let now = self.now();
        Ok(self
            .data
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        self.enter().await?;
        let now = self.now();
        Ok(self
            .data
            .entries
            .remove_if(key, |_, slot| slot.is_live(now) && slot.value == expected)
            .is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.enter().await?;
        let now = self.now();
        match self.data.entries.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.expires_at = Some(self.expiry(now, ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.enter().await
    }
}
