use crate::domain_port::{BackendError, Connection, Connector};
use crate::infra_memory::MemoryBackend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Primary {
    endpoint: String,
    backend: MemoryBackend,
}

/// Hands out whichever in-memory node is currently primary.
#[derive(Debug)]
pub struct MemoryConnector {
    primary: Mutex<Primary>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(endpoint: impl Into<String>, backend: MemoryBackend) -> Self {
        MemoryConnector {
            primary: Mutex::new(Primary {
                endpoint: endpoint.into(),
                backend,
            }),
            connects: AtomicUsize::new(0),
        }
    }

    /// Promote another node, as a sentinel would after the primary fails.
    pub fn fail_over_to(&self, endpoint: impl Into<String>, backend: MemoryBackend) {
        let mut primary = match self.primary.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *primary = Primary {
            endpoint: endpoint.into(),
            backend,
        };
    }

    /// How many successful connects have been made.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn primary(&self) -> Primary {
        match self.primary.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, BackendError> {
        let primary = self.primary();
        if !primary.backend.is_available() {
            return Err(BackendError::Unavailable(format!(
                "{} is not reachable",
                primary.endpoint
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Connection {
            endpoint: primary.endpoint,
            backend: Arc::new(primary.backend),
        })
    }

    async fn locate(&self) -> Result<String, BackendError> {
        Ok(self.primary().endpoint)
    }
}
