use crate::domain_port::{BackendError, KvBackend};
use std::sync::Arc;

/// A live backend together with the endpoint it talks to.
#[derive(Clone)]
pub struct Connection {
    pub endpoint: String,
    pub backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Knows how to reach the current writable node of a deployment.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, BackendError>;

    /// The endpoint that is authoritative right now, without connecting to
    /// it. Used to notice a failover before a command fails.
    async fn locate(&self) -> Result<String, BackendError>;
}
