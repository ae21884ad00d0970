use crate::domain_port::{BackendError, KvBackend, StoredValue};
use crate::infra_redis::RedisConnection;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use std::time::Duration;

const RELEASE_LOCK: &str = include_str!("release_lock.lua");

pub struct RedisBackend {
    conn: RedisConnection,
    release: Script,
}

impl RedisBackend {
    pub fn new(conn: RedisConnection) -> Self {
        RedisBackend {
            conn,
            release: Script::new(RELEASE_LOCK),
        }
    }
}

/// Sorts redis errors into what the store can act on: connection trouble
/// and failover states are transient, bad credentials are configuration,
/// anything else is a refusal that retrying will not fix.
pub(crate) fn classify(err: RedisError) -> BackendError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_cluster_error()
    {
        return BackendError::Unavailable(err.to_string());
    }
    match err.kind() {
        ErrorKind::TryAgain
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::ReadOnly
        | ErrorKind::BusyLoadingError
        | ErrorKind::Moved
        | ErrorKind::Ask => BackendError::Unavailable(err.to_string()),
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            BackendError::Configuration(err.to_string())
        }
        _ => BackendError::Rejected(err.to_string()),
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

#[async_trait::async_trait]
impl KvBackend for RedisBackend {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(classify)?;
        let Some(value) = value else {
            return Ok(None);
        };
        let ttl_ms: i64 = conn.pttl(key).await.map_err(classify)?;
        match ttl_ms {
            // expired between the two commands
            -2 => Ok(None),
            -1 => Ok(Some(StoredValue { value, ttl: None })),
            ms => Ok(Some(StoredValue {
                value,
                ttl: Some(Duration::from_millis(ms.max(0) as u64)),
            })),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .pset_ex(key, value, millis(ttl))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(classify)?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let updated: i64 = conn
            .pexpire(key, millis(ttl) as i64)
            .await
            .map_err(classify)?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_states_are_transient() {
        for (kind, msg) in [
            (ErrorKind::ReadOnly, "READONLY You can't write against a read only replica."),
            (ErrorKind::MasterDown, "MASTERDOWN Link with MASTER is down"),
            (ErrorKind::TryAgain, "TRYAGAIN"),
            (ErrorKind::ClusterDown, "CLUSTERDOWN"),
            (ErrorKind::BusyLoadingError, "LOADING"),
        ] {
            let err = RedisError::from((kind, msg));
            assert!(classify(err).is_transient(), "{msg}");
        }
    }

    #[test]
    fn test_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(classify(RedisError::from(io)).is_transient());
    }

    #[test]
    fn test_auth_failure_is_configuration() {
        let err = RedisError::from((ErrorKind::AuthenticationFailed, "WRONGPASS"));
        assert!(matches!(classify(err), BackendError::Configuration(_)));
    }

    #[test]
    fn test_type_errors_are_not_retried() {
        let err = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        let classified = classify(err);
        assert!(matches!(classified, BackendError::Rejected(_)));
        assert!(!classified.is_transient());
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(60)), 60_000);
    }
}
