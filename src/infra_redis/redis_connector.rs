use crate::domain_port::{BackendError, Connection, Connector, KvBackend};
use crate::infra_redis::{RedisBackend, RedisConnection, classify};
use redis::cluster::ClusterClientBuilder;
use redis::{ConnectionInfo, IntoConnectionInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the writable node of a deployment is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisTopology {
    Standalone {
        url: String,
    },
    Cluster {
        urls: Vec<String>,
    },
    Sentinel {
        urls: Vec<String>,
        master_name: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedisCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sentinels are often secured separately from the data nodes.
    pub sentinel_password: Option<String>,
    pub db: i64,
}

pub struct RedisConnector {
    topology: RedisTopology,
    credentials: RedisCredentials,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Validates every configured URL up front so a typo fails at startup
    /// rather than on the first failover.
    pub fn new(
        topology: RedisTopology,
        credentials: RedisCredentials,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        match &topology {
            RedisTopology::Standalone { url } => {
                parse_url(url)?;
            }
            RedisTopology::Cluster { urls } => {
                if urls.is_empty() {
                    return Err(BackendError::Configuration(
                        "cluster mode needs at least one node url".into(),
                    ));
                }
                for url in urls {
                    parse_url(url)?;
                }
            }
            RedisTopology::Sentinel { urls, master_name } => {
                if urls.is_empty() {
                    return Err(BackendError::Configuration(
                        "sentinel mode needs at least one sentinel url".into(),
                    ));
                }
                if master_name.trim().is_empty() {
                    return Err(BackendError::Configuration(
                        "sentinel mode needs a master name".into(),
                    ));
                }
                for url in urls {
                    parse_url(url)?;
                }
            }
        }
        Ok(RedisConnector {
            topology,
            credentials,
            connect_timeout,
        })
    }

    pub fn topology(&self) -> &RedisTopology {
        &self.topology
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.connect_timeout, fut).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(BackendError::Unavailable(format!(
                "{} did not answer within {:?}",
                what, self.connect_timeout
            ))),
        }
    }

    /// Apply configured credentials to a data node address. Credentials in
    /// the URL win over the configured ones.
    fn data_node_info(&self, mut info: ConnectionInfo) -> ConnectionInfo {
        if info.redis.username.is_none() {
            info.redis.username = self.credentials.username.clone();
        }
        if info.redis.password.is_none() {
            info.redis.password = self.credentials.password.clone();
        }
        if info.redis.db == 0 {
            info.redis.db = self.credentials.db;
        }
        info
    }

    fn sentinel_info(&self, url: &str) -> Result<ConnectionInfo, BackendError> {
        let mut info = parse_url(url)?;
        if info.redis.password.is_none() {
            info.redis.password = self.credentials.sentinel_password.clone();
        }
        // sentinels only have db 0
        info.redis.db = 0;
        Ok(info)
    }

    async fn open_single(&self, info: ConnectionInfo) -> Result<RedisConnection, BackendError> {
        let endpoint = info.addr.to_string();
        let client = redis::Client::open(info).map_err(classify)?;
        let manager = self
            .bounded(&endpoint, client.get_connection_manager())
            .await?;
        Ok(RedisConnection::Single(manager))
    }

    async fn open_cluster(&self, urls: &[String]) -> Result<RedisConnection, BackendError> {
        let mut builder = ClusterClientBuilder::new(urls.to_vec());
        if let Some(username) = &self.credentials.username {
            builder = builder.username(username.clone());
        }
        if let Some(password) = &self.credentials.password {
            builder = builder.password(password.clone());
        }
        let client = builder.build().map_err(classify)?;
        let conn = self
            .bounded("redis cluster", client.get_async_connection())
            .await?;
        Ok(RedisConnection::Cluster(conn))
    }

    async fn ask_sentinel(
        &self,
        url: &str,
        master_name: &str,
    ) -> Result<Option<(String, u16)>, BackendError> {
        let client = redis::Client::open(self.sentinel_info(url)?).map_err(classify)?;
        let mut conn = self
            .bounded(url, client.get_multiplexed_async_connection())
            .await?;
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("get-master-addr-by-name").arg(master_name);
        self.bounded(url, cmd.query_async(&mut conn)).await
    }

    pub async fn discover_master(
        &self,
        urls: &[String],
        master_name: &str,
    ) -> Result<(String, u16), BackendError> {
        first_known_master(urls, master_name, |url| self.ask_sentinel(url, master_name)).await
    }
}

/// First sentinel that knows the master wins. Unreachable sentinels and
/// sentinels that have never heard of the master are skipped.
async fn first_known_master<'a, F, Fut>(
    urls: &'a [String],
    master_name: &str,
    mut ask: F,
) -> Result<(String, u16), BackendError>
where
    F: FnMut(&'a str) -> Fut,
    Fut: Future<Output = Result<Option<(String, u16)>, BackendError>>,
{
    let mut failures = Vec::new();
    for url in urls {
        match ask(url.as_str()).await {
            Ok(Some(addr)) => {
                debug!(sentinel = %url, master = %format!("{}:{}", addr.0, addr.1), "sentinel reported master");
                return Ok(addr);
            }
            Ok(None) => failures.push(format!("{url}: unknown master {master_name}")),
            Err(e) => {
                warn!(sentinel = %url, error = %e, "sentinel query failed");
                failures.push(format!("{url}: {e}"));
            }
        }
    }
    Err(BackendError::Unavailable(format!(
        "no sentinel could name master {}: {}",
        master_name,
        failures.join("; ")
    )))
}

fn parse_url(url: &str) -> Result<ConnectionInfo, BackendError> {
    url.into_connection_info()
        .map_err(|e| BackendError::Configuration(format!("invalid redis url {url:?}: {e}")))
}

#[async_trait::async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Connection, BackendError> {
        let (endpoint, conn) = match &self.topology {
            RedisTopology::Standalone { url } => {
                let info = self.data_node_info(parse_url(url)?);
                let endpoint = info.addr.to_string();
                (endpoint, self.open_single(info).await?)
            }
            RedisTopology::Cluster { urls } => (urls.join(","), self.open_cluster(urls).await?),
            RedisTopology::Sentinel { urls, master_name } => {
                let (host, port) = self.discover_master(urls, master_name).await?;
                let endpoint = format!("{host}:{port}");
                let info = (host, port).into_connection_info().map_err(classify)?;
                (endpoint, self.open_single(self.data_node_info(info)).await?)
            }
        };

        let backend = RedisBackend::new(conn);
        match tokio::time::timeout(self.connect_timeout, backend.ping()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Unavailable(format!(
                    "{endpoint} did not answer PING within {:?}",
                    self.connect_timeout
                )));
            }
        }
        Ok(Connection {
            endpoint,
            backend: Arc::new(backend),
        })
    }

    async fn locate(&self) -> Result<String, BackendError> {
        match &self.topology {
            RedisTopology::Standalone { url } => Ok(parse_url(url)?.addr.to_string()),
            RedisTopology::Cluster { urls } => Ok(urls.join(",")),
            RedisTopology::Sentinel { urls, master_name } => {
                let (host, port) = self.discover_master(urls, master_name).await?;
                Ok(format!("{host}:{port}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> RedisCredentials {
        RedisCredentials {
            username: Some("proxy".into()),
            password: Some("data-secret".into()),
            sentinel_password: Some("sentinel-secret".into()),
            db: 3,
        }
    }

    fn sentinel_connector() -> RedisConnector {
        RedisConnector::new(
            RedisTopology::Sentinel {
                urls: vec!["redis://127.0.0.1:26379".into()],
                master_name: "mymaster".into(),
            },
            credentials(),
            DEFAULT_CONNECT_TIMEOUT,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let bad_url = RedisConnector::new(
            RedisTopology::Standalone {
                url: "not a url".into(),
            },
            RedisCredentials::default(),
            DEFAULT_CONNECT_TIMEOUT,
        );
        assert!(matches!(bad_url, Err(BackendError::Configuration(_))));

        let no_nodes = RedisConnector::new(
            RedisTopology::Cluster { urls: vec![] },
            RedisCredentials::default(),
            DEFAULT_CONNECT_TIMEOUT,
        );
        assert!(matches!(no_nodes, Err(BackendError::Configuration(_))));

        let no_master = RedisConnector::new(
            RedisTopology::Sentinel {
                urls: vec!["redis://127.0.0.1:26379".into()],
                master_name: " ".into(),
            },
            RedisCredentials::default(),
            DEFAULT_CONNECT_TIMEOUT,
        );
        assert!(matches!(no_master, Err(BackendError::Configuration(_))));
    }

    #[test]
    fn test_data_node_gets_configured_credentials() {
        let connector = sentinel_connector();
        let info = ("10.0.0.7".to_string(), 6380).into_connection_info().unwrap();
        let info = connector.data_node_info(info);
        assert_eq!(info.addr.to_string(), "10.0.0.7:6380");
        assert_eq!(info.redis.username.as_deref(), Some("proxy"));
        assert_eq!(info.redis.password.as_deref(), Some("data-secret"));
        assert_eq!(info.redis.db, 3);
    }

    #[test]
    fn test_url_credentials_win() {
        let connector = sentinel_connector();
        let info = connector.data_node_info(parse_url("redis://:inline@127.0.0.1:6379/1").unwrap());
        assert_eq!(info.redis.password.as_deref(), Some("inline"));
        assert_eq!(info.redis.db, 1);
    }

    #[test]
    fn test_sentinel_uses_sentinel_password() {
        let connector = sentinel_connector();
        let info = connector.sentinel_info("redis://127.0.0.1:26379").unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("sentinel-secret"));
        assert_eq!(info.redis.db, 0);
    }

    fn sentinels() -> Vec<String> {
        vec![
            "redis://10.0.0.1:26379".into(),
            "redis://10.0.0.2:26379".into(),
            "redis://10.0.0.3:26379".into(),
        ]
    }

    #[tokio::test]
    async fn test_sentinel_without_master_is_skipped() {
        let urls = sentinels();
        let mut asked = Vec::new();
        let found = first_known_master(&urls, "mymaster", |url| {
            asked.push(url.to_string());
            let answer = match url {
                "redis://10.0.0.1:26379" => Ok(None),
                "redis://10.0.0.2:26379" => Ok(Some(("10.0.0.9".to_string(), 6379))),
                _ => Ok(Some(("10.0.0.8".to_string(), 6379))),
            };
            async move { answer }
        })
        .await;

        assert_eq!(found, Ok(("10.0.0.9".to_string(), 6379)));
        assert_eq!(asked, ["redis://10.0.0.1:26379", "redis://10.0.0.2:26379"]);
    }

    #[tokio::test]
    async fn test_failing_sentinel_is_skipped() {
        let urls = sentinels();
        let found = first_known_master(&urls, "mymaster", |url| {
            let answer = match url {
                "redis://10.0.0.1:26379" => Err(BackendError::Unavailable("refused".into())),
                "redis://10.0.0.2:26379" => Ok(None),
                _ => Ok(Some(("10.0.0.8".to_string(), 6380))),
            };
            async move { answer }
        })
        .await;
        assert_eq!(found, Ok(("10.0.0.8".to_string(), 6380)));
    }

    #[tokio::test]
    async fn test_no_sentinel_knows_master() {
        let urls = sentinels();
        let found = first_known_master(&urls, "mymaster", |_| async { Ok(None) }).await;
        match found {
            Err(BackendError::Unavailable(message)) => {
                assert!(message.contains("unknown master mymaster"), "{message}");
                assert!(message.contains("redis://10.0.0.3:26379"), "{message}");
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_sentinels_are_unavailable() {
        let connector = RedisConnector::new(
            RedisTopology::Sentinel {
                urls: vec!["redis://127.0.0.1:1".into()],
                master_name: "mymaster".into(),
            },
            RedisCredentials::default(),
            Duration::from_millis(200),
        )
        .unwrap();
        let result = connector.locate().await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }
}
