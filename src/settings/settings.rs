use crate::application_impl::{RetryPolicy, SessionCodec, StoreOptions};
use crate::application_port::SessionStoreError;
use crate::domain_model::{DEFAULT_REFRESH_THRESHOLD, TtlPolicy};
use crate::infra_redis::{RedisCredentials, RedisTopology};
use anyhow::{Result, anyhow};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub redis: Redis,
    #[serde(default)]
    pub session: Session,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            filter: "info".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Backend {
    pub kind: String, // "memory" or "redis"
}

impl Default for Backend {
    fn default() -> Self {
        Backend {
            kind: "redis".into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Redis {
    pub mode: String, // "standalone", "cluster" or "sentinel"
    pub url: String,
    pub cluster_urls: Vec<String>,
    pub sentinel_urls: Vec<String>,
    pub sentinel_master_name: String,
    pub sentinel_password: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout_ms: u64,
    pub sentinel_check_interval_ms: u64,
}

impl Default for Redis {
    fn default() -> Self {
        Redis {
            mode: "standalone".into(),
            url: "redis://127.0.0.1:6379".into(),
            cluster_urls: Vec::new(),
            sentinel_urls: Vec::new(),
            sentinel_master_name: String::new(),
            sentinel_password: None,
            username: None,
            password: None,
            db: 0,
            connect_timeout_ms: 2_000,
            sentinel_check_interval_ms: 5_000,
        }
    }
}

// passwords stay out of the startup log
impl std::fmt::Debug for Redis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis")
            .field("mode", &self.mode)
            .field("url", &self.url)
            .field("cluster_urls", &self.cluster_urls)
            .field("sentinel_urls", &self.sentinel_urls)
            .field("sentinel_master_name", &self.sentinel_master_name)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("sentinel_check_interval_ms", &self.sentinel_check_interval_ms)
            .finish()
    }
}

impl Redis {
    pub fn topology(&self) -> Result<RedisTopology, SessionStoreError> {
        match self.mode.as_str() {
            "standalone" => Ok(RedisTopology::Standalone {
                url: self.url.clone(),
            }),
            "cluster" => Ok(RedisTopology::Cluster {
                urls: self.cluster_urls.clone(),
            }),
            "sentinel" => Ok(RedisTopology::Sentinel {
                urls: self.sentinel_urls.clone(),
                master_name: self.sentinel_master_name.clone(),
            }),
            other => Err(SessionStoreError::Configuration(format!(
                "unknown redis mode: {other}"
            ))),
        }
    }

    pub fn credentials(&self) -> RedisCredentials {
        RedisCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            sentinel_password: self.sentinel_password.clone(),
            db: self.db,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sentinel_check_interval(&self) -> Duration {
        Duration::from_millis(self.sentinel_check_interval_ms)
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Session {
    pub key_prefix: String,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub refresh_threshold: f64,
    pub lock_ttl_ms: u64,
    /// Unset means payloads are stored in plain JSON.
    pub encryption_secret: Option<String>,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub call_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for Session {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Session {
            key_prefix: crate::application_impl::DEFAULT_KEY_PREFIX.into(),
            idle_timeout_secs: 168 * 3600,
            max_lifetime_secs: 168 * 3600,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            lock_ttl_ms: crate::application_impl::DEFAULT_LOCK_TTL.as_millis() as u64,
            encryption_secret: None,
            retry_max_attempts: retry.max_attempts,
            retry_initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            retry_max_backoff_ms: retry.max_backoff.as_millis() as u64,
            call_timeout_ms: crate::application_impl::DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            operation_timeout_ms: crate::application_impl::DEFAULT_OPERATION_TIMEOUT.as_millis()
                as u64,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key_prefix", &self.key_prefix)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .field("refresh_threshold", &self.refresh_threshold)
            .field("lock_ttl_ms", &self.lock_ttl_ms)
            .field("encrypted", &self.encryption_secret.is_some())
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .finish()
    }
}

impl Session {
    pub fn store_options(&self) -> Result<StoreOptions, SessionStoreError> {
        let ttl = TtlPolicy::new(
            Duration::from_secs(self.idle_timeout_secs),
            Duration::from_secs(self.max_lifetime_secs),
            self.refresh_threshold,
        )?;
        if self.key_prefix.is_empty() {
            return Err(SessionStoreError::Configuration(
                "session key prefix must not be empty".into(),
            ));
        }
        if self.lock_ttl_ms == 0 || self.call_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(SessionStoreError::Configuration(
                "lock ttl and timeouts must be positive".into(),
            ));
        }
        let codec = SessionCodec::from_secret(self.encryption_secret.as_deref())?;

        let mut options = StoreOptions::new(ttl);
        options.key_prefix = self.key_prefix.clone();
        options.codec = codec;
        options.lock_ttl = Duration::from_millis(self.lock_ttl_ms);
        options.retry = RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryPolicy::default()
        };
        options.call_timeout = Duration::from_millis(self.call_timeout_ms);
        options.operation_timeout = Duration::from_millis(self.operation_timeout_ms);
        Ok(options)
    }
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

/// Environment overrides use `TICKETVAULT__SECTION__KEY`, for example
/// `TICKETVAULT__SESSION__ENCRYPTION_SECRET`.
pub const ENV_PREFIX: &str = "TICKETVAULT";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .add_source(environment())
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}
