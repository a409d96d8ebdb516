use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Prefix for structured environment variables, e.g. `KNOWLEDGE__DATABASE__HOST`
const ENV_PREFIX: &str = "KNOWLEDGE";

/// Flat environment variables mapped onto config keys. They take precedence over the
/// config file and the prefixed variables.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("POSTGRES_USER", "database.user"),
    ("POSTGRES_PASSWORD", "database.password"),
    ("POSTGRES_HOST", "database.host"),
    ("POSTGRES_PORT", "database.port"),
    ("POSTGRES_DB", "database.name"),
    ("BROKER_HOST", "broker.host"),
    ("BROKER_PORT", "broker.port"),
    ("BROKER_USER", "broker.user"),
    ("BROKER_PASSWORD", "broker.password"),
    ("REDIS_HOST", "cache.host"),
    ("REDIS_PORT", "cache.port"),
    ("REDIS_PASSWORD", "cache.password"),
];

/// Worker configuration, loaded once at startup and passed to each component.
///
/// Every default is meant for local development only.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default = "default_broker")]
    pub broker: BrokerConfig,

    #[serde(default = "default_cache")]
    pub cache: CacheConfig,

    #[serde(default = "default_embedding")]
    pub embedding: EmbeddingConfig,

    #[serde(default = "default_search")]
    pub search: SearchConfig,
}

/// PostgreSQL connection settings
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_user")]
    pub user: String,

    #[serde(default = "default_database_password")]
    pub password: String,

    #[serde(default = "default_local_host")]
    pub host: String,

    #[serde(default = "default_database_port")]
    pub port: u16,

    #[serde(default = "default_database_name")]
    pub name: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Connection string for the relational store
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            self.name
        )
    }

    /// Connection string safe for logs
    pub fn redacted_url(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            urlencoding::encode(&self.user),
            self.host,
            self.port,
            self.name
        )
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.redacted_url())
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

/// Task broker (Redis Streams) settings
#[derive(Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_local_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Stream that carries task envelopes
    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Unique per worker process; generated when not configured
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// How long a single XREADGROUP call blocks waiting for work
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Expiry applied to reply lists holding task outcomes
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
}

impl BrokerConfig {
    pub fn url(&self) -> String {
        redis_url(
            &self.host,
            self.port,
            self.user.as_deref(),
            self.password.as_deref(),
            None,
            false,
        )
    }

    pub fn redacted_url(&self) -> String {
        redis_url(
            &self.host,
            self.port,
            self.user.as_deref(),
            self.password.as_deref(),
            None,
            true,
        )
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("url", &self.redacted_url())
            .field("stream", &self.stream)
            .field("consumer_group", &self.consumer_group)
            .field("consumer_name", &self.consumer_name)
            .field("block_ms", &self.block_ms)
            .field("result_ttl_secs", &self.result_ttl_secs)
            .finish()
    }
}

/// Key-value cache holding document readiness flags
#[derive(Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_local_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: u8,
}

impl CacheConfig {
    pub fn url(&self) -> String {
        redis_url(
            &self.host,
            self.port,
            None,
            self.password.as_deref(),
            Some(self.db),
            false,
        )
    }

    pub fn redacted_url(&self) -> String {
        redis_url(
            &self.host,
            self.port,
            None,
            self.password.as_deref(),
            Some(self.db),
            true,
        )
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("url", &self.redacted_url())
            .finish()
    }
}

/// Embedding service (Ollama) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Search index (Elasticsearch) configuration
#[derive(Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub url: String,

    #[serde(default = "default_search_index")]
    pub index: String,

    /// Dimensionality of the `embedding` dense vector field
    #[serde(default = "default_embedding_dims")]
    pub dims: usize,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_search_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("url", &self.url)
            .field("index", &self.index)
            .field("dims", &self.dims)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from `config.toml`, `KNOWLEDGE__*` variables, and the
    /// legacy flat variables, in increasing order of precedence.
    pub fn load() -> ServiceResult<Self> {
        let env: config::Map<String, String> = std::env::vars().collect();
        Self::load_from(Some("config"), env)
    }

    /// Load configuration from an optional file and an explicit environment map
    pub fn load_from(file: Option<&str>, env: config::Map<String, String>) -> ServiceResult<Self> {
        let mut builder = Config::builder();

        if let Some(file) = file {
            builder = builder.add_source(File::with_name(file).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone())),
        );

        for (variable, key) in LEGACY_ENV_OVERRIDES {
            if let Some(value) = env.get(*variable) {
                builder = builder
                    .set_override(*key, value.clone())
                    .map_err(|e| ServiceError::Config {
                        message: format!("Invalid value for {}: {}", variable, e),
                    })?;
            }
        }

        builder
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })
    }
}

/// Assemble a `redis://` URL with optional credentials and database index.
/// With `redact` set the password is replaced by `***`.
fn redis_url(
    host: &str,
    port: u16,
    user: Option<&str>,
    password: Option<&str>,
    db: Option<u8>,
    redact: bool,
) -> String {
    let password = password.map(|password| {
        if redact {
            "***".to_string()
        } else {
            urlencoding::encode(password).into_owned()
        }
    });

    let credentials = match (user, password) {
        (Some(user), Some(password)) => format!("{}:{}@", urlencoding::encode(user), password),
        (Some(user), None) => format!("{}@", urlencoding::encode(user)),
        (None, Some(password)) => format!(":{}@", password),
        (None, None) => String::new(),
    };

    match db {
        Some(db) => format!("redis://{}{}:{}/{}", credentials, host, port, db),
        None => format!("redis://{}{}:{}", credentials, host, port),
    }
}

/// Reconnect policy shared by every Redis connection manager. The backoff is short
/// so a caller learns quickly that the server is down and tries again on its next call.
pub(crate) fn redis_manager_config() -> redis::aio::ConnectionManagerConfig {
    redis::aio::ConnectionManagerConfig::new().set_number_of_retries(2)
}

// ==================== Default Value Functions ====================

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        user: default_database_user(),
        password: default_database_password(),
        host: default_local_host(),
        port: default_database_port(),
        name: default_database_name(),
        max_connections: default_max_connections(),
        acquire_timeout_secs: default_acquire_timeout_secs(),
    }
}

fn default_database_user() -> String {
    "postgres".to_string()
}

fn default_database_password() -> String {
    "changeme123".to_string()
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_database_port() -> u16 {
    5432
}

fn default_database_name() -> String {
    "ai_knowledge_assistant".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_broker() -> BrokerConfig {
    BrokerConfig {
        host: default_local_host(),
        port: default_redis_port(),
        user: None,
        password: None,
        stream: default_stream(),
        consumer_group: default_consumer_group(),
        consumer_name: default_consumer_name(),
        block_ms: default_block_ms(),
        result_ttl_secs: default_result_ttl_secs(),
    }
}

fn default_redis_port() -> u16 {
    6379
}

fn default_stream() -> String {
    "process_document".to_string()
}

fn default_consumer_group() -> String {
    "knowledge-workers".to_string()
}

fn default_consumer_name() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn default_block_ms() -> u64 {
    5000
}

fn default_result_ttl_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_cache() -> CacheConfig {
    CacheConfig {
        host: default_local_host(),
        port: default_redis_port(),
        password: None,
        db: 0,
    }
}

fn default_embedding() -> EmbeddingConfig {
    EmbeddingConfig {
        base_url: default_ollama_url(),
        model: default_embedding_model(),
        request_timeout_secs: default_embedding_timeout_secs(),
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    120
}

fn default_search() -> SearchConfig {
    SearchConfig {
        url: default_search_url(),
        index: default_search_index(),
        dims: default_embedding_dims(),
        username: None,
        password: None,
        request_timeout_secs: default_search_timeout_secs(),
    }
}

fn default_search_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_search_index() -> String {
    "documents".to_string()
}

fn default_embedding_dims() -> usize {
    768
}

fn default_search_timeout_secs() -> u64 {
    30
}
