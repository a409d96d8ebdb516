//! Document readiness flags in Redis.
//!
//! The processing task writes `doc_status:<es_doc_id> = ready` once a document is
//! searchable. The API layer polls the same key; an absent key means the document
//! is still pending (or was never submitted).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, RedisError};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{CacheConfig, redis_manager_config};
use crate::error::{CacheError, ServiceError, ServiceResult};

/// Value stored once a document is indexed
pub const READY_STATUS: &str = "ready";

/// How long a readiness flag lives
pub const READY_TTL: Duration = Duration::from_secs(86_400);

const STATUS_KEY_PREFIX: &str = "doc_status:";

/// Cache key holding the status of a document
pub fn status_key(es_doc_id: &str) -> String {
    format!("{}{}", STATUS_KEY_PREFIX, es_doc_id)
}

/// Processing state as seen by readers of the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStatus {
    Ready,
    Pending,
    Other(String),
}

impl DocumentStatus {
    fn from_value(value: Option<String>) -> Self {
        match value {
            None => DocumentStatus::Pending,
            Some(value) if value == READY_STATUS => DocumentStatus::Ready,
            Some(value) => DocumentStatus::Other(value),
        }
    }
}

/// Key-value store with per-key expiry
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> ServiceResult<()>;

    async fn get_value(&self, key: &str) -> ServiceResult<Option<String>>;
}

/// Flag a document as ready for search
pub async fn mark_ready(cache: &dyn StatusCache, es_doc_id: &str) -> ServiceResult<()> {
    cache
        .set_with_expiry(&status_key(es_doc_id), READY_STATUS, READY_TTL)
        .await
}

/// Read the processing state of a document
pub async fn document_status(
    cache: &dyn StatusCache,
    es_doc_id: &str,
) -> ServiceResult<DocumentStatus> {
    let value = cache.get_value(&status_key(es_doc_id)).await?;
    Ok(DocumentStatus::from_value(value))
}

/// Redis-backed status cache.
///
/// The connection is opened on first use. If the server is down at that point the
/// call fails and the next one tries again. Once open, the connection manager
/// re-establishes dropped connections by itself.
pub struct RedisStatusCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    redacted_url: String,
}

impl RedisStatusCache {
    /// Build a cache client without touching the server
    pub fn new(config: &CacheConfig) -> ServiceResult<Self> {
        let client = redis::Client::open(config.url()).map_err(CacheError::Connection)?;

        Ok(Self {
            client,
            conn: OnceCell::new(),
            redacted_url: config.redacted_url(),
        })
    }

    /// Open the connection now and round-trip a PING
    pub async fn ping(&self) -> ServiceResult<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn connection(&self) -> ServiceResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn =
                    ConnectionManager::new_with_config(self.client.clone(), redis_manager_config())
                        .await
                        .map_err(CacheError::Connection)?;
                info!(url = %self.redacted_url, "Connected to status cache");
                Ok::<_, ServiceError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run a command, retrying once if the connection was lost underneath it.
    /// Only idempotent commands go through here.
    async fn query<T: FromRedisValue + Send>(&self, cmd: &redis::Cmd) -> ServiceResult<T> {
        let mut conn = self.connection().await?;

        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_lost(&e) => {
                warn!(
                    url = %self.redacted_url,
                    error = %e,
                    "Status cache connection lost, retrying"
                );
                Ok(cmd.query_async(&mut conn).await.map_err(CacheError::Command)?)
            }
            Err(e) => Err(CacheError::Command(e).into()),
        }
    }
}

fn is_connection_lost(error: &RedisError) -> bool {
    error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_unrecoverable_error()
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> ServiceResult<()> {
        let secs = ttl.as_secs();
        if secs == 0 {
            return Err(CacheError::Unavailable {
                message: format!("expiry for {} must be at least one second", key),
            }
            .into());
        }

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(secs);
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> ServiceResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(&cmd).await
    }
}
