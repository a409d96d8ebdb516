//! Task transport over Redis Streams.
//!
//! Producers `XADD` a JSON [`TaskEnvelope`] into the task stream under the field
//! `data`. Workers in a consumer group read, run, and acknowledge each entry.
//! When the envelope names a `reply_to` list, the worker pushes a
//! [`TaskOutcome`] onto it so the caller can collect the result with `BLPOP`.

mod worker;

pub use worker::Worker;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrokerConfig, redis_manager_config};
use crate::error::{QueueError, ServiceResult};
use crate::task::{PROCESS_DOCUMENT, ProcessDocument};

/// Stream entry field holding the serialized envelope
pub const PAYLOAD_FIELD: &str = "data";

const REPLY_KEY_PREFIX: &str = "task_result:";

/// List key a caller waits on for the outcome of `task_id`
pub fn reply_key(task_id: Uuid) -> String {
    format!("{}{}", REPLY_KEY_PREFIX, task_id)
}

/// A task invocation as carried on the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    /// Registered task name, e.g. `process_document`
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Envelope for a `process_document` call, passing every argument by keyword
    pub fn process_document(task: &ProcessDocument, want_reply: bool) -> Result<Self, QueueError> {
        let kwargs = match serde_json::to_value(task).map_err(QueueError::Serialization)? {
            Value::Object(kwargs) => kwargs,
            other => {
                return Err(QueueError::UnexpectedResponse {
                    message: format!("task arguments serialized as {}", other),
                });
            }
        };

        let task_id = Uuid::new_v4();
        Ok(Self {
            task_id,
            name: PROCESS_DOCUMENT.to_string(),
            args: Vec::new(),
            kwargs,
            reply_to: want_reply.then(|| reply_key(task_id)),
            enqueued_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Result of one task run, as pushed to the reply list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn success(task_id: Uuid, result: String) -> Self {
        Self {
            task_id,
            status: OutcomeStatus::Success,
            result: Some(result),
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(task_id: Uuid, error: String) -> Self {
        Self {
            task_id,
            status: OutcomeStatus::Failure,
            result: None,
            error: Some(error),
            finished_at: Utc::now(),
        }
    }
}

/// One entry read from the task stream
#[derive(Debug)]
pub(crate) struct StreamMessage {
    pub(crate) stream_id: String,
    /// `None` when the entry had no decodable payload
    pub(crate) envelope: Option<TaskEnvelope>,
}

/// Parse an `XREADGROUP` reply.
///
/// Reply shape: `[[stream_name, [[id, [field, value, ...]], ...]], ...]`, or nil
/// when the block timed out.
pub(crate) fn parse_stream_response(
    response: redis::Value,
) -> Result<Vec<StreamMessage>, QueueError> {
    let mut messages = Vec::new();

    let streams = match response {
        redis::Value::Array(streams) => streams,
        redis::Value::Nil => return Ok(messages),
        other => {
            return Err(QueueError::UnexpectedResponse {
                message: format!("XREADGROUP returned {:?}", other),
            });
        }
    };

    for stream in streams {
        let redis::Value::Array(mut stream_data) = stream else {
            continue;
        };
        if stream_data.len() < 2 {
            continue;
        }
        let redis::Value::Array(entries) = stream_data.swap_remove(1) else {
            continue;
        };

        for entry in entries {
            let redis::Value::Array(entry) = entry else {
                continue;
            };
            if entry.len() < 2 {
                continue;
            }

            let stream_id = match &entry[0] {
                redis::Value::BulkString(id) => String::from_utf8_lossy(id).to_string(),
                _ => continue,
            };

            let envelope = match &entry[1] {
                redis::Value::Array(fields) => decode_payload(&stream_id, fields),
                _ => None,
            };

            messages.push(StreamMessage {
                stream_id,
                envelope,
            });
        }
    }

    Ok(messages)
}

fn decode_payload(stream_id: &str, fields: &[redis::Value]) -> Option<TaskEnvelope> {
    for pair in fields.chunks(2) {
        if let [redis::Value::BulkString(key), redis::Value::BulkString(value)] = pair
            && key.as_slice() == PAYLOAD_FIELD.as_bytes()
        {
            return match serde_json::from_slice::<TaskEnvelope>(value) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(
                        stream_id = %stream_id,
                        error = %e,
                        "Failed to deserialize task envelope"
                    );
                    None
                }
            };
        }
    }

    warn!(stream_id = %stream_id, "Stream entry has no task payload");
    None
}

/// Producer side: submits tasks and collects their outcomes
#[derive(Clone)]
pub struct TaskClient {
    conn: ConnectionManager,
    stream: String,
}

impl TaskClient {
    pub async fn connect(config: &BrokerConfig) -> ServiceResult<Self> {
        let client = redis::Client::open(config.url()).map_err(QueueError::Connection)?;
        let conn = ConnectionManager::new_with_config(client, redis_manager_config())
            .await
            .map_err(QueueError::Connection)?;

        info!(
            url = %config.redacted_url(),
            stream = %config.stream,
            "Connected to task broker"
        );
        Ok(Self {
            conn,
            stream: config.stream.clone(),
        })
    }

    /// Queue a `process_document` task.
    ///
    /// Returns the task ID and, when a reply was requested, the key to pass to
    /// [`TaskClient::wait_for_result`].
    pub async fn enqueue(
        &self,
        task: &ProcessDocument,
        want_reply: bool,
    ) -> ServiceResult<(Uuid, Option<String>)> {
        let envelope = TaskEnvelope::process_document(task, want_reply)?;
        self.enqueue_envelope(&envelope).await?;
        Ok((envelope.task_id, envelope.reply_to))
    }

    /// Append a prepared envelope to the task stream
    pub async fn enqueue_envelope(&self, envelope: &TaskEnvelope) -> ServiceResult<String> {
        let payload = serde_json::to_string(envelope).map_err(QueueError::Serialization)?;

        let mut conn = self.conn.clone();
        let stream_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Command)?;

        debug!(
            task_id = %envelope.task_id,
            name = %envelope.name,
            stream_id = %stream_id,
            "Enqueued task"
        );
        Ok(stream_id)
    }

    /// Wait up to `timeout` for a task outcome. Returns `None` on timeout.
    ///
    /// Blocks the underlying connection while waiting, so use a dedicated client
    /// for long waits.
    pub async fn wait_for_result(
        &self,
        reply_key: &str,
        timeout: Duration,
    ) -> ServiceResult<Option<TaskOutcome>> {
        // BLPOP treats 0 as "wait forever"
        let timeout_secs = timeout.as_secs_f64().max(0.01);

        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(reply_key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Command)?;

        let Some((_, payload)) = popped else {
            return Ok(None);
        };

        let outcome = serde_json::from_str(&payload).map_err(QueueError::Serialization)?;
        Ok(Some(outcome))
    }
}
