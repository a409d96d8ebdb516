//! Stream consumer that runs queued tasks.

use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{StreamMessage, TaskEnvelope, TaskOutcome, parse_stream_response};
use crate::config::{BrokerConfig, redis_manager_config};
use crate::error::{QueueError, ServiceError, ServiceResult, format_error_chain};
use crate::task::{DocumentProcessor, PROCESS_DOCUMENT, ProcessDocument};

/// Pause after a failed read before trying again
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consumer-group member that processes one task at a time.
///
/// The connection manager reconnects after the broker drops the connection; a
/// failed read is retried after `RETRY_DELAY`.
pub struct Worker {
    conn: ConnectionManager,
    config: BrokerConfig,
    processor: DocumentProcessor,
}

impl Worker {
    pub async fn connect(
        config: &BrokerConfig,
        processor: DocumentProcessor,
    ) -> ServiceResult<Self> {
        let client = redis::Client::open(config.url()).map_err(QueueError::Connection)?;
        let conn = ConnectionManager::new_with_config(client, redis_manager_config())
            .await
            .map_err(QueueError::Connection)?;

        Ok(Self {
            conn,
            config: config.clone(),
            processor,
        })
    }

    /// Create the consumer group (and the stream) if needed
    async fn ensure_group(&mut self) -> ServiceResult<()> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            // Group already exists
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(e).into()),
        }
    }

    /// Consume tasks until `shutdown` is cancelled.
    ///
    /// Reads are never interrupted, so every delivered entry is handled before
    /// the loop exits. Shutdown therefore waits at most one `block_ms` interval
    /// plus the task in hand.
    pub async fn run(mut self, shutdown: CancellationToken) -> ServiceResult<()> {
        self.ensure_group().await?;

        info!(
            stream = %self.config.stream,
            consumer_group = %self.config.consumer_group,
            consumer_name = %self.config.consumer_name,
            "Task worker started"
        );

        while !shutdown.is_cancelled() {
            match self.read_batch().await {
                Ok(messages) => {
                    for message in messages {
                        self.handle(message).await;
                    }
                }
                Err(e) => {
                    error!(error = %format_error_chain(&e), "Error reading from task stream");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }

                    // A broker restarted without persistence has lost the group
                    if is_missing_group(&e) {
                        warn!(
                            consumer_group = %self.config.consumer_group,
                            "Consumer group missing, recreating"
                        );
                        if let Err(e) = self.ensure_group().await {
                            error!(
                                error = %format_error_chain(&e),
                                "Failed to recreate consumer group"
                            );
                        }
                    }
                }
            }
        }

        info!("Task worker stopped");
        Ok(())
    }

    async fn read_batch(&mut self) -> ServiceResult<Vec<StreamMessage>> {
        // ">" asks for entries never delivered to any consumer of the group
        let response: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config.block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await
            .map_err(QueueError::Command)?;

        Ok(parse_stream_response(response)?)
    }

    async fn handle(&mut self, message: StreamMessage) {
        if let Some(envelope) = &message.envelope {
            let outcome = execute(&self.processor, envelope).await;
            if let Some(reply_to) = &envelope.reply_to {
                self.reply(reply_to, &outcome).await;
            }
        }

        // Acknowledged whatever the outcome; redelivery is the producer's decision
        let ack: redis::RedisResult<i64> = redis::cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.consumer_group)
            .arg(&message.stream_id)
            .query_async(&mut self.conn)
            .await;

        if let Err(e) = ack {
            warn!(stream_id = %message.stream_id, error = %e, "Failed to acknowledge task");
        }
    }

    async fn reply(&mut self, reply_to: &str, outcome: &TaskOutcome) {
        let payload = match serde_json::to_string(outcome) {
            Ok(payload) => payload,
            Err(e) => {
                error!(task_id = %outcome.task_id, error = %e, "Failed to encode task outcome");
                return;
            }
        };

        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(reply_to)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(reply_to)
            .arg(self.config.result_ttl_secs)
            .ignore()
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => debug!(
                task_id = %outcome.task_id,
                reply_to = %reply_to,
                "Stored task outcome"
            ),
            Err(e) => warn!(
                task_id = %outcome.task_id,
                error = %e,
                "Failed to store task outcome"
            ),
        }
    }
}

fn is_missing_group(error: &ServiceError) -> bool {
    matches!(error, ServiceError::Queue(QueueError::Command(e)) if e.to_string().contains("NOGROUP"))
}

/// Run one envelope and describe how it went
pub(crate) async fn execute(processor: &DocumentProcessor, envelope: &TaskEnvelope) -> TaskOutcome {
    if envelope.name != PROCESS_DOCUMENT {
        warn!(task_id = %envelope.task_id, name = %envelope.name, "Unknown task, skipping");
        return TaskOutcome::failure(envelope.task_id, format!("Unknown task: {}", envelope.name));
    }

    let result = match ProcessDocument::from_call(envelope.args.clone(), envelope.kwargs.clone()) {
        Ok(task) => processor.process_document(&task).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(message) => {
            info!(task_id = %envelope.task_id, result = %message, "Task succeeded");
            TaskOutcome::success(envelope.task_id, message)
        }
        Err(e) => {
            let error = format_error_chain(&e);
            error!(task_id = %envelope.task_id, error = %error, "Task failed");
            TaskOutcome::failure(envelope.task_id, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{RecordingCache, spawn_fake_redis};
    use crate::queue::{OutcomeStatus, TaskClient};
    use crate::task::tests::{StubEmbedder, StubIndex, sample_task};
    use std::sync::Arc;

    /// `host:port` of a disposable Redis server
    const TEST_REDIS_VAR: &str = "KNOWLEDGE_TEST_REDIS_ADDR";

    fn processor(embed_fails: bool) -> DocumentProcessor {
        DocumentProcessor::new(
            Arc::new(StubEmbedder {
                fail: embed_fails,
                ..Default::default()
            }),
            Arc::new(StubIndex::default()),
            Some(Arc::new(RecordingCache::default())),
        )
    }

    #[tokio::test]
    async fn test_execute_success() {
        let envelope = TaskEnvelope::process_document(&sample_task(), true).unwrap();

        let outcome = execute(&processor(false), &envelope).await;

        assert_eq!(outcome.task_id, envelope.task_id);
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            outcome.result.as_deref(),
            Some("Document notes.txt processed and indexed.")
        );
    }

    #[tokio::test]
    async fn test_execute_reports_task_failure() {
        let envelope = TaskEnvelope::process_document(&sample_task(), true).unwrap();

        let outcome = execute(&processor(true), &envelope).await;

        assert_eq!(outcome.status, OutcomeStatus::Failure);
        let error = outcome.error.unwrap();
        assert!(error.starts_with("Embedding generation failed"), "{}", error);
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_task() {
        let mut envelope = TaskEnvelope::process_document(&sample_task(), false).unwrap();
        envelope.name = "summarize".to_string();

        let outcome = execute(&processor(false), &envelope).await;

        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert_eq!(outcome.error.as_deref(), Some("Unknown task: summarize"));
    }

    #[tokio::test]
    async fn test_execute_rejects_bad_arguments() {
        let mut envelope = TaskEnvelope::process_document(&sample_task(), false).unwrap();
        envelope.kwargs.remove("content");

        let outcome = execute(&processor(false), &envelope).await;

        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert!(outcome.error.unwrap().contains("content"));
    }

    #[tokio::test]
    async fn test_reads_resume_after_broker_drops_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = spawn_fake_redis(listener, Some("XREADGROUP"));

        let config: BrokerConfig = serde_json::from_value(serde_json::json!({
            "host": "127.0.0.1",
            "port": port,
            "block_ms": 10,
        }))
        .unwrap();
        let mut worker = Worker::connect(&config, processor(false)).await.unwrap();

        assert!(worker.read_batch().await.unwrap().is_empty());

        // The first read after the hang-up may fail; the manager reconnects for the next
        let mut recovered = false;
        for _ in 0..3 {
            if let Ok(messages) = worker.read_batch().await {
                assert!(messages.is_empty());
                recovered = true;
                break;
            }
        }
        assert!(recovered, "Worker never read from the new connection");
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_group_is_recognised() {
        let nogroup = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "An error was signalled by the server",
            "NOGROUP No such key 'tasks' or consumer group 'workers'".to_string(),
        ));
        let other = redis::RedisError::from((redis::ErrorKind::ResponseError, "boom"));

        assert!(is_missing_group(&QueueError::Command(nogroup).into()));
        assert!(!is_missing_group(&QueueError::Command(other).into()));
        assert!(!is_missing_group(&ServiceError::InvalidRequest {
            message: "NOGROUP".to_string()
        }));
    }

    #[tokio::test]
    async fn test_round_trip_through_stream() {
        let Ok(addr) = std::env::var(TEST_REDIS_VAR) else {
            eprintln!("Skipping stream test; set {TEST_REDIS_VAR} to run it.");
            return;
        };
        let (host, port) = addr.split_once(':').unwrap_or((addr.as_str(), "6379"));

        let config: BrokerConfig = serde_json::from_value(serde_json::json!({
            "host": host,
            "port": port.parse::<u16>().unwrap(),
            "stream": format!("test-tasks-{}", uuid::Uuid::new_v4()),
            "consumer_group": "test-workers",
            "block_ms": 100,
            "result_ttl_secs": 60,
        }))
        .unwrap();

        let client = TaskClient::connect(&config).await.unwrap();
        let worker = Worker::connect(&config, processor(false)).await.unwrap();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.run(shutdown.clone()));

        let (task_id, reply_key) = client.enqueue(&sample_task(), true).await.unwrap();
        let outcome = client
            .wait_for_result(&reply_key.unwrap(), Duration::from_secs(10))
            .await
            .unwrap()
            .expect("No outcome before timeout");

        assert_eq!(outcome.task_id, task_id);
        assert_eq!(outcome.status, OutcomeStatus::Success);

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }
}
