use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, ServiceError, ServiceResult};

/// Turns text into a dense vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>>;
}

/// Embedding client for an Ollama server
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    /// Create a new embedding client
    pub fn new(config: &EmbeddingConfig) -> ServiceResult<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Connection {
                url: base_url.clone(),
                source: e,
            })?;

        info!(model = %config.model, url = %base_url, "Initializing embedding client");

        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check if the embedding server is reachable. Never fails; the result is
    /// only used for logging at startup.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "Embedding service health check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Embedding service health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(classify_failure(&self.model, status, message));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(EmbeddingError::InvalidResponse)?;

        if body.embedding.is_empty() {
            return Err(EmbeddingError::EmptyEmbedding.into());
        }

        debug!(dims = body.embedding.len(), "Generated embedding");
        Ok(body.embedding)
    }
}

fn classify_failure(model: &str, status: u16, message: String) -> ServiceError {
    if message.contains("model") && message.contains("not found") {
        return EmbeddingError::ModelNotFound {
            model: model.to_string(),
        }
        .into();
    }
    EmbeddingError::Request { status, message }.into()
}

/// Ollama embedding request
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

/// Ollama embedding response
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}
