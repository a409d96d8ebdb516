use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SearchConfig;
use crate::error::{IndexError, ServiceResult};

/// Document store searched by the API layer
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Store a document under `id`, replacing any previous version
    async fn index_document(
        &self,
        id: &str,
        content: &str,
        embedding: &[f32],
        metadata: &Map<String, Value>,
    ) -> ServiceResult<()>;
}

/// Elasticsearch index accessed over its REST API
pub struct ElasticsearchIndex {
    client: Client,
    base_url: String,
    index: String,
    dims: usize,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticsearchIndex {
    pub fn new(config: &SearchConfig) -> ServiceResult<Self> {
        let base_url = config.url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| IndexError::Connection {
                url: base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url,
            index: config.index.clone(),
            dims: config.dims,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }

    /// Create the index with its mapping if it does not exist yet
    pub async fn ensure_index(&self) -> ServiceResult<()> {
        let url = format!("{}/{}", self.base_url, self.index);

        let exists = self
            .authorize(self.client.head(&url))
            .send()
            .await
            .map_err(|e| IndexError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if exists.status().is_success() {
            debug!(index = %self.index, "Search index already exists");
            return Ok(());
        }

        let response = self
            .authorize(self.client.put(&url))
            .json(&index_mapping(self.dims))
            .send()
            .await
            .map_err(|e| IndexError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        if status.is_success() {
            info!(index = %self.index, dims = self.dims, "Created search index");
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        // Another worker created it between our HEAD and PUT
        if status == StatusCode::BAD_REQUEST
            && message.contains("resource_already_exists_exception")
        {
            return Ok(());
        }

        Err(IndexError::Request {
            status: status.as_u16(),
            message,
        }
        .into())
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn index_document(
        &self,
        id: &str,
        content: &str,
        embedding: &[f32],
        metadata: &Map<String, Value>,
    ) -> ServiceResult<()> {
        if embedding.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: embedding.len(),
            }
            .into());
        }

        let url = format!(
            "{}/{}/_doc/{}?refresh=wait_for",
            self.base_url,
            self.index,
            urlencoding::encode(id)
        );
        let body = document_body(content, embedding, metadata, Utc::now());

        let response = self
            .authorize(self.client.put(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| IndexError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(IndexError::Request { status, message }.into());
        }

        let body: Value = response.json().await.map_err(IndexError::InvalidResponse)?;
        let outcome = index_outcome(&body);
        debug!(id = %id, index = %self.index, result = %outcome, "Indexed document");
        Ok(())
    }
}

/// The `result` field of an index response ("created", "updated", ...)
fn index_outcome(body: &Value) -> &str {
    body.get("result")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown")
}

/// Index settings and field mapping
fn index_mapping(dims: usize) -> Value {
    json!({
        "mappings": {
            "properties": {
                "content": { "type": "text" },
                "embedding": {
                    "type": "dense_vector",
                    "dims": dims,
                    "index": true,
                    "similarity": "cosine"
                },
                "metadata": { "type": "object" },
                "filename": { "type": "keyword" },
                "indexed_at": { "type": "date" }
            }
        }
    })
}

/// Stored document source. `filename` is lifted out of the metadata so it can be
/// filtered on as a keyword.
fn document_body(
    content: &str,
    embedding: &[f32],
    metadata: &Map<String, Value>,
    indexed_at: DateTime<Utc>,
) -> Value {
    json!({
        "content": content,
        "embedding": embedding,
        "metadata": metadata,
        "filename": metadata.get("filename").cloned().unwrap_or(Value::Null),
        "indexed_at": indexed_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;

    fn config(dims: usize) -> SearchConfig {
        serde_json::from_value(json!({
            "url": "http://127.0.0.1:1/",
            "index": "documents",
            "dims": dims,
            "request_timeout_secs": 2,
        }))
        .unwrap()
    }

    #[test]
    fn test_mapping_uses_configured_dims() {
        let mapping = index_mapping(384);
        let embedding = &mapping["mappings"]["properties"]["embedding"];

        assert_eq!(embedding["type"], "dense_vector");
        assert_eq!(embedding["dims"], 384);
        assert_eq!(embedding["similarity"], "cosine");
        assert_eq!(mapping["mappings"]["properties"]["filename"]["type"], "keyword");
    }

    #[test]
    fn test_document_body() {
        let mut metadata = Map::new();
        metadata.insert("filename".to_string(), json!("report.pdf"));
        let indexed_at = DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);

        let body = document_body("text", &[0.5, -1.0], &metadata, indexed_at);

        assert_eq!(body["content"], "text");
        assert_eq!(body["embedding"], json!([0.5, -1.0]));
        assert_eq!(body["metadata"], json!({ "filename": "report.pdf" }));
        assert_eq!(body["filename"], "report.pdf");
        assert_eq!(body["indexed_at"], "2025-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_index_outcome() {
        assert_eq!(index_outcome(&json!({ "result": "created" })), "created");
        assert_eq!(index_outcome(&json!({ "result": "updated" })), "updated");
        assert_eq!(index_outcome(&json!({ "_id": "doc-1" })), "unknown");
        assert_eq!(index_outcome(&json!({ "result": 3 })), "unknown");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected_before_any_request() {
        let index = ElasticsearchIndex::new(&config(3)).unwrap();

        let result = index
            .index_document("doc-1", "text", &[1.0, 2.0], &Map::new())
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::Index(IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_connection_error() {
        let index = ElasticsearchIndex::new(&config(2)).unwrap();
        assert_eq!(index.index_name(), "documents");

        let result = index
            .index_document("doc-1", "text", &[1.0, 2.0], &Map::new())
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Index(IndexError::Connection { .. }))
        ));

        assert!(index.ensure_index().await.is_err());
    }
}
