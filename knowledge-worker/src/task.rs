//! Document processing task.
//!
//! Embeds an uploaded document, stores it in the search index, then flags it as
//! ready in the status cache. Embedding and indexing failures fail the task; the
//! cache update is best effort.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{self, StatusCache};
use crate::embedding::Embedder;
use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::search::SearchIndex;

/// Registered name of the document processing task
pub const PROCESS_DOCUMENT: &str = "process_document";

/// Parameter names in positional order
const PARAMS: [&str; 5] = ["es_doc_id", "content", "filename", "uploaded_by", "chat_id"];
const REQUIRED_PARAMS: usize = 3;

/// Arguments of a `process_document` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDocument {
    pub es_doc_id: String,
    pub content: String,
    pub filename: String,
    /// Recorded by the API layer; unused here
    #[serde(default)]
    pub uploaded_by: Option<i32>,
    /// Recorded by the API layer; unused here
    #[serde(default)]
    pub chat_id: Option<i32>,
}

impl ProcessDocument {
    /// Bind a call made with positional and keyword arguments.
    ///
    /// Follows the usual calling rules: positional arguments fill parameters in
    /// order, keywords fill the rest, and a parameter given both ways is an error.
    pub fn from_call(args: Vec<Value>, kwargs: Map<String, Value>) -> ServiceResult<Self> {
        if args.len() > PARAMS.len() {
            return Err(invalid(format!(
                "{} takes at most {} arguments ({} given)",
                PROCESS_DOCUMENT,
                PARAMS.len(),
                args.len()
            )));
        }

        let mut bound = Map::new();
        for (name, value) in PARAMS.iter().zip(args) {
            bound.insert((*name).to_string(), value);
        }

        for (name, value) in kwargs {
            if !PARAMS.contains(&name.as_str()) {
                return Err(invalid(format!(
                    "{} got an unexpected keyword argument '{}'",
                    PROCESS_DOCUMENT, name
                )));
            }
            if bound.contains_key(&name) {
                return Err(invalid(format!(
                    "{} got multiple values for argument '{}'",
                    PROCESS_DOCUMENT, name
                )));
            }
            bound.insert(name, value);
        }

        let missing: Vec<&str> = PARAMS[..REQUIRED_PARAMS]
            .iter()
            .copied()
            .filter(|name| !bound.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(invalid(format!(
                "{} missing required arguments: {}",
                PROCESS_DOCUMENT,
                missing.join(", ")
            )));
        }

        serde_json::from_value(Value::Object(bound))
            .map_err(|e| invalid(format!("Invalid {} arguments: {}", PROCESS_DOCUMENT, e)))
    }

    /// Metadata stored alongside the document in the search index
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("filename".to_string(), Value::String(self.filename.clone()));
        metadata
    }
}

fn invalid(message: String) -> ServiceError {
    ServiceError::InvalidRequest { message }
}

/// Runs document processing against the configured collaborators
#[derive(Clone)]
pub struct DocumentProcessor {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn SearchIndex>,
    cache: Option<Arc<dyn StatusCache>>,
}

impl DocumentProcessor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn SearchIndex>,
        cache: Option<Arc<dyn StatusCache>>,
    ) -> Self {
        Self {
            embedder,
            index,
            cache,
        }
    }

    /// Embed and index a document, then mark it ready.
    ///
    /// Safe to re-run: the index entry is overwritten and the status key is set
    /// again with a fresh expiry.
    pub async fn process_document(&self, task: &ProcessDocument) -> ServiceResult<String> {
        info!(
            es_doc_id = %task.es_doc_id,
            filename = %task.filename,
            "Processing document"
        );
        debug!(
            uploaded_by = ?task.uploaded_by,
            chat_id = ?task.chat_id,
            "Ignoring ownership arguments"
        );

        let embedding = self.embedder.embed(&task.content).await?;

        self.index
            .index_document(&task.es_doc_id, &task.content, &embedding, &task.metadata())
            .await?;

        self.update_status(&task.es_doc_id).await;

        Ok(format!("Document {} processed and indexed.", task.filename))
    }

    async fn update_status(&self, es_doc_id: &str) {
        let Some(cache) = &self.cache else {
            warn!(
                es_doc_id = %es_doc_id,
                "Status cache not available, could not update status"
            );
            return;
        };

        match cache::mark_ready(cache.as_ref(), es_doc_id).await {
            Ok(()) => info!(
                es_doc_id = %es_doc_id,
                status = cache::READY_STATUS,
                "Updated document status"
            ),
            Err(e) => error!(
                es_doc_id = %es_doc_id,
                error = %format_error_chain(&e),
                "Error updating document status"
            ),
        }
    }
}
