use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Embedding generation failed")]
    Embedding(#[from] EmbeddingError),

    #[error("Search indexing failed")]
    Index(#[from] IndexError),

    #[error("Status cache error")]
    Cache(#[from] CacheError),

    #[error("Task queue error")]
    Queue(#[from] QueueError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] sqlx::Error),

    #[error("Query failed")]
    Query(#[source] sqlx::Error),

    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("Schema creation failed: {message}")]
    Migration {
        message: String,
        #[source]
        source: sqlx::Error,
    },
}

impl DatabaseError {
    /// Classify a failed statement, surfacing unique violations separately.
    pub(crate) fn from_query(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error
            && db_error.is_unique_violation()
        {
            return DatabaseError::UniqueViolation {
                constraint: db_error.constraint().unwrap_or("unknown").to_string(),
            };
        }
        DatabaseError::Query(error)
    }
}

/// Embedding service errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Connection failed to embedding service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Embedding model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Embedding request failed (status {status}): {message}")]
    Request { status: u16, message: String },

    #[error("Invalid response from embedding service")]
    InvalidResponse(#[source] reqwest::Error),

    #[error("Embedding service returned an empty vector")]
    EmptyEmbedding,
}

/// Search index errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Connection failed to search index at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Index request failed (status {status}): {message}")]
    Request { status: u16, message: String },

    #[error("Embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid response from search index")]
    InvalidResponse(#[source] reqwest::Error),
}

/// Status cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache connection failed")]
    Connection(#[source] redis::RedisError),

    #[error("Cache command failed")]
    Command(#[source] redis::RedisError),

    #[error("Cache unavailable: {message}")]
    Unavailable { message: String },
}

/// Task queue transport errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker connection failed")]
    Connection(#[source] redis::RedisError),

    #[error("Broker command failed")]
    Command(#[source] redis::RedisError),

    #[error("Task payload could not be encoded or decoded")]
    Serialization(#[source] serde_json::Error),

    #[error("Unexpected broker response: {message}")]
    UnexpectedResponse { message: String },
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and all of its sources as a single line.
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_chain_includes_sources() {
        let error = ServiceError::from(EmbeddingError::Request {
            status: 503,
            message: "model loading".to_string(),
        });

        assert_eq!(
            format_error_chain(&error),
            "Embedding generation failed: Embedding request failed (status 503): model loading"
        );
    }

    #[test]
    fn test_format_error_chain_without_source() {
        let error = ServiceError::InvalidRequest {
            message: "missing filename".to_string(),
        };

        assert_eq!(format_error_chain(&error), "Invalid request: missing filename");
    }

    #[test]
    fn test_non_database_errors_are_plain_query_failures() {
        let error = DatabaseError::from_query(sqlx::Error::RowNotFound);
        assert!(matches!(error, DatabaseError::Query(sqlx::Error::RowNotFound)));
    }
}
