//! Background worker for the AI knowledge assistant.
//!
//! Uploaded documents arrive as `process_document` tasks on a Redis stream.
//! Each task embeds the document text, stores it in Elasticsearch, and flags it
//! as ready in the status cache. The relational schema shared with the API
//! layer (users, chats, documents, links, messages) lives in [`db`].

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod queue;
pub mod search;
pub mod task;
