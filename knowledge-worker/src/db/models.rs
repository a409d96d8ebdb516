//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Sender label for messages typed by the user
pub const SENDER_USER: &str = "user";

/// Sender label for generated replies
pub const SENDER_AI: &str = "ai";

/// Maximum number of characters kept in a document preview
const PREVIEW_CHARS: usize = 200;

/// Account holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub hashed_password: String,
}

/// Conversation thread owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Chat {
    pub id: i32,
    pub user_id: i32,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Metadata of an uploaded file. The content itself lives in the search index
/// under `es_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: i32,
    pub es_id: String,
    pub filename: String,
    /// Cleared when the uploader is deleted
    pub uploaded_by: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub preview: Option<String>,
}

/// Fields supplied when an upload is accepted
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub es_id: String,
    pub filename: String,
    pub uploaded_by: Option<i32>,
    pub preview: Option<String>,
}

/// Link between a chat and a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChatDocument {
    pub id: i32,
    pub chat_id: i32,
    pub document_id: i32,
    pub added_at: DateTime<Utc>,
}

/// One turn in a chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i32,
    pub chat_id: i32,
    /// `user`, `ai`, or a username
    pub sender: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Short preview of document text: the first characters, whitespace collapsed.
pub fn preview_from_content(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => collapsed[..end].to_string(),
        None => collapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_collapses_whitespace() {
        assert_eq!(
            preview_from_content("  Quarterly\n\nplanning\tnotes  "),
            "Quarterly planning notes"
        );
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let content = "é".repeat(PREVIEW_CHARS + 10);
        let preview = preview_from_content(&content);

        assert_eq!(preview.chars().count(), PREVIEW_CHARS);
        assert!(content.starts_with(&preview));
    }

    #[test]
    fn test_user_serialization_omits_password_hash() {
        let user = User {
            id: 1,
            username: "ada".to_string(),
            email: "ada@example.com".to_string(),
            full_name: None,
            hashed_password: "$argon2id$secret".to_string(),
            disabled: false,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("hashed_password").is_none());
        assert_eq!(json["username"], "ada");
    }
}
