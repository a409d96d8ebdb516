//! Chat message operations.

use super::Database;
use super::models::Message;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Append a message to a chat
    pub async fn add_message(
        &self,
        chat_id: i32,
        sender: Option<&str>,
        content: &str,
    ) -> ServiceResult<Message> {
        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (chat_id, sender, content) VALUES ($1, $2, $3)
             RETURNING id, chat_id, sender, content, created_at",
        )
        .bind(chat_id)
        .bind(sender)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(message)
    }

    /// List a chat's messages in conversation order
    pub async fn list_messages(&self, chat_id: i32) -> ServiceResult<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, chat_id, sender, content, created_at FROM messages
             WHERE chat_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::tests::{create_test_user, test_db};
    use crate::db::{SENDER_AI, SENDER_USER};

    #[tokio::test]
    async fn test_messages_are_listed_oldest_first() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let chat = db.create_chat(user.id, "Support").await.unwrap();
        db.add_message(chat.id, Some(SENDER_USER), "Is the report ready?").await.unwrap();
        db.add_message(chat.id, Some(SENDER_AI), "Yes, it was indexed.").await.unwrap();
        db.add_message(chat.id, None, "system note").await.unwrap();

        let messages = db.list_messages(chat.id).await.unwrap();
        let senders: Vec<Option<&str>> = messages.iter().map(|m| m.sender.as_deref()).collect();
        assert_eq!(senders, vec![Some(SENDER_USER), Some(SENDER_AI), None]);
        assert_eq!(messages[0].content, "Is the report ready?");
    }
}
