//! Chat CRUD operations.

use super::Database;
use super::models::Chat;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Create a chat owned by `user_id`
    pub async fn create_chat(&self, user_id: i32, title: &str) -> ServiceResult<Chat> {
        let chat = sqlx::query_as::<_, Chat>(
            "INSERT INTO chats (user_id, title) VALUES ($1, $2)
             RETURNING id, user_id, title, created_at",
        )
        .bind(user_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(chat)
    }

    /// Get a chat by ID
    pub async fn get_chat(&self, id: i32) -> ServiceResult<Option<Chat>> {
        let chat = sqlx::query_as::<_, Chat>(
            "SELECT id, user_id, title, created_at FROM chats WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(chat)
    }

    /// List a user's chats, most recent first
    pub async fn list_chats_for_user(&self, user_id: i32) -> ServiceResult<Vec<Chat>> {
        let chats = sqlx::query_as::<_, Chat>(
            "SELECT id, user_id, title, created_at FROM chats
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(chats)
    }

    /// Rename a chat. Returns the updated chat, or `None` if it does not exist.
    pub async fn rename_chat(&self, id: i32, title: &str) -> ServiceResult<Option<Chat>> {
        let chat = sqlx::query_as::<_, Chat>(
            "UPDATE chats SET title = $2 WHERE id = $1
             RETURNING id, user_id, title, created_at",
        )
        .bind(id)
        .bind(title)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(chat)
    }

    /// Delete a chat together with its messages and document links.
    /// The linked documents themselves are kept.
    pub async fn delete_chat(&self, id: i32) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::tests::{create_test_document, create_test_user, test_db};
    use crate::db::{SENDER_AI, SENDER_USER};
    use crate::error::{DatabaseError, ServiceError};

    #[tokio::test]
    async fn test_list_chats_for_user_newest_first() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let first = db.create_chat(user.id, "First").await.unwrap();
        let second = db.create_chat(user.id, "Second").await.unwrap();

        let chats = db.list_chats_for_user(user.id).await.unwrap();
        let ids: Vec<i32> = chats.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_rename_chat() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let chat = db.create_chat(user.id, "Untitled").await.unwrap();

        let renamed = db.rename_chat(chat.id, "Budget review").await.unwrap().unwrap();
        assert_eq!(renamed.title, "Budget review");
        assert!(db.rename_chat(i32::MAX, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chat_requires_existing_user() {
        let Some(db) = test_db().await else { return };

        let result = db.create_chat(i32::MAX, "Orphan").await;
        assert!(matches!(
            result,
            Err(ServiceError::Database(DatabaseError::Query(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_chat_removes_messages_and_links_but_not_documents() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let chat = db.create_chat(user.id, "Research").await.unwrap();
        db.add_message(chat.id, Some(SENDER_USER), "What changed?").await.unwrap();
        db.add_message(chat.id, Some(SENDER_AI), "Two things.").await.unwrap();
        let document = create_test_document(&db, Some(user.id)).await;
        db.attach_document(chat.id, document.id).await.unwrap();

        assert!(db.delete_chat(chat.id).await.unwrap());
        assert!(!db.delete_chat(chat.id).await.unwrap());

        assert!(db.list_messages(chat.id).await.unwrap().is_empty());
        assert!(db.list_chat_documents(chat.id).await.unwrap().is_empty());
        assert!(db.get_document(document.id).await.unwrap().is_some());
        assert!(db.get_user(user.id).await.unwrap().is_some());
    }
}
