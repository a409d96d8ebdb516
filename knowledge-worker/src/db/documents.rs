//! Document metadata and chat/document link operations.

use super::Database;
use super::models::{ChatDocument, Document, NewDocument};
use crate::error::{DatabaseError, ServiceResult};

const DOCUMENT_COLUMNS: &str = "id, es_id, filename, uploaded_by, created_at, preview";

impl Database {
    /// Record an uploaded document. A second record for the same `es_id`
    /// fails with a unique violation.
    pub async fn create_document(&self, document: &NewDocument) -> ServiceResult<Document> {
        let created = sqlx::query_as::<_, Document>(&format!(
            "INSERT INTO documents (es_id, filename, uploaded_by, preview)
             VALUES ($1, $2, $3, $4)
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(&document.es_id)
        .bind(&document.filename)
        .bind(document.uploaded_by)
        .bind(&document.preview)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(created)
    }

    /// Get a document by ID
    pub async fn get_document(&self, id: i32) -> ServiceResult<Option<Document>> {
        let document = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(document)
    }

    /// Get a document by its search index identifier
    pub async fn get_document_by_es_id(&self, es_id: &str) -> ServiceResult<Option<Document>> {
        let document = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE es_id = $1"
        ))
        .bind(es_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(document)
    }

    /// List documents uploaded by a user, newest first
    pub async fn list_documents_for_user(&self, user_id: i32) -> ServiceResult<Vec<Document>> {
        let documents = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE uploaded_by = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(documents)
    }

    /// Delete a document and every chat link to it
    pub async fn delete_document(&self, id: i32) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    /// Link a document to a chat
    pub async fn attach_document(
        &self,
        chat_id: i32,
        document_id: i32,
    ) -> ServiceResult<ChatDocument> {
        let link = sqlx::query_as::<_, ChatDocument>(
            "INSERT INTO chat_documents (chat_id, document_id) VALUES ($1, $2)
             RETURNING id, chat_id, document_id, added_at",
        )
        .bind(chat_id)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(link)
    }

    /// Remove every link between a chat and a document
    pub async fn detach_document(&self, chat_id: i32, document_id: i32) -> ServiceResult<bool> {
        let result =
            sqlx::query("DELETE FROM chat_documents WHERE chat_id = $1 AND document_id = $2")
                .bind(chat_id)
                .bind(document_id)
                .execute(&self.pool)
                .await
                .map_err(DatabaseError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    /// Documents attached to a chat, most recently attached first
    pub async fn list_chat_documents(&self, chat_id: i32) -> ServiceResult<Vec<Document>> {
        let documents = sqlx::query_as::<_, Document>(
            "SELECT d.id, d.es_id, d.filename, d.uploaded_by, d.created_at, d.preview
             FROM chat_documents cd
             JOIN documents d ON d.id = cd.document_id
             WHERE cd.chat_id = $1
             ORDER BY cd.added_at DESC, cd.id DESC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(documents)
    }

    /// Links pointing at a document
    pub async fn list_document_chats(&self, document_id: i32) -> ServiceResult<Vec<ChatDocument>> {
        let links = sqlx::query_as::<_, ChatDocument>(
            "SELECT id, chat_id, document_id, added_at FROM chat_documents
             WHERE document_id = $1
             ORDER BY added_at DESC, id DESC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::NewDocument;
    use crate::db::tests::{create_test_document, create_test_user, test_db};
    use crate::error::{DatabaseError, ServiceError};

    #[tokio::test]
    async fn test_duplicate_es_id_is_rejected() {
        let Some(db) = test_db().await else { return };

        let document = create_test_document(&db, None).await;
        let result = db
            .create_document(&NewDocument {
                es_id: document.es_id.clone(),
                filename: "copy.txt".to_string(),
                uploaded_by: None,
                preview: None,
            })
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::Database(DatabaseError::UniqueViolation { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lookup_by_es_id() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let document = create_test_document(&db, Some(user.id)).await;

        let found = db.get_document_by_es_id(&document.es_id).await.unwrap();
        assert_eq!(found, Some(document.clone()));

        let uploaded = db.list_documents_for_user(user.id).await.unwrap();
        assert_eq!(uploaded, vec![document]);
    }

    #[tokio::test]
    async fn test_chat_documents_newest_link_first() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let chat = db.create_chat(user.id, "Sources").await.unwrap();
        let older = create_test_document(&db, Some(user.id)).await;
        let newer = create_test_document(&db, Some(user.id)).await;
        db.attach_document(chat.id, older.id).await.unwrap();
        db.attach_document(chat.id, newer.id).await.unwrap();

        let attached = db.list_chat_documents(chat.id).await.unwrap();
        let ids: Vec<i32> = attached.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        assert!(db.detach_document(chat.id, older.id).await.unwrap());
        assert!(!db.detach_document(chat.id, older.id).await.unwrap());
        assert_eq!(db.list_chat_documents(chat.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document_removes_links_but_keeps_chat() {
        let Some(db) = test_db().await else { return };

        let user = create_test_user(&db).await;
        let chat = db.create_chat(user.id, "Sources").await.unwrap();
        let document = create_test_document(&db, Some(user.id)).await;
        db.attach_document(chat.id, document.id).await.unwrap();

        assert!(db.delete_document(document.id).await.unwrap());

        assert!(db.list_chat_documents(chat.id).await.unwrap().is_empty());
        assert!(db.get_chat(chat.id).await.unwrap().is_some());
    }
}
