//! Database schema setup.
//!
//! Tables are created with `IF NOT EXISTS`, so running this on every startup is
//! safe. Cascade rules live in the foreign keys:
//! - deleting a user deletes their chats (and, through them, messages and
//!   chat/document links) but only clears `documents.uploaded_by`
//! - deleting a chat deletes its messages and links, never the documents
//! - deleting a document deletes its links

use sqlx::postgres::PgPool;

use crate::error::{DatabaseError, ServiceResult};

/// Schema statements in dependency order
const SCHEMA: &[(&str, &str)] = &[
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id SERIAL PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            full_name TEXT,
            hashed_password TEXT NOT NULL,
            disabled BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "chats",
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            id SERIAL PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "documents",
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id SERIAL PRIMARY KEY,
            es_id TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            uploaded_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            preview TEXT
        )
        "#,
    ),
    (
        "chat_documents",
        r#"
        CREATE TABLE IF NOT EXISTS chat_documents (
            id SERIAL PRIMARY KEY,
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            added_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "messages",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id SERIAL PRIMARY KEY,
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender TEXT,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "indexes",
        r#"
        CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id);
        CREATE INDEX IF NOT EXISTS idx_documents_uploaded_by ON documents(uploaded_by);
        CREATE INDEX IF NOT EXISTS idx_chat_documents_chat ON chat_documents(chat_id);
        CREATE INDEX IF NOT EXISTS idx_chat_documents_document ON chat_documents(document_id);
        CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
        "#,
    ),
];

/// Create every table and index inside a single transaction.
pub(super) async fn create_tables(pool: &PgPool) -> ServiceResult<()> {
    let mut tx = pool.begin().await.map_err(DatabaseError::Connection)?;

    for (name, statement) in SCHEMA {
        // Unprepared execution allows the multi-statement index batch
        sqlx::raw_sql(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::Migration {
                message: format!("Failed to create {}", name),
                source: e,
            })?;
    }

    tx.commit().await.map_err(|e| DatabaseError::Migration {
        message: "Failed to commit schema".to_string(),
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn referenced_tables(statement: &str) -> Vec<&str> {
        statement
            .split("REFERENCES ")
            .skip(1)
            .filter_map(|rest| rest.split('(').next())
            .collect()
    }

    #[test]
    fn test_tables_are_created_after_their_references() {
        let mut created: Vec<&str> = Vec::new();

        for (name, statement) in SCHEMA {
            for table in referenced_tables(statement) {
                assert!(
                    created.contains(&table),
                    "{} references {} before it is created",
                    name,
                    table
                );
            }
            created.push(*name);
        }
    }

    #[test]
    fn test_cascade_rules() {
        let statement = |table: &str| {
            SCHEMA
                .iter()
                .find(|(name, _)| *name == table)
                .map(|(_, sql)| *sql)
                .unwrap()
        };

        assert!(statement("chats").contains("REFERENCES users(id) ON DELETE CASCADE"));
        assert!(statement("documents").contains("REFERENCES users(id) ON DELETE SET NULL"));
        assert!(statement("chat_documents").contains("REFERENCES chats(id) ON DELETE CASCADE"));
        assert!(
            statement("chat_documents").contains("REFERENCES documents(id) ON DELETE CASCADE")
        );
        assert!(statement("messages").contains("REFERENCES chats(id) ON DELETE CASCADE"));
    }

    #[test]
    fn test_every_statement_is_idempotent() {
        for (name, statement) in SCHEMA {
            for line in statement.lines().map(str::trim).filter(|l| l.starts_with("CREATE")) {
                assert!(line.contains("IF NOT EXISTS"), "{}: {}", name, line);
            }
        }
    }
}
