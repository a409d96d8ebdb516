//! User CRUD operations.

use super::Database;
use super::models::{NewUser, User};
use crate::error::{DatabaseError, ServiceResult};

const USER_COLUMNS: &str =
    "id, username, email, full_name, hashed_password, disabled, created_at";

impl Database {
    /// Insert a user. Duplicate usernames or emails fail with a unique violation.
    pub async fn create_user(&self, user: &NewUser) -> ServiceResult<User> {
        let created = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, email, full_name, hashed_password)
             VALUES ($1, $2, $3, $4)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(created)
    }

    /// Get a user by ID
    pub async fn get_user(&self, id: i32) -> ServiceResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(user)
    }

    /// Get a user by username
    pub async fn get_user_by_username(&self, username: &str) -> ServiceResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(user)
    }

    /// Delete a user.
    ///
    /// Their chats go with them (messages and chat links included). Documents
    /// they uploaded stay, with `uploaded_by` cleared.
    pub async fn delete_user(&self, id: i32) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        Ok(result.rows_affected() > 0)
    }
}
