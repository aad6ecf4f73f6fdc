use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::Executor;

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("User with this email already exists")]
    EmailTaken,

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl Error {
    fn from_write(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(e) if e.is_unique_violation() => {
                Self::EmailTaken
            }
            _ => Self::Db(error),
        }
    }
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub is_admin: bool,
    pub api_calls_used: i64,
    pub created_at: DateTime<Utc>,
}

/// A user row along with its password hash. Never leaves the server.
#[derive(sqlx::FromRow, Debug)]
pub struct UserWithHash {
    #[sqlx(flatten)]
    pub user: User,
    pub password_hash: String,
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: i64,
    pub user_message: String,
    pub bot_response: String,
    pub created_at: DateTime<Utc>,
}

/// Request count for a (method, endpoint) pair, either global or
/// scoped to a single user.
#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone, PartialEq)]
pub struct EndpointStat {
    pub method: String,
    pub endpoint: String,
    pub request_count: i64,
}

#[derive(Clone)]
pub struct Storage {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    pub async fn connect(
        file_path: &Path,
        busy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(file_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let pool = sqlx::SqlitePool::connect_with(options)
            .await
            .context(format!("Failed to open database: {file_path:?}"))?;
        let selph = Self { pool };
        for migration in MIGRATIONS {
            selph.pool.execute(migration).await?;
        }
        Ok(selph)
    }

    pub async fn user_create(
        &self,
        email: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<User, Error> {
        sqlx::query_as(
            "INSERT INTO users (email, password_hash, is_admin, created_at)
                VALUES (?, ?, ?, ?)
                RETURNING id, email, is_admin, api_calls_used, created_at",
        )
        .bind(email)
        .bind(password_hash)
        .bind(is_admin)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from_write)
    }

    pub async fn user_by_email(
        &self,
        email: &str,
    ) -> anyhow::Result<Option<UserWithHash>> {
        let found = sqlx::query_as(
            "SELECT id, email, is_admin, api_calls_used, created_at,
                password_hash
                FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found)
    }

    pub async fn user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        let found = sqlx::query_as(
            "SELECT id, email, is_admin, api_calls_used, created_at
                FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found)
    }

    /// Newest accounts first.
    pub async fn users_all(&self) -> anyhow::Result<Vec<User>> {
        let users = sqlx::query_as(
            "SELECT id, email, is_admin, api_calls_used, created_at
                FROM users ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Returns the updated user, or `None` if no such user.
    pub async fn user_update_email(
        &self,
        id: i64,
        email: &str,
    ) -> Result<Option<User>, Error> {
        sqlx::query_as(
            "UPDATE users SET email = ? WHERE id = ?
                RETURNING id, email, is_admin, api_calls_used, created_at",
        )
        .bind(email)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from_write)
    }

    /// Chat history and usage rows go with the user (FK cascade).
    /// Returns whether the user existed.
    pub async fn user_delete(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn history_append(
        &self,
        user_id: i64,
        user_message: &str,
        bot_response: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO chat_history
                (user_id, user_message, bot_response, created_at)
                VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(user_message)
        .bind(bot_response)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The most recent `limit` exchanges, oldest first.
    pub async fn history(
        &self,
        user_id: i64,
        limit: u32,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let messages = sqlx::query_as(
            "SELECT * FROM (
                SELECT id, user_message, bot_response, created_at
                FROM chat_history
                WHERE user_id = ?
                ORDER BY id DESC
                LIMIT ?
            ) ORDER BY id ASC",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Count one call by `user_id` to `method endpoint`: the global
    /// endpoint counter, the user's running total and the user's
    /// per-endpoint counter all move together.
    pub async fn record_usage(
        &self,
        user_id: i64,
        method: &str,
        endpoint: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let tx = self.pool.begin().await?;
        let tx = usage_increment(tx, user_id, method, endpoint, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fire-and-forget [`Storage::record_usage`]. Failures are logged and
    /// otherwise dropped.
    pub fn spawn_record_usage(
        &self,
        user_id: i64,
        method: String,
        endpoint: String,
    ) {
        let selph = self.clone();
        tokio::spawn(async move {
            if let Err(error) =
                selph.record_usage(user_id, &method, &endpoint).await
            {
                tracing::warn!(
                    user_id,
                    %method,
                    %endpoint,
                    ?error,
                    "Failed to record endpoint usage."
                );
            }
        });
    }

    /// Most requested first.
    pub async fn endpoint_stats(&self) -> anyhow::Result<Vec<EndpointStat>> {
        let stats = sqlx::query_as(
            "SELECT method, endpoint, request_count
                FROM endpoint_stats
                ORDER BY request_count DESC, method, endpoint",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Most requested first.
    pub async fn user_endpoint_usage(
        &self,
        user_id: i64,
    ) -> anyhow::Result<Vec<EndpointStat>> {
        let stats = sqlx::query_as(
            "SELECT method, endpoint, request_count
                FROM user_endpoint_usage
                WHERE user_id = ?
                ORDER BY request_count DESC, method, endpoint",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }
}

async fn usage_increment<'a>(
    mut tx: Tx<'a>,
    user_id: i64,
    method: &str,
    endpoint: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Tx<'a>> {
    sqlx::query(
        "INSERT INTO endpoint_stats
            (method, endpoint, request_count, last_updated)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(method, endpoint) DO UPDATE SET
            request_count = request_count + 1,
            last_updated = excluded.last_updated",
    )
    .bind(method)
    .bind(endpoint)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE users SET api_calls_used = api_calls_used + 1 WHERE id = ?",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO user_endpoint_usage
            (user_id, method, endpoint, request_count, last_used)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(user_id, method, endpoint) DO UPDATE SET
            request_count = request_count + 1,
            last_used = excluded.last_used",
    )
    .bind(user_id)
    .bind(method)
    .bind(endpoint)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    Ok(tx)
}
