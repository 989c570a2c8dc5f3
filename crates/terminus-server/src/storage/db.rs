//! SQLite repository (embedded, no external dependencies)
//!
//! Holds the Session and CodeFile rows and implements the core's storage
//! ports. Migrations run inline at startup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::Arc;
use terminus_core::store::{FileStore, SessionStore};
use terminus_types::{CodeFile, Session};

pub struct Database {
    pool: Arc<SqlitePool>,
}

impl Database {
    pub async fn new(database_path: &str) -> Result<Self> {
        tracing::info!("Opening SQLite database at: {}", database_path);

        if let Some(parent) = std::path::Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        Self::connect(options, 5).await
    }

    /// Unit-test database. A single connection, because every pooled
    /// connection to `:memory:` would otherwise get its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                last_accessed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS code_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                file_type TEXT NOT NULL DEFAULT 'text',
                size_bytes INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(session_id, path)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_code_files_session
            ON code_files (session_id)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Session operations (the REST surface on top of the core ports)

    pub async fn create_session(
        &self,
        user_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Session> {
        let row: SessionRow = sqlx::query_as(
            r#"
            INSERT INTO sessions (user_id, name, description)
            VALUES (?1, ?2, ?3)
            RETURNING id, user_id, name, description, is_active,
                      created_at, updated_at, last_accessed_at
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(description)
        .fetch_one(&*self.pool)
        .await?;

        Ok(row.into())
    }

    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, description, is_active,
                   created_at, updated_at, last_accessed_at
            FROM sessions WHERE user_id = ?1
            ORDER BY last_accessed_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    pub async fn fetch_session(&self, id: i64) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, description, is_active,
                   created_at, updated_at, last_accessed_at
            FROM sessions WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    /// Delete a session row; CodeFiles cascade.
    pub async fn delete_session(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM code_files WHERE session_id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn get_session(&self, id: i64) -> terminus_core::Result<Option<Session>> {
        self.fetch_session(id)
            .await
            .map_err(|e| terminus_core::Error::Store(e.to_string()))
    }

    async fn touch_session(&self, id: i64) -> terminus_core::Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET last_accessed_at = datetime('now')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| terminus_core::Error::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl FileStore for Database {
    async fn list_files(&self, session_id: i64) -> terminus_core::Result<Vec<CodeFile>> {
        let rows: Vec<CodeFileRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, path, name, content, file_type,
                   size_bytes, created_at, updated_at
            FROM code_files WHERE session_id = ?1
            ORDER BY path
            "#,
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| terminus_core::Error::Store(e.to_string()))?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn get_file(
        &self,
        session_id: i64,
        path: &str,
    ) -> terminus_core::Result<Option<CodeFile>> {
        let row: Option<CodeFileRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, path, name, content, file_type,
                   size_bytes, created_at, updated_at
            FROM code_files WHERE session_id = ?1 AND path = ?2
            ORDER BY updated_at DESC LIMIT 1
            "#,
        )
        .bind(session_id)
        .bind(path)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| terminus_core::Error::Store(e.to_string()))?;

        Ok(row.map(|r| r.into()))
    }

    async fn upsert_file(
        &self,
        session_id: i64,
        path: &str,
        content: &str,
    ) -> terminus_core::Result<CodeFile> {
        let (name, file_type) = CodeFile::name_and_type(path);
        let row: CodeFileRow = sqlx::query_as(
            r#"
            INSERT INTO code_files (session_id, path, name, content, file_type, size_bytes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id, path) DO UPDATE SET
                content = excluded.content,
                file_type = excluded.file_type,
                size_bytes = excluded.size_bytes,
                updated_at = datetime('now')
            RETURNING id, session_id, path, name, content, file_type,
                      size_bytes, created_at, updated_at
            "#,
        )
        .bind(session_id)
        .bind(path)
        .bind(&name)
        .bind(content)
        .bind(&file_type)
        .bind(content.len() as i64)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| terminus_core::Error::Store(e.to_string()))?;

        Ok(row.into())
    }

    async fn delete_file(&self, session_id: i64, path: &str) -> terminus_core::Result<()> {
        sqlx::query("DELETE FROM code_files WHERE session_id = ?1 AND path = ?2")
            .bind(session_id)
            .bind(path)
            .execute(&*self.pool)
            .await
            .map_err(|e| terminus_core::Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete_session_files(&self, session_id: i64) -> terminus_core::Result<()> {
        sqlx::query("DELETE FROM code_files WHERE session_id = ?1")
            .bind(session_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| terminus_core::Error::Store(e.to_string()))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    user_id: i64,
    name: String,
    description: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(r: SessionRow) -> Self {
        Session {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            description: r.description,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
            last_accessed_at: r.last_accessed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CodeFileRow {
    id: i64,
    session_id: i64,
    path: String,
    name: String,
    content: String,
    file_type: String,
    size_bytes: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CodeFileRow> for CodeFile {
    fn from(r: CodeFileRow) -> Self {
        CodeFile {
            id: r.id,
            session_id: r.session_id,
            path: r.path,
            name: r.name,
            content: r.content,
            file_type: r.file_type,
            size_bytes: r.size_bytes,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}
