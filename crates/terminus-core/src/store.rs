//! Storage ports for the external persistence layer
//!
//! The relational store is an external collaborator; these traits are the
//! seam the workspace manager and the broker talk through. The server crate
//! provides the SQLite implementation; `MemoryStore` backs unit tests.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use terminus_types::{CodeFile, Session};

/// Session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, id: i64) -> Result<Option<Session>>;
    async fn touch_session(&self, id: i64) -> Result<()>;
}

/// CodeFile rows. `(session_id, path)` is unique.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list_files(&self, session_id: i64) -> Result<Vec<CodeFile>>;
    async fn get_file(&self, session_id: i64, path: &str) -> Result<Option<CodeFile>>;
    async fn upsert_file(&self, session_id: i64, path: &str, content: &str) -> Result<CodeFile>;
    async fn delete_file(&self, session_id: i64, path: &str) -> Result<()>;
    async fn delete_session_files(&self, session_id: i64) -> Result<()>;
}

/// In-memory store used by unit tests.
///
/// Duplicate paths can be injected deliberately to exercise the
/// legacy-data de-duplication rule in the workspace manager.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<i64, Session>,
    files: DashMap<i64, Vec<CodeFile>>,
    next_file_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            files: DashMap::new(),
            next_file_id: AtomicI64::new(1),
        }
    }

    pub fn insert_session(&self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Insert a file row directly, bypassing the unique-path upsert.
    pub fn insert_file_row(&self, file: CodeFile) {
        self.files.entry(file.session_id).or_default().push(file);
    }

    pub fn make_file(&self, session_id: i64, path: &str, content: &str) -> CodeFile {
        let (name, file_type) = CodeFile::name_and_type(path);
        let now = Utc::now();
        CodeFile {
            id: self.next_file_id.fetch_add(1, Ordering::SeqCst),
            session_id,
            path: path.to_string(),
            name,
            content: content.to_string(),
            file_type,
            size_bytes: content.len() as i64,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, id: i64) -> Result<Option<Session>> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn touch_session(&self, id: i64) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(Error::SessionNotFound(id))?;
        session.last_accessed_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn list_files(&self, session_id: i64) -> Result<Vec<CodeFile>> {
        Ok(self
            .files
            .get(&session_id)
            .map(|f| f.clone())
            .unwrap_or_default())
    }

    async fn get_file(&self, session_id: i64, path: &str) -> Result<Option<CodeFile>> {
        Ok(self.files.get(&session_id).and_then(|files| {
            files
                .iter()
                .filter(|f| f.path == path)
                .max_by_key(|f| f.updated_at)
                .cloned()
        }))
    }

    async fn upsert_file(&self, session_id: i64, path: &str, content: &str) -> Result<CodeFile> {
        let mut files = self.files.entry(session_id).or_default();
        if let Some(existing) = files.iter_mut().find(|f| f.path == path) {
            existing.content = content.to_string();
            existing.size_bytes = content.len() as i64;
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        let file = self.make_file(session_id, path, content);
        files.push(file.clone());
        Ok(file)
    }

    async fn delete_file(&self, session_id: i64, path: &str) -> Result<()> {
        if let Some(mut files) = self.files.get_mut(&session_id) {
            files.retain(|f| f.path != path);
        }
        Ok(())
    }

    async fn delete_session_files(&self, session_id: i64) -> Result<()> {
        self.files.remove(&session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: i64) -> Session {
        let now = Utc::now();
        Session {
            id,
            user_id: 1,
            name: format!("session-{}", id),
            description: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_is_unique_per_path() {
        let store = MemoryStore::new();
        store.insert_session(session(1));

        store.upsert_file(1, "/a.py", "x = 1").await.unwrap();
        store.upsert_file(1, "/a.py", "x = 2").await.unwrap();

        let files = store.list_files(1).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "x = 2");
    }

    #[tokio::test]
    async fn get_file_prefers_latest_duplicate() {
        let store = MemoryStore::new();
        store.insert_session(session(1));

        let mut old = store.make_file(1, "/dup.py", "old");
        old.updated_at = Utc::now() - chrono::Duration::hours(1);
        store.insert_file_row(old);
        store.insert_file_row(store.make_file(1, "/dup.py", "new"));

        let file = store.get_file(1, "/dup.py").await.unwrap().unwrap();
        assert_eq!(file.content, "new");
    }
}
