//! Persistent client and file state
//!
//! A single `sqlx::SqlitePool` backs two in-memory `HashMap` mirrors (by
//! client id and by file path) so that request handlers never have to hit
//! the database to answer a lookup; writes go to both the database and the
//! mirror under one `tokio::sync::Mutex`, the same single-lock-around-
//! shared-state shape the login server's connection handlers use around
//! their account cache.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::crypto;

/// A registered client.
#[derive(Debug, Clone, FromRow)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub public_key: Option<Vec<u8>>,
    pub aes_key: Option<Vec<u8>>,
}

/// A file a client has uploaded (or is uploading).
#[derive(Debug, Clone, FromRow)]
pub struct TransferredFile {
    pub client_id: String,
    pub name: String,
    pub path: String,
    pub verified: bool,
}

struct Inner {
    pool: SqlitePool,
    clients: HashMap<String, Client>,
    files: HashMap<String, TransferredFile>,
}

/// Client and file-transfer bookkeeping, backed by SQLite and mirrored in
/// memory for lock-free reads once the lock is held.
pub struct PersistentState {
    inner: Mutex<Inner>,
}

impl PersistentState {
    /// Open (creating if needed) the SQLite database at `database_url`,
    /// apply schema, and load existing rows into the in-memory mirror.
    pub async fn open(database_url: &str) -> crate::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                last_seen TEXT NOT NULL,
                public_key BLOB,
                aes_key BLOB
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                client_id TEXT NOT NULL,
                name TEXT NOT NULL,
                path TEXT PRIMARY KEY,
                verified INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;

        let client_rows: Vec<ClientRow> = sqlx::query_as::<_, ClientRow>("SELECT * FROM clients")
            .fetch_all(&pool)
            .await?;
        let mut clients = HashMap::with_capacity(client_rows.len());
        for row in client_rows {
            clients.insert(row.id.clone(), row.into_client());
        }

        let file_rows: Vec<FileRow> = sqlx::query_as::<_, FileRow>("SELECT * FROM files")
            .fetch_all(&pool)
            .await?;
        let mut files = HashMap::with_capacity(file_rows.len());
        for row in file_rows {
            files.insert(row.path.clone(), row.into_file());
        }

        info!(
            clients = clients.len(),
            files = files.len(),
            "loaded persistent state"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                pool,
                clients,
                files,
            }),
        })
    }

    /// Register a new client name, generating a fresh id (retrying on the
    /// rare hash collision). Returns `None` if the name is already taken.
    pub async fn register(&self, name: &str, now: DateTime<Utc>) -> crate::Result<Option<String>> {
        let mut inner = self.inner.lock().await;

        if inner.clients.values().any(|c| c.name == name) {
            return Ok(None);
        }

        let id = loop {
            let candidate = hex::encode(crypto::new_client_id());
            if !inner.clients.contains_key(&candidate) {
                break candidate;
            }
            debug!(candidate, "client id collision, regenerating");
        };

        sqlx::query("INSERT INTO clients (id, name, last_seen) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(now.to_rfc3339())
            .execute(&inner.pool)
            .await?;

        inner.clients.insert(
            id.clone(),
            Client {
                id: id.clone(),
                name: name.to_string(),
                last_seen: now,
                public_key: None,
                aes_key: None,
            },
        );

        Ok(Some(id))
    }

    /// Look up a client by id, verifying the claimed name matches.
    pub async fn find(&self, id: &str, name: &str) -> Option<Client> {
        let inner = self.inner.lock().await;
        inner
            .clients
            .get(id)
            .filter(|c| c.name == name)
            .cloned()
    }

    /// Look up a client by id only.
    pub async fn find_by_id(&self, id: &str) -> Option<Client> {
        let inner = self.inner.lock().await;
        inner.clients.get(id).cloned()
    }

    /// Store the client's RSA public key.
    pub async fn set_public_key(&self, id: &str, public_key: &[u8]) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        sqlx::query("UPDATE clients SET public_key = ? WHERE id = ?")
            .bind(public_key)
            .bind(id)
            .execute(&inner.pool)
            .await?;
        if let Some(client) = inner.clients.get_mut(id) {
            client.public_key = Some(public_key.to_vec());
        }
        Ok(())
    }

    /// Store the client's AES session key.
    pub async fn set_symmetric_key(&self, id: &str, aes_key: &[u8]) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        sqlx::query("UPDATE clients SET aes_key = ? WHERE id = ?")
            .bind(aes_key)
            .bind(id)
            .execute(&inner.pool)
            .await?;
        if let Some(client) = inner.clients.get_mut(id) {
            client.aes_key = Some(aes_key.to_vec());
        }
        Ok(())
    }

    /// Refresh a client's last-seen timestamp.
    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        sqlx::query("UPDATE clients SET last_seen = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&inner.pool)
            .await?;
        if let Some(client) = inner.clients.get_mut(id) {
            client.last_seen = now;
        }
        Ok(())
    }

    /// Record (or re-record) an uploaded file, unverified. Mirrors the
    /// original server's `INSERT OR REPLACE` semantics: a re-upload of the
    /// same path simply resets its verified flag.
    pub async fn record_file(&self, client_id: &str, name: &str, path: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        sqlx::query(
            "INSERT OR REPLACE INTO files (client_id, name, path, verified) VALUES (?, ?, ?, 0)",
        )
        .bind(client_id)
        .bind(name)
        .bind(path)
        .execute(&inner.pool)
        .await?;
        inner.files.insert(
            path.to_string(),
            TransferredFile {
                client_id: client_id.to_string(),
                name: name.to_string(),
                path: path.to_string(),
                verified: false,
            },
        );
        Ok(())
    }

    /// Mark a file as CRC-verified.
    pub async fn mark_verified(&self, path: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        sqlx::query("UPDATE files SET verified = 1 WHERE path = ?")
            .bind(path)
            .execute(&inner.pool)
            .await?;
        if let Some(file) = inner.files.get_mut(path) {
            file.verified = true;
        }
        Ok(())
    }

    /// Look up a recorded file by its canonical path.
    pub async fn file_by_path(&self, path: &str) -> Option<TransferredFile> {
        let inner = self.inner.lock().await;
        inner.files.get(path).cloned()
    }
}

#[derive(FromRow)]
struct ClientRow {
    id: String,
    name: String,
    last_seen: String,
    public_key: Option<Vec<u8>>,
    aes_key: Option<Vec<u8>>,
}

impl ClientRow {
    fn into_client(self) -> Client {
        let last_seen = DateTime::parse_from_rfc3339(&self.last_seen)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Client {
            id: self.id,
            name: self.name,
            last_seen,
            public_key: self.public_key,
            aes_key: self.aes_key,
        }
    }
}

#[derive(FromRow)]
struct FileRow {
    client_id: String,
    name: String,
    path: String,
    verified: bool,
}

impl FileRow {
    fn into_file(self) -> TransferredFile {
        TransferredFile {
            client_id: self.client_id,
            name: self.name,
            path: self.path,
            verified: self.verified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_rejects_duplicate_names() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let now = Utc::now();
        let first = state.register("alice", now).await.unwrap();
        assert!(first.is_some());
        let second = state.register("alice", now).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn find_requires_matching_name() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let now = Utc::now();
        let id = state.register("bob", now).await.unwrap().unwrap();
        assert!(state.find(&id, "bob").await.is_some());
        assert!(state.find(&id, "mallory").await.is_none());
    }

    #[tokio::test]
    async fn record_file_then_mark_verified() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let now = Utc::now();
        let id = state.register("carol", now).await.unwrap().unwrap();
        state
            .record_file(&id, "report.bin", "transferred_files/carol/report.bin")
            .await
            .unwrap();
        let file = state
            .file_by_path("transferred_files/carol/report.bin")
            .await
            .unwrap();
        assert!(!file.verified);

        state
            .mark_verified("transferred_files/carol/report.bin")
            .await
            .unwrap();
        let file = state
            .file_by_path("transferred_files/carol/report.bin")
            .await
            .unwrap();
        assert!(file.verified);
    }

    #[tokio::test]
    async fn reload_restores_mirror_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let id = {
            let state = PersistentState::open(&url).await.unwrap();
            state.register("dave", Utc::now()).await.unwrap().unwrap()
        };

        let reopened = PersistentState::open(&url).await.unwrap();
        assert!(reopened.find_by_id(&id).await.is_some());
    }
}
