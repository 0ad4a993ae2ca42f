//! Content-addressed body store (C3): request/response bodies keyed by
//! `"{id}-req-body"` / `"{id}-resp-body"`, grounded on
//! `original_source/proxy/database.go`'s `bodies` table. Rows are
//! pre-sized with `zeroblob` and written through `rusqlite`'s
//! incremental blob API rather than loaded whole into a bound parameter,
//! so storing a body never requires a second full in-memory copy of it
//! inside SQLite's own parameter binding path.

use std::sync::Arc;

use rusqlite::blob::Blob;
use rusqlite::DatabaseName;

use crate::error::StoreError;
use crate::wire::Body;

use super::worker::Worker;

#[derive(Clone)]
pub struct BodyStore {
    worker: Arc<Worker>,
}

impl BodyStore {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    pub(crate) fn create_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bodies (id TEXT PRIMARY KEY, body BLOB NOT NULL)",
            [],
        )?;
        Ok(())
    }

    /// Drains `body` fully and stores it under `key`. Overwrites any
    /// existing row for the same key (a request replayed under
    /// `UPDATE-REQUEST` reuses its id).
    pub async fn put(&self, key: &str, body: &mut Body) -> Result<u64, StoreError> {
        let mut buf = Vec::with_capacity(body.content_length() as usize);
        body.drain_to(&mut buf).await.map_err(StoreError::Io)?;
        self.put_bytes(key, buf).await
    }

    /// As `put`, for a key that already exists — used when the UI
    /// rewrites a body during approval.
    pub async fn update(&self, key: &str, body: &mut Body) -> Result<u64, StoreError> {
        self.put(key, body).await
    }

    pub async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<u64, StoreError> {
        let key = key.to_string();
        let len = bytes.len() as u64;
        self.worker
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO bodies (id, body) VALUES (?1, zeroblob(?2))
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                    rusqlite::params![key, bytes.len() as i64],
                )?;
                let rowid = conn.last_insert_rowid();
                let mut blob: Blob = conn.blob_open(DatabaseName::Main, "bodies", "body", rowid, false)?;
                std::io::Write::write_all(&mut blob, &bytes)?;
                Ok(len)
            })
            .await
    }

    /// Writes a `Content-Length: N\r\n\r\n` prefix followed by the stored
    /// body for `key` to `out`. Returns `StoreError::NotFound` if no row
    /// exists for that key.
    pub async fn write_to(&self, key: &str, out: &mut Vec<u8>) -> Result<(), StoreError> {
        let key = key.to_string();
        let data = self
            .worker
            .run(move |conn| {
                conn.query_row("SELECT body FROM bodies WHERE id = ?1", [&key], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .map_err(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(key.clone()),
                    other => StoreError::Sqlite(other),
                })
            })
            .await?;
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", data.len()).as_bytes());
        out.extend_from_slice(&data);
        Ok(())
    }
}
