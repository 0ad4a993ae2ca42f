//! Persistence: a single-writer SQLite connection backing both the
//! content-addressed body store (C3) and the request metadata store
//! (C4), grounded on `original_source/proxy/database.go`.

mod bodies;
mod metadata;
mod worker;

pub use bodies::BodyStore;
pub use metadata::{
    fields_with_unique_values, filterable_fields, Filter, FilterValue, MetadataStore, RequestKind, RequestLine,
    RequestRecord, ResponseLine,
};
pub use worker::Worker;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;

use crate::error::StoreError;

pub fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    bodies::BodyStore::create_schema(&conn)?;
    metadata::MetadataStore::create_schema(&conn)?;
    Ok(conn)
}

/// Opens the on-disk database and returns the two stores sharing its
/// single writer thread.
pub fn open(path: &Path) -> Result<(BodyStore, MetadataStore), StoreError> {
    let owned = path.to_path_buf();
    let worker = Arc::new(Worker::spawn(move || open_connection(&owned))?);
    Ok((BodyStore::new(worker.clone()), MetadataStore::new(worker)))
}
