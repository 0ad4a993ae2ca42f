//! Request metadata store (C4): persists one row per proxied transaction
//! and answers filter/pagination queries, grounded on
//! `original_source/proxy/database.go`'s `requests` table,
//! `GetRequestsMatchingFilter`, and `uniqueValuesAndCount`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::wire::{Headers, Method};

use super::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Http,
    HttpsTunnel,
    HttpsMitm,
}

impl RequestKind {
    fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Http => "HTTP",
            RequestKind::HttpsTunnel => "HTTPS-TUNNEL",
            RequestKind::HttpsMitm => "HTTPS-MITM",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "HTTP" => Some(RequestKind::Http),
            "HTTPS-TUNNEL" => Some(RequestKind::HttpsTunnel),
            "HTTPS-MITM" => Some(RequestKind::HttpsMitm),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Headers,
    pub body_ref: String,
    pub body_size: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResponseLine {
    pub status_code: u16,
    pub headers: Headers,
    pub body_ref: String,
    pub body_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub kind: RequestKind,
    pub secure: bool,
    pub starred: bool,
    pub started_at: i64,
    pub host: String,
    pub client_ip: String,
    pub client_port: u16,
    pub client_authorization: Option<String>,
    pub client_process_id: Option<u32>,
    pub client_application: Option<String>,
    pub request: Option<RequestLine>,
    pub response: Option<ResponseLine>,
    /// Pre-serialized timing export (see `timing.rs`), stored opaquely.
    pub timing: String,
    pub error_text: Option<String>,
}

const WHITELISTED_UNIQUE_FIELDS: &[&str] = &["client_application", "host", "client_ip"];
const WHITELISTED_FILTER_FIELDS: &[&str] = &["client_application", "host", "client_ip", "secure", "kind"];

/// Fields the control surface may ask for unique values of, exposed so
/// `GET /filter` can enumerate them without duplicating the whitelist.
pub fn filterable_fields() -> &'static [&'static str] {
    WHITELISTED_FILTER_FIELDS
}

/// Subset of `filterable_fields` that `unique_values` accepts.
pub fn fields_with_unique_values() -> &'static [&'static str] {
    WHITELISTED_UNIQUE_FIELDS
}

#[derive(Debug, Clone)]
pub enum FilterValue {
    Text(String),
    Number(i64),
    Boolean(bool),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub terms: Vec<(String, FilterValue)>,
}

impl Filter {
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn push(&mut self, field: &str, value: FilterValue) {
        match &value {
            FilterValue::Text(v) if v.is_empty() => return,
            _ => {}
        }
        self.terms.push((field.to_string(), value));
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct MetadataStore {
    worker: Arc<Worker>,
}

impl MetadataStore {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    pub(crate) fn create_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                secure BOOLEAN NOT NULL,
                starred BOOLEAN NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                host TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                client_port INTEGER NOT NULL,
                client_authorization TEXT,
                client_process_id INTEGER,
                client_application TEXT,
                req_method TEXT NOT NULL DEFAULT '',
                req_path TEXT NOT NULL DEFAULT '',
                req_query TEXT NOT NULL DEFAULT '',
                req_headers TEXT NOT NULL DEFAULT '{}',
                req_body_ref TEXT NOT NULL DEFAULT '',
                req_body_size INTEGER NOT NULL DEFAULT 0,
                resp_status INTEGER NOT NULL DEFAULT 0,
                resp_headers TEXT NOT NULL DEFAULT '{}',
                resp_body_ref TEXT NOT NULL DEFAULT '',
                resp_body_size INTEGER NOT NULL DEFAULT 0,
                timing TEXT NOT NULL DEFAULT '{}',
                error_text TEXT
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn save(&self, record: RequestRecord) -> Result<(), StoreError> {
        self.worker
            .run(move |conn| {
                let req = record.request.clone().unwrap_or_default();
                let resp = record.response.clone().unwrap_or_default();
                conn.execute(
                    "INSERT INTO requests (
                        id, kind, secure, starred, started_at, host, client_ip, client_port,
                        client_authorization, client_process_id, client_application,
                        req_method, req_path, req_query, req_headers, req_body_ref, req_body_size,
                        resp_status, resp_headers, resp_body_ref, resp_body_size,
                        timing, error_text
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                        ?12, ?13, ?14, ?15, ?16, ?17,
                        ?18, ?19, ?20, ?21,
                        ?22, ?23
                    )
                    ON CONFLICT(id) DO UPDATE SET
                        starred = excluded.starred,
                        resp_status = excluded.resp_status,
                        resp_headers = excluded.resp_headers,
                        resp_body_ref = excluded.resp_body_ref,
                        resp_body_size = excluded.resp_body_size,
                        timing = excluded.timing,
                        error_text = excluded.error_text",
                    rusqlite::params![
                        record.id,
                        record.kind.as_str(),
                        record.secure,
                        record.starred,
                        record.started_at,
                        record.host,
                        record.client_ip,
                        record.client_port,
                        record.client_authorization,
                        record.client_process_id,
                        record.client_application,
                        req.method,
                        req.path,
                        req.query,
                        serde_json::to_string(&req.headers).unwrap_or_default(),
                        req.body_ref,
                        req.body_size,
                        resp.status_code,
                        serde_json::to_string(&resp.headers).unwrap_or_default(),
                        resp.body_ref,
                        resp.body_size,
                        record.timing,
                        record.error_text,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<RequestRecord, StoreError> {
        let id = id.to_string();
        self.worker
            .run(move |conn| {
                conn.query_row("SELECT * FROM requests WHERE id = ?1", [&id], row_to_record)
                    .map_err(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::RecordNotFound(id.clone()),
                        other => StoreError::Sqlite(other),
                    })
            })
            .await
    }

    pub async fn set_starred(&self, id: &str, starred: bool) -> Result<(), StoreError> {
        let id = id.to_string();
        self.worker
            .run(move |conn| {
                let changed = conn.execute("UPDATE requests SET starred = ?1 WHERE id = ?2", rusqlite::params![starred, id])?;
                if changed == 0 {
                    return Err(StoreError::RecordNotFound(id));
                }
                Ok(())
            })
            .await
    }

    pub async fn unique_values(&self, field: &str) -> Result<Vec<(String, i64)>, StoreError> {
        if !WHITELISTED_UNIQUE_FIELDS.contains(&field) {
            return Err(StoreError::BadFilter(field.to_string()));
        }
        let field = field.to_string();
        self.worker
            .run(move |conn| {
                let query = format!(
                    "SELECT {field}, COUNT(*) AS c FROM requests GROUP BY {field} ORDER BY c DESC",
                    field = field
                );
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt
                    .query_map([], |row| {
                        let value: Option<String> = row.get(0)?;
                        let count: i64 = row.get(1)?;
                        Ok((value.unwrap_or_default(), count))
                    })?
                    .filter_map(Result::ok)
                    .filter(|(value, _)| !value.is_empty())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn find(&self, filter: Filter, offset: i64, limit: i64) -> Result<(Vec<RequestRecord>, i64), StoreError> {
        for (field, _) in &filter.terms {
            if !WHITELISTED_FILTER_FIELDS.contains(&field.as_str()) {
                return Err(StoreError::BadFilter(field.clone()));
            }
        }
        self.worker
            .run(move |conn| {
                let mut clauses = Vec::new();
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                for (field, value) in &filter.terms {
                    clauses.push(format!("{field} = ?"));
                    params.push(match value {
                        FilterValue::Text(v) => Box::new(v.clone()),
                        FilterValue::Number(v) => Box::new(*v),
                        FilterValue::Boolean(v) => Box::new(*v),
                    });
                }
                let where_clause = if clauses.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", clauses.join(" AND "))
                };

                let count_query = format!("SELECT COUNT(*) FROM requests{where_clause}");
                let count_params: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let total: i64 = conn.query_row(&count_query, count_params.as_slice(), |row| row.get(0))?;

                let data_query = format!("SELECT * FROM requests{where_clause} ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?");
                let mut data_params: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
                data_params.push(&limit);
                data_params.push(&offset);

                let mut stmt = conn.prepare(&data_query)?;
                let records = stmt
                    .query_map(data_params.as_slice(), row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((records, total))
            })
            .await
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRecord> {
    let kind_text: String = row.get("kind")?;
    let req_headers_raw: String = row.get("req_headers")?;
    let resp_headers_raw: String = row.get("resp_headers")?;
    let req_body_size: u64 = row.get::<_, i64>("req_body_size")? as u64;
    let resp_body_size: u64 = row.get::<_, i64>("resp_body_size")? as u64;

    Ok(RequestRecord {
        id: row.get("id")?,
        kind: RequestKind::from_str(&kind_text).unwrap_or(RequestKind::Http),
        secure: row.get("secure")?,
        starred: row.get("starred")?,
        started_at: row.get("started_at")?,
        host: row.get("host")?,
        client_ip: row.get("client_ip")?,
        client_port: row.get::<_, i64>("client_port")? as u16,
        client_authorization: row.get("client_authorization")?,
        client_process_id: row.get::<_, Option<i64>>("client_process_id")?.map(|v| v as u32),
        client_application: row.get("client_application")?,
        request: Some(RequestLine {
            method: row.get("req_method")?,
            path: row.get("req_path")?,
            query: row.get("req_query")?,
            headers: serde_json::from_str(&req_headers_raw).unwrap_or_default(),
            body_ref: row.get("req_body_ref")?,
            body_size: req_body_size,
        }),
        response: Some(ResponseLine {
            status_code: row.get::<_, i64>("resp_status")? as u16,
            headers: serde_json::from_str(&resp_headers_raw).unwrap_or_default(),
            body_ref: row.get("resp_body_ref")?,
            body_size: resp_body_size,
        }),
        timing: row.get("timing")?,
        error_text: row.get("error_text")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_connection;

    async fn test_store() -> MetadataStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        std::mem::forget(dir);
        let worker = Arc::new(Worker::spawn(move || open_connection(&path)).unwrap());
        MetadataStore::new(worker)
    }

    fn sample(id: &str, host: &str, started_at: i64) -> RequestRecord {
        RequestRecord {
            id: id.to_string(),
            kind: RequestKind::Http,
            secure: false,
            starred: false,
            started_at,
            host: host.to_string(),
            client_ip: "127.0.0.1".to_string(),
            client_port: 1234,
            client_authorization: None,
            client_process_id: None,
            client_application: Some("curl".to_string()),
            request: Some(RequestLine {
                method: Method::Get.as_str().to_string(),
                path: "/".to_string(),
                query: String::new(),
                headers: Headers::new(),
                body_ref: format!("{id}-req-body"),
                body_size: 0,
            }),
            response: None,
            timing: "{}".to_string(),
            error_text: None,
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let store = test_store().await;
        store.save(sample("r1", "example.test", 100)).await.unwrap();
        let record = store.get_by_id("r1").await.unwrap();
        assert_eq!(record.host, "example.test");
        assert_eq!(record.client_application.as_deref(), Some("curl"));
    }

    #[tokio::test]
    async fn get_by_id_missing_is_record_not_found() {
        let store = test_store().await;
        let err = store.get_by_id("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn set_starred_updates_flag() {
        let store = test_store().await;
        store.save(sample("r1", "example.test", 100)).await.unwrap();
        store.set_starred("r1", true).await.unwrap();
        let record = store.get_by_id("r1").await.unwrap();
        assert!(record.starred);
    }

    #[tokio::test]
    async fn find_orders_by_started_at_desc_and_paginates() {
        let store = test_store().await;
        store.save(sample("r1", "a.test", 100)).await.unwrap();
        store.save(sample("r2", "a.test", 300)).await.unwrap();
        store.save(sample("r3", "a.test", 200)).await.unwrap();

        let (records, total) = store.find(Filter::new(), 0, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r2", "r3"]);
    }

    #[tokio::test]
    async fn find_rejects_unwhitelisted_field() {
        let store = test_store().await;
        let mut filter = Filter::new();
        filter.push("resp_status", FilterValue::Number(200));
        let err = store.find(filter, 0, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::BadFilter(_)));
    }

    #[tokio::test]
    async fn unique_values_skips_empty_and_orders_by_count() {
        let store = test_store().await;
        store.save(sample("r1", "a.test", 1)).await.unwrap();
        store.save(sample("r2", "a.test", 2)).await.unwrap();
        store.save(sample("r3", "b.test", 3)).await.unwrap();

        let values = store.unique_values("host").await.unwrap();
        assert_eq!(values[0], ("a.test".to_string(), 2));
        assert_eq!(values[1], ("b.test".to_string(), 1));
    }
}
