//! Error taxonomy for the proxy engine. Every component gets its own enum;
//! `EngineError` is the single join point the request engine's top-level
//! task catches errors at.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("protocol error: malformed request/response line")]
    Protocol,
    #[error("missing Host header")]
    MissingHost,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid status code in response")]
    InvalidStatusCode,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("CA material not loaded")]
    NotLoaded,
    #[error("failed to read CA file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse CA material: {0}")]
    Parse(String),
    #[error("failed to mint leaf certificate: {0}")]
    Mint(String),
    #[error("tls handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found for key {0}")]
    NotFound(String),
    #[error("unsupported filter field {0}")]
    BadFilter(String),
    #[error("record not found for id {0}")]
    RecordNotFound(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store worker unavailable")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unexpected event-bus message: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("dial upstream: {0}")]
    DialUpstream(std::io::Error),
    #[error("write upstream: {0}")]
    WriteUpstream(std::io::Error),
    #[error("write response to client: {0}")]
    WriteClient(std::io::Error),
    #[error("tunnel: {0}")]
    Tunnel(std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
