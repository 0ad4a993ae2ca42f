//! Line-oriented request/response head parsing, grounded on
//! `original_source/proxy/http/{reqparser,respparser,parser}.go`. Bodies
//! are attached separately once the head has been read, so the caller
//! controls where the body spills to.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::WireError;

use super::header::Headers;
use super::method::Method;

const MAX_HEAD_LINE: usize = 64 * 1024;

/// Deadline for reading a response's status line once the request has
/// been forwarded. A dead upstream should not hang a connection forever.
pub const RESPONSE_HEAD_TIMEOUT: Duration = Duration::from_secs(60);

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, WireError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a full line was read",
        )));
    }
    if buf.len() > MAX_HEAD_LINE {
        return Err(WireError::Protocol);
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| WireError::Protocol)
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Headers, WireError> {
    let mut headers = Headers::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (key, value) = line.split_once(':').ok_or(WireError::Protocol)?;
        headers.add(key.trim(), value.trim());
    }
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub proto: String,
    pub headers: Headers,
}

/// Reads a request line and headers. Errors if the method token is
/// unrecognized or the `Host` header is absent — every request this
/// proxy forwards needs a destination.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RequestHead, WireError> {
    let line = read_line(reader).await?;
    let mut parts = line.splitn(3, ' ');
    let method_token = parts.next().filter(|s| !s.is_empty()).ok_or(WireError::Protocol)?;
    let target = parts.next().filter(|s| !s.is_empty()).ok_or(WireError::Protocol)?;
    let proto = parts.next().filter(|s| !s.is_empty()).ok_or(WireError::Protocol)?.to_string();

    let method = Method::from_bytes(method_token.as_bytes());
    if matches!(method, Method::Unknown) {
        return Err(WireError::Protocol);
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let headers = read_headers(reader).await?;
    if headers.get("Host").is_none() && method != Method::Connect {
        return Err(WireError::MissingHost);
    }

    Ok(RequestHead {
        method,
        path,
        query,
        proto,
        headers,
    })
}

pub struct ResponseHead {
    pub proto: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Headers,
}

pub async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead, WireError> {
    let head = tokio::time::timeout(RESPONSE_HEAD_TIMEOUT, async {
        let line = read_line(reader).await?;
        let mut parts = line.splitn(3, ' ');
        let proto = parts.next().filter(|s| !s.is_empty()).ok_or(WireError::Protocol)?.to_string();
        let code_token = parts.next().filter(|s| !s.is_empty()).ok_or(WireError::Protocol)?;
        let status_text = parts.next().unwrap_or("").to_string();
        let status_code: u16 = code_token.parse().map_err(|_| WireError::InvalidStatusCode)?;
        let headers = read_headers(reader).await?;
        Ok::<_, WireError>(ResponseHead {
            proto,
            status_code,
            status_text,
            headers,
        })
    })
    .await
    .map_err(|_| {
        WireError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out waiting for response status line",
        ))
    })??;
    Ok(head)
}

/// Resolves the declared body length for a parsed head. Requests whose
/// method requires a body (`Method::requires_content_length`) must carry
/// a well-formed `Content-Length`; all other heads default to zero when
/// the header is absent. Chunked transfer encoding is not supported.
pub fn content_length(headers: &Headers, method_requires_body: bool) -> Result<u64, WireError> {
    match headers.get("Content-Length") {
        Some(v) => v.trim().parse::<u64>().map_err(|_| WireError::InvalidContentLength),
        None if method_requires_body => Err(WireError::MissingContentLength),
        None => Ok(0),
    }
}
