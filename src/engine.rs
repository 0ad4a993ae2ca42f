//! The per-connection request engine (C7): the state machine described
//! in spec §4.7, grounded on `original_source/proxy/request.go`'s
//! `Init`/`Perform` and `proxy/proxy.go`'s CONNECT dispatch.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::ca::CertificateAuthority;
use crate::config::SharedConfig;
use crate::error::{CertError, EngineError};
use crate::events::{ApprovalOutcome, EventBus};
use crate::live_body::LiveBodies;
use crate::store::{BodyStore, MetadataStore, RequestKind, RequestLine, RequestRecord, ResponseLine};
use crate::timing::Timing;
use crate::wire::{self, Body, Headers, Method, Request};

type DynReader = Box<dyn AsyncRead + Unpin + Send>;
type DynWriter = Box<dyn AsyncWrite + Unpin + Send>;

pub struct EngineContext {
    pub config: SharedConfig,
    pub ca: Option<Arc<CertificateAuthority>>,
    pub bodies: BodyStore,
    pub metadata: MetadataStore,
    pub bus: EventBus,
    pub live_bodies: LiveBodies,
    pub spill_dir: std::path::PathBuf,
    pub own_pid: u32,
    pub own_local_ip: Option<std::net::IpAddr>,
}

#[derive(Default)]
struct ByteCounter(AtomicU64);

impl ByteCounter {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Wraps the client-facing socket to count bytes read and written, per
/// `original_source/proxy/reader.go`'s `CustomConn`.
struct CountedStream<T> {
    inner: T,
    counter: Arc<ByteCounter>,
}

impl<T: AsyncRead + Unpin> AsyncRead for CountedStream<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if poll.is_ready() {
            this.counter.add((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CountedStream<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.counter.add(*n as u64);
        }
        poll
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn loopback_label(ip: std::net::IpAddr, own_local_ip: Option<std::net::IpAddr>) -> String {
    if crate::process_info::is_loopback(&ip) || Some(ip) == own_local_ip {
        "This Device".to_string()
    } else {
        ip.to_string()
    }
}

/// A plain-HTTP proxy request target arrives in absolute form
/// (`http://host[:port]/path`); the upstream server expects origin form
/// (`/path`). CONNECT targets and already-origin-form paths pass through
/// unchanged.
fn strip_absolute_form(path: &str) -> String {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = path.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(i) => rest[i..].to_string(),
                None => "/".to_string(),
            };
        }
    }
    path.to_string()
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(stripped) = authority.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            let host = &stripped[..end];
            let rest = &stripped[end + 1..];
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (authority.to_string(), default_port),
    }
}

/// Entry point: one task per accepted TCP connection.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<EngineContext>) {
    let counter = Arc::new(ByteCounter::default());
    let counted = CountedStream {
        inner: stream,
        counter: counter.clone(),
    };
    let (read_half, write_half) = tokio::io::split(counted);
    let reader: DynReader = Box::new(read_half);
    let writer: DynWriter = Box::new(write_half);
    let mut buf_reader = BufReader::new(reader);

    let mut timing = Timing::new();
    timing.start("Read proxy request");
    let head = wire::read_request_head(&mut buf_reader).await;
    timing.stop();

    let head = match head {
        Ok(h) => h,
        Err(_) => return, // S6: no id assigned yet, close silently.
    };

    // Any bytes the BufReader already pulled past the blank line belong
    // to the body or, for CONNECT, to data the client sent without
    // waiting for our response; carry them forward instead of dropping
    // them on the floor.
    let leftover = buf_reader.buffer().to_vec();
    let reader: DynReader = Box::new(std::io::Cursor::new(leftover).chain(buf_reader.into_inner()));

    timing.start("Request init");
    let config = ctx.config.snapshot().await;
    let id = Uuid::new_v4().to_string();
    let default_port = if head.method == Method::Connect { 443 } else { 80 };
    let (host, port) = split_host_port(
        head.headers.get("Host").unwrap_or(&head.path).trim(),
        default_port,
    );
    let kind = if head.method == Method::Connect {
        if config.mitm && ctx.ca.is_some() {
            RequestKind::HttpsMitm
        } else {
            RequestKind::HttpsTunnel
        }
    } else {
        RequestKind::Http
    };
    let client_ip = loopback_label(peer_addr.ip(), ctx.own_local_ip);
    let client_authorization = head.headers.get("Proxy-Authorization").map(String::from);

    let mut client_process_id = None;
    let mut client_application = None;
    if config.get_client_process_info && crate::process_info::is_loopback(&peer_addr.ip()) {
        timing.substart("Client process info");
        if let Some(info) = crate::process_info::lookup(peer_addr.port(), ctx.own_pid).await {
            client_process_id = Some(info.pid);
            client_application = Some(info.application);
        }
        timing.substop();
    }
    timing.stop();

    ctx.bus
        .publish(
            "NEW",
            json!({
                "id": id,
                "datetime": Utc::now().to_rfc3339(),
                "host": host,
                "secure": kind != RequestKind::Http,
                "client_ip": client_ip,
                "client_authorization": client_authorization,
                "client_process_id": client_process_id,
                "client_application": client_application,
            }),
        )
        .await;

    let session = Session {
        ctx,
        id,
        timing,
        config,
        kind,
        host,
        port,
        client_ip,
        client_port: peer_addr.port(),
        client_authorization,
        client_process_id,
        client_application,
        byte_counter: counter,
    };

    match kind {
        RequestKind::HttpsTunnel => session.run_tunnel(writer, reader).await,
        RequestKind::HttpsMitm => session.run_mitm(writer, reader, head).await,
        RequestKind::Http => session.run_plain(writer, reader, head).await,
    }
}

struct Session {
    ctx: Arc<EngineContext>,
    id: String,
    timing: Timing,
    config: crate::config::Config,
    kind: RequestKind,
    host: String,
    port: u16,
    client_ip: String,
    client_port: u16,
    client_authorization: Option<String>,
    client_process_id: Option<u32>,
    client_application: Option<String>,
    byte_counter: Arc<ByteCounter>,
}

const TUNNEL_OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

impl Session {
    fn secure(&self) -> bool {
        self.kind != RequestKind::Http
    }

    /// Waits for an approval outcome, applying any `UPDATE-REQUEST`
    /// mutations received in the meantime to `method`/`path`/`query`/
    /// `headers`/`write_body`. `host`/`secure` mutations are accepted by
    /// the wire format but ignored here: the pathway is frozen once
    /// `Initialized`.
    async fn await_approval_applying_mutations(
        &mut self,
        write_body: &mut Option<Vec<u8>>,
        headers: &mut Headers,
        method: &mut Method,
        path: &mut String,
        query: &mut String,
    ) -> bool {
        let mut handle = self.ctx.bus.await_approval(&self.id).await;
        loop {
            tokio::select! {
                mutation = handle.mutations.recv() => {
                    match mutation {
                        Some(m) => {
                            if let Some(new_method) = m.method.as_deref() {
                                *method = Method::from_bytes(new_method.as_bytes());
                            }
                            if let Some(new_path) = m.path { *path = new_path; }
                            if let Some(new_query) = m.query { *query = new_query; }
                            if let Some(new_headers) = m.headers { *headers = new_headers; }
                            if let Some(body) = m.body {
                                headers.set("Content-Length", body.len().to_string());
                                self.ctx.live_bodies.set(&self.id, body.clone()).await;
                                *write_body = Some(body);
                            }
                        }
                        None => continue,
                    }
                }
                outcome = &mut handle.outcome => {
                    return matches!(outcome, Ok(ApprovalOutcome::Approved));
                }
            }
        }
    }

    /// Waits for an approval outcome without a request to mutate (the
    /// CONNECT pathways: tunneling and the MITM handshake both precede
    /// having a rewritable inner request).
    async fn await_approval_plain(&mut self) -> bool {
        let mut handle = self.ctx.bus.await_approval(&self.id).await;
        loop {
            tokio::select! {
                mutation = handle.mutations.recv() => {
                    if mutation.is_none() {
                        continue;
                    }
                }
                outcome = &mut handle.outcome => {
                    return matches!(outcome, Ok(ApprovalOutcome::Approved));
                }
            }
        }
    }

    async fn run_tunnel(mut self, client_writer: DynWriter, client_reader: DynReader) {
        if let Err(err) = self.run_tunnel_inner(client_writer, client_reader).await {
            self.emit_error(&err.to_string()).await;
        }
    }

    /// Per the FSM's `SecureTunnelOpening` state: the 200 is sent first,
    /// then (if configured) the connection waits on approval before a
    /// delay and the upstream dial.
    async fn run_tunnel_inner(
        &mut self,
        mut client_writer: DynWriter,
        mut client_reader: DynReader,
    ) -> Result<(), EngineError> {
        self.timing.start("Send proxy response");
        let write_ok = client_writer.write_all(TUNNEL_OK_RESPONSE).await;
        self.timing.stop();
        write_ok.map_err(EngineError::WriteClient)?;

        if self.config.require_approval {
            self.timing.start("Wait approval");
            let approved = self.await_approval_plain().await;
            self.timing.stop();
            if !approved {
                self.ctx.bus.publish("APPROVAL-CANCELED", json!({"id": self.id})).await;
                return Ok(());
            }
        }

        self.timing.start("Perform delay");
        self.perform_delay_no_span().await;
        self.timing.stop();

        self.ctx.bus.publish("TUNNEL", json!({"id": self.id})).await;

        self.timing.start("Tunnel");
        let dial = TcpStream::connect((self.host.as_str(), self.port)).await;
        let mut upstream = match dial {
            Ok(s) => s,
            Err(err) => {
                self.timing.stop();
                return Err(EngineError::DialUpstream(err));
            }
        };
        let (mut up_read, mut up_write) = upstream.split();
        let result = tokio::select! {
            r = tokio::io::copy(&mut client_reader, &mut up_write) => r,
            r = tokio::io::copy(&mut up_read, &mut client_writer) => r,
        };
        self.timing.stop();
        let _ = upstream.shutdown().await;

        result.map_err(EngineError::Tunnel)?;
        self.emit_done().await;
        Ok(())
    }

    async fn run_mitm(mut self, client_writer: DynWriter, client_reader: DynReader, head: wire::RequestHead) {
        if let Err(err) = self.run_mitm_inner(client_writer, client_reader, head).await {
            self.emit_error(&err.to_string()).await;
        }
    }

    /// Per the FSM's `SecureMitmOpening` state: send 200, mint the leaf
    /// and complete the TLS handshake, read the inner request, then hand
    /// off to `run_plain`'s single approval gate. There is no approval
    /// step here — gating twice would leave a second, never-approved
    /// waiter registered after the first `APPROVAL-APPROVE` resolves the
    /// first one.
    async fn run_mitm_inner(
        &mut self,
        client_writer: DynWriter,
        client_reader: DynReader,
        _head: wire::RequestHead,
    ) -> Result<(), EngineError> {
        let ca = self.ctx.ca.clone().ok_or(CertError::NotLoaded)?;

        let mut client_writer = client_writer;
        self.timing.start("Send proxy response");
        let write_ok = client_writer.write_all(TUNNEL_OK_RESPONSE).await;
        self.timing.stop();
        write_ok.map_err(EngineError::WriteClient)?;

        self.timing.start("Cert gen + TLS handshake");
        let server_config = match ca.server_config_for_host(&self.host).await {
            Ok(cfg) => cfg,
            Err(err) => {
                self.timing.stop();
                return Err(err.into());
            }
        };
        let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
        let raw_stream = AsyncDuplex {
            reader: client_reader,
            writer: client_writer,
        };
        let tls_stream = match acceptor.accept(raw_stream).await {
            Ok(s) => s,
            Err(err) => {
                self.timing.stop();
                return Err(CertError::Handshake(err).into());
            }
        };
        self.timing.stop();

        let (tls_read, tls_write) = tokio::io::split(tls_stream);
        let reader: DynReader = Box::new(tls_read);
        let writer: DynWriter = Box::new(tls_write);
        let mut buf_reader = BufReader::new(reader);

        self.timing.start("Read request");
        let inner_head = wire::read_request_head(&mut buf_reader).await;
        self.timing.stop();
        let inner_head = inner_head?;
        let leftover = buf_reader.buffer().to_vec();
        let reader: DynReader = Box::new(std::io::Cursor::new(leftover).chain(buf_reader.into_inner()));

        self.run_plain_inner(writer, reader, inner_head).await
    }

    async fn run_plain(mut self, client_writer: DynWriter, client_reader: DynReader, head: wire::RequestHead) {
        if let Err(err) = self.run_plain_inner(client_writer, client_reader, head).await {
            self.emit_error(&err.to_string()).await;
        }
    }

    async fn run_plain_inner(
        &mut self,
        mut client_writer: DynWriter,
        client_reader: DynReader,
        head: wire::RequestHead,
    ) -> Result<(), EngineError> {
        let mut method = head.method;
        let mut path = head.path;
        let mut query = head.query;
        let mut headers = head.headers;
        if self.kind == RequestKind::Http {
            path = strip_absolute_form(&path);
            headers.remove("Proxy-Authorization");
            headers.remove("Proxy-Connection");
        }
        if self.config.real_ip_header {
            headers.add("X-Forwarded-For", self.client_ip.clone());
        }

        let requires_body = method.requires_content_length();
        let declared_len = wire::content_length(&headers, requires_body)?;

        let mut body = Body::from_origin(client_reader, declared_len, &self.ctx.spill_dir).await?;

        self.ctx
            .bus
            .publish(
                "REQUEST",
                json!({
                    "id": self.id,
                    "method": method.as_str(),
                    "path": path,
                    "query": query,
                    "headers": &headers,
                    "bytes_transferred": self.byte_counter.get(),
                }),
            )
            .await;

        let mut write_body: Option<Vec<u8>> = None;
        self.timing.start("Perform request");
        if self.config.require_approval {
            self.timing.substart("Wait approval");
            // Materialize the body into memory up front so an approval UI can
            // read (and edit) it in full, and so the live-body registry has
            // real content from the moment the wait begins, not only after
            // the first UPDATE-REQUEST mutation.
            let mut drained = Vec::new();
            if let Err(err) = body.drain_to(&mut drained).await {
                self.timing.substop();
                self.timing.stop();
                return Err(err.into());
            }
            self.ctx.live_bodies.set(&self.id, drained.clone()).await;
            write_body = Some(drained);

            let approved = self
                .await_approval_applying_mutations(&mut write_body, &mut headers, &mut method, &mut path, &mut query)
                .await;
            self.ctx.live_bodies.clear(&self.id).await;
            self.timing.substop();
            if !approved {
                self.timing.stop();
                self.ctx.bus.publish("APPROVAL-CANCELED", json!({"id": self.id})).await;
                return Ok(());
            }
        }

        self.timing.substart("Perform delay");
        self.perform_delay_no_span().await;
        self.timing.substop();

        self.timing.substart("Dial host");
        let upstream = TcpStream::connect((self.host.as_str(), self.port)).await;
        self.timing.substop();
        let mut upstream = match upstream {
            Ok(s) => s,
            Err(err) => {
                self.timing.stop();
                return Err(EngineError::DialUpstream(err));
            }
        };

        let mut request = Request {
            method,
            path,
            query,
            proto: head.proto.clone(),
            headers,
            body,
        };

        self.timing.substart("Write request");
        let mut head_bytes = Vec::new();
        request.write_head_to(&mut head_bytes);
        let write_result: io::Result<()> = async {
            upstream.write_all(&head_bytes).await?;
            if let Some(bytes) = &write_body {
                upstream.write_all(bytes).await?;
            } else {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    let n = request.body.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    upstream.write_all(&buf[..n]).await?;
                }
            }
            Ok(())
        }
        .await;
        self.timing.substop();
        if let Err(err) = write_result {
            self.timing.stop();
            return Err(EngineError::WriteUpstream(err));
        }

        self.timing.substart("Read response");
        let mut upstream_reader = BufReader::new(&mut upstream);
        let response_head = wire::read_response_head(&mut upstream_reader).await;
        self.timing.substop();
        self.timing.stop();
        let response_head = response_head?;

        self.ctx
            .bus
            .publish(
                "RESPONSE",
                json!({
                    "id": self.id,
                    "status_code": response_head.status_code,
                    "headers": &response_head.headers,
                }),
            )
            .await;

        let resp_len = match wire::content_length(&response_head.headers, false) {
            Ok(n) => n,
            Err(_) => 0,
        };
        let upstream_leftover = upstream_reader.buffer().to_vec();
        let resp_body_reader: DynReader = Box::new(std::io::Cursor::new(upstream_leftover).chain(upstream));
        let mut response_body = Body::from_origin(resp_body_reader, resp_len, &self.ctx.spill_dir).await?;

        self.timing.start("Write response");
        let mut resp = crate::wire::Response {
            proto: response_head.proto.clone(),
            status_code: response_head.status_code,
            status_text: if response_head.status_text.is_empty() {
                wire::status_text(response_head.status_code).to_string()
            } else {
                response_head.status_text.clone()
            },
            headers: response_head.headers.clone(),
            body: Body::empty(),
        };
        std::mem::swap(&mut resp.body, &mut response_body);
        let mut resp_head_bytes = Vec::new();
        resp.write_head_to(&mut resp_head_bytes);
        let write_result: io::Result<()> = async {
            client_writer.write_all(&resp_head_bytes).await?;
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = resp.body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                client_writer.write_all(&buf[..n]).await?;
            }
            Ok(())
        }
        .await;
        self.timing.stop();
        write_result.map_err(EngineError::WriteClient)?;

        let req_body_ref = format!("{}-req-body", self.id);
        let resp_body_ref = format!("{}-resp-body", self.id);

        self.timing.start("Save request body");
        let req_body_size = match &write_body {
            Some(bytes) => {
                let origin: DynReader = Box::new(std::io::Cursor::new(bytes.clone()));
                if let Ok(mut mutated_body) = Body::from_origin(origin, bytes.len() as u64, &self.ctx.spill_dir).await {
                    let _ = self.ctx.bodies.update(&req_body_ref, &mut mutated_body).await;
                }
                bytes.len() as u64
            }
            None => {
                let _ = self.ctx.bodies.put(&req_body_ref, &mut request.body).await;
                request.body.content_length()
            }
        };
        self.timing.stop();

        self.timing.start("Save response body");
        let resp_body_size = resp.body.content_length();
        let _ = self.ctx.bodies.put(&resp_body_ref, &mut resp.body).await;
        self.timing.stop();

        let record = RequestRecord {
            id: self.id.clone(),
            kind: self.kind,
            secure: self.secure(),
            starred: false,
            started_at: Utc::now().timestamp_millis(),
            host: self.host.clone(),
            client_ip: self.client_ip.clone(),
            client_port: self.client_port,
            client_authorization: self.client_authorization.clone(),
            client_process_id: self.client_process_id,
            client_application: self.client_application.clone(),
            request: Some(RequestLine {
                method: request.method.as_str().to_string(),
                path: request.path,
                query: request.query,
                headers: request.headers,
                body_ref: req_body_ref,
                body_size: req_body_size,
            }),
            response: Some(ResponseLine {
                status_code: resp.status_code,
                headers: resp.headers,
                body_ref: resp_body_ref,
                body_size: resp_body_size,
            }),
            timing: serde_json::to_string(&self.timing.export()).unwrap_or_default(),
            error_text: None,
        };
        let _ = self.ctx.metadata.save(record).await;

        self.emit_done().await;
        Ok(())
    }

    async fn perform_delay_no_span(&mut self) {
        if self.config.perform_delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.perform_delay)).await;
        }
    }

    async fn emit_done(&self) {
        let export = self.timing.export();
        self.ctx
            .bus
            .publish(
                "DONE",
                json!({
                    "id": self.id,
                    "bytes_transferred": self.byte_counter.get(),
                    "timing": export.spans,
                    "timing_total": export.total_ms,
                }),
            )
            .await;
    }

    async fn emit_error(&self, message: &str) {
        let export = self.timing.export();
        self.ctx
            .bus
            .publish(
                "ERROR",
                json!({
                    "id": self.id,
                    "error": message,
                    "bytes_transferred": self.byte_counter.get(),
                    "timing": export.spans,
                    "timing_total": export.total_ms,
                }),
            )
            .await;
    }
}

/// Joins a split read half and write half back into one duplex stream so
/// `TlsAcceptor::accept` (which needs `AsyncRead + AsyncWrite` on a
/// single value) can run over our already-split, already-counted client
/// socket.
struct AsyncDuplex {
    reader: DynReader,
    writer: DynWriter,
}

impl AsyncRead for AsyncDuplex {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for AsyncDuplex {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_ipv6_literal_authority() {
        let (host, port) = split_host_port("[::1]:8443", 443);
        assert_eq!(host, "::1");
        assert_eq!(port, 8443);
    }

    #[test]
    fn splits_ipv6_literal_without_port_uses_default() {
        let (host, port) = split_host_port("[::1]", 443);
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn splits_plain_host_port() {
        let (host, port) = split_host_port("example.test:8080", 80);
        assert_eq!(host, "example.test");
        assert_eq!(port, 8080);
    }

    #[test]
    fn host_without_port_uses_default() {
        let (host, port) = split_host_port("example.test", 80);
        assert_eq!(host, "example.test");
        assert_eq!(port, 80);
    }

    #[test]
    fn strips_absolute_form_target_to_origin_form() {
        assert_eq!(strip_absolute_form("http://example.test/hi"), "/hi");
        assert_eq!(strip_absolute_form("https://example.test:8443/a/b"), "/a/b");
    }

    #[test]
    fn absolute_form_without_path_becomes_root() {
        assert_eq!(strip_absolute_form("http://example.test"), "/");
    }

    #[test]
    fn origin_form_target_passes_through() {
        assert_eq!(strip_absolute_form("/already/origin"), "/already/origin");
    }
}
