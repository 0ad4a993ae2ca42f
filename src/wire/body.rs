//! Streaming request/response body with tee-on-first-read replay, per
//! spec §4.1 and the "Tee-on-first-read body" redesign note in §9.
//!
//! A body is read once from its origin (the client or upstream socket) to
//! forward it, and read again from the same logical source to persist it
//! into the body store. Rather than require callers to buffer the whole
//! thing, the first full pass tees bytes into a spill file; once the
//! declared content length has been sourced, every subsequent read or
//! drain replays the spill file from the start.

use std::io;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

struct Sourcing {
    origin: Box<dyn AsyncRead + Unpin + Send>,
    spill_writer: File,
    read_n: u64,
}

enum State {
    /// Zero-length body: nothing to source or replay.
    Empty,
    Sourcing(Sourcing),
    Replaying(File),
    Closed,
}

pub struct Body {
    content_length: u64,
    state: State,
    spill_path: Option<PathBuf>,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            content_length: 0,
            state: State::Empty,
            spill_path: None,
        }
    }

    /// Wraps `origin` as a streaming body of exactly `content_length`
    /// bytes, spilling into a fresh temp file under `spill_dir`.
    pub async fn from_origin(
        origin: Box<dyn AsyncRead + Unpin + Send>,
        content_length: u64,
        spill_dir: &std::path::Path,
    ) -> io::Result<Self> {
        if content_length == 0 {
            return Ok(Self::empty());
        }
        let named = tempfile::Builder::new()
            .prefix("devproxy-body-")
            .tempfile_in(spill_dir)?;
        let (_file, path) = named.keep().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let spill_writer = File::create(&path).await?;
        Ok(Self {
            content_length,
            state: State::Sourcing(Sourcing {
                origin,
                spill_writer,
                read_n: 0,
            }),
            spill_path: Some(path),
        })
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Pull interface: yields up to `content_length` bytes total, then
    /// reports end-of-stream (`Ok(0)`). A short origin read before
    /// `content_length` bytes have been seen propagates as an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match &mut self.state {
                State::Empty | State::Closed => return Ok(0),
                State::Replaying(file) => return file.read(buf).await,
                State::Sourcing(src) => {
                    if src.read_n >= self.content_length {
                        self.enter_replaying().await?;
                        continue;
                    }
                    let remaining = (self.content_length - src.read_n) as usize;
                    let want = buf.len().min(remaining);
                    if want == 0 {
                        return Ok(0);
                    }
                    let n = src.origin.read(&mut buf[..want]).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "origin closed before declared content length was read",
                        ));
                    }
                    src.spill_writer.write_all(&buf[..n]).await?;
                    src.read_n += n as u64;
                    return Ok(n);
                }
            }
        }
    }

    /// Drain-to-writer interface: copies the full body (replaying from
    /// the spill file once sourcing is complete) to `writer`.
    pub async fn drain_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<u64> {
        self.finish_sourcing().await?;
        match &mut self.state {
            State::Empty | State::Closed => Ok(0),
            State::Replaying(file) => {
                file.sync_all().await.ok();
                let mut file = file.try_clone().await?;
                use tokio::io::AsyncSeekExt;
                file.seek(std::io::SeekFrom::Start(0)).await?;
                tokio::io::copy(&mut file, writer).await
            }
            State::Sourcing(_) => unreachable!("finish_sourcing transitions out of Sourcing"),
        }
    }

    async fn finish_sourcing(&mut self) -> io::Result<()> {
        if let State::Sourcing(src) = &mut self.state {
            let mut buf = [0u8; 8192];
            while src.read_n < self.content_length {
                let remaining = (self.content_length - src.read_n) as usize;
                let want = buf.len().min(remaining);
                let n = src.origin.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "origin closed before declared content length was read",
                    ));
                }
                src.spill_writer.write_all(&buf[..n]).await?;
                src.read_n += n as u64;
            }
            self.enter_replaying().await?;
        }
        Ok(())
    }

    async fn enter_replaying(&mut self) -> io::Result<()> {
        if let State::Sourcing(src) = &mut self.state {
            src.spill_writer.flush().await?;
        }
        let path = self
            .spill_path
            .as_ref()
            .expect("spill_path set whenever state is Sourcing");
        let mut replay = File::open(path).await?;
        use tokio::io::AsyncSeekExt;
        replay.seek(std::io::SeekFrom::Start(0)).await?;
        self.state = State::Replaying(replay);
        Ok(())
    }

    /// Deletes the spill file, if any. Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.state, State::Closed) {
            return;
        }
        self.state = State::Closed;
        if let Some(path) = self.spill_path.take() {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if let Some(path) = self.spill_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn reads_exact_declared_length_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello world".to_vec();
        let origin: Box<dyn AsyncRead + Unpin + Send> = Box::new(std::io::Cursor::new(data.clone()));
        let mut body = Body::from_origin(origin, data.len() as u64, dir.path()).await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = body.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);

        // end-of-stream reported again.
        let n = body.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn drain_after_full_read_replays_full_content() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"replay me please".to_vec();
        let origin: Box<dyn AsyncRead + Unpin + Send> = Box::new(std::io::Cursor::new(data.clone()));
        let mut body = Body::from_origin(origin, data.len() as u64, dir.path()).await.unwrap();

        let mut sink = Vec::new();
        let mut buf = [0u8; 3];
        while body.read(&mut buf).await.unwrap() > 0 {
            // forwarded elsewhere, discarded here
        }

        let mut drained = Vec::new();
        body.drain_to(&mut drained).await.unwrap();
        assert_eq!(drained, data);
        let _ = sink.write_all(b"").await;
    }

    #[tokio::test]
    async fn zero_length_body_is_immediately_done() {
        let mut body = Body::empty();
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).await.unwrap(), 0);
        let mut out = Vec::new();
        assert_eq!(body.drain_to(&mut out).await.unwrap(), 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn short_origin_read_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let origin: Box<dyn AsyncRead + Unpin + Send> = Box::new(std::io::Cursor::new(b"ab".to_vec()));
        let mut body = Body::from_origin(origin, 10, dir.path()).await.unwrap();
        let mut buf = [0u8; 16];
        // first read succeeds (2 bytes available)
        let n = body.read(&mut buf).await.unwrap();
        assert_eq!(n, 2);
        // next read hits EOF before content length is satisfied.
        let err = body.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_removes_spill_file() {
        let dir = tempfile::tempdir().unwrap();
        let origin: Box<dyn AsyncRead + Unpin + Send> = Box::new(std::io::Cursor::new(b"xyz".to_vec()));
        let mut body = Body::from_origin(origin, 3, dir.path()).await.unwrap();
        let path = body.spill_path.clone().unwrap();
        body.close().await;
        body.close().await; // no-op
        assert!(!path.exists());
    }
}
