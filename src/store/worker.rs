//! Single-writer job queue fronting the SQLite connection, grounded on
//! `original_source/proxy/work/work.go`'s `WorkerPool`. SQLite's WAL mode
//! tolerates many readers but one writer; rather than serialize through
//! connection-level locking, every access — read or write — is funneled
//! through one dedicated OS thread that owns the only `Connection`.

use std::sync::mpsc as std_mpsc;
use std::thread;

use rusqlite::Connection;

use crate::error::StoreError;

type Job = Box<dyn FnOnce(&Connection) + Send + 'static>;

pub struct Worker {
    tx: std_mpsc::Sender<Job>,
}

impl Worker {
    /// Spawns the worker thread and opens the connection on it, so the
    /// `rusqlite::Connection` (not `Send`-shareable in any useful way
    /// across a pool) never leaves the thread that owns it.
    pub fn spawn<F>(open: F) -> Result<Self, StoreError>
    where
        F: FnOnce() -> Result<Connection, StoreError> + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), StoreError>>();

        thread::Builder::new()
            .name("devproxy-store".into())
            .spawn(move || {
                let conn = match open() {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                for job in rx {
                    job(&conn);
                }
            })
            .map_err(StoreError::Io)?;

        ready_rx.recv().map_err(|_| StoreError::WorkerGone)??;
        Ok(Self { tx })
    }

    /// Runs `f` against the connection on the worker thread and returns
    /// its result. Callers never see the connection directly.
    pub async fn run<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = reply_tx.send(f(conn));
        });
        self.tx.send(job).map_err(|_| StoreError::WorkerGone)?;
        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }
}
