//! Storage Gateway
//!
//! Sole owner of the SQLite connection. Work is submitted as closures over a
//! FIFO queue and executed one at a time on a dedicated worker thread, so the
//! store never sees two transactions at once no matter how many tasks call in.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, Transaction};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::cache::codec::EncodedRow;
use crate::error::{CacheError, Result};
use crate::lifecycle::schema::{DELETE_ALL_SQL, DELETE_ENTRY_SQL, DELETE_TYPE_SQL, UPSERT_ENTRY_SQL};

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Command {
    Run(Job),
    Close(oneshot::Sender<Result<()>>),
}

// == Write Op ==
/// One logical write inside a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert the row, replacing any row with the same key
    Upsert(EncodedRow),
    /// Delete the row with this key if present
    Delete(String),
    /// Delete every row
    DeleteAll,
    /// Delete every row carrying this type tag
    DeleteType(String),
}

// == Storage Gateway ==
/// Serialized, transactional access to the single store handle.
#[derive(Debug)]
pub struct StorageGateway {
    /// Queue into the worker; `None` once `drain_and_close` has started
    sender: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Bumped once when a batch is submitted and again by the worker as it
    /// applies the batch
    write_generation: Arc<AtomicU64>,
    path: PathBuf,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Run(_) => f.write_str("Run"),
            Command::Close(_) => f.write_str("Close"),
        }
    }
}

impl StorageGateway {
    // == Open ==
    /// Opens (or creates) the store file and starts the worker thread.
    ///
    /// # Arguments
    /// * `path` - Location of the store file
    /// * `busy_timeout` - How long SQLite waits on a lock held by another handle
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Err(CacheError::InvalidRequest(format!(
                "store path {} is a directory",
                path.display()
            )));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(&path, flags)?;
        connection.busy_timeout(busy_timeout)?;
        let journal_mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Store journal mode: {}", journal_mode);
        connection.pragma_update(None, "synchronous", "NORMAL")?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name("blob-cache-store".to_string())
            .spawn(move || run_worker(connection, receiver))
            .map_err(|err| {
                CacheError::Internal(format!("failed to spawn store worker thread: {}", err))
            })?;

        info!("Opened store at {}", path.display());

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: std::sync::Mutex::new(Some(worker)),
            write_generation: Arc::new(AtomicU64::new(0)),
            path,
        })
    }

    /// Current write generation. Any change means a batch has been submitted
    /// or applied since the value was last read.
    pub fn write_generation(&self) -> u64 {
        self.write_generation.load(Ordering::Acquire)
    }

    /// Returns true once `drain_and_close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.sender.read().await.is_none()
    }

    // == Enqueue ==
    /// Runs `operation` inside a transaction on the worker.
    ///
    /// Resolves after the transaction commits. If the operation returns an
    /// error, or the commit fails, the transaction rolls back in full.
    /// Dropping the returned future does not cancel work already queued.
    pub async fn enqueue<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.with_connection(move |connection| {
            let tx = connection.transaction()?;
            match operation(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(err) => {
                    warn!("Rolling back store transaction: {}", err);
                    // Dropping the transaction rolls it back
                    drop(tx);
                    Err(err)
                }
            }
        })
        .await
    }

    /// Runs `operation` against the raw connection, outside any transaction.
    ///
    /// Needed for statements SQLite refuses inside a transaction (`VACUUM`,
    /// WAL checkpoints). Ordering is the same as for [`enqueue`](Self::enqueue).
    pub async fn with_connection<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |connection| {
            // The caller may have stopped waiting; the work still counts.
            let _ = reply.send(operation(connection));
        });

        {
            let guard = self.sender.read().await;
            let sender = guard.as_ref().ok_or(CacheError::CacheClosed)?;
            sender
                .send(Command::Run(job))
                .map_err(|_| CacheError::CacheClosed)?;
        }

        response.await.map_err(|_| CacheError::CacheClosed)?
    }

    /// Like [`enqueue`](Self::enqueue), but also returns the write generation
    /// read on the worker right before `operation` ran.
    ///
    /// Batches applied later always move the generation past that value, even
    /// when their callers stopped waiting.
    pub async fn enqueue_observed<T, F>(&self, operation: F) -> Result<(T, u64)>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        let generation = self.write_generation.clone();
        self.enqueue(move |tx| {
            let observed = generation.load(Ordering::Acquire);
            Ok((operation(tx)?, observed))
        })
        .await
    }

    // == Run Batch ==
    /// Applies every write in one transaction; all commit or none do.
    ///
    /// Returns the number of rows changed.
    pub async fn run_batch(&self, operations: Vec<WriteOp>) -> Result<usize> {
        if operations.is_empty() {
            return Ok(0);
        }

        let count = operations.len();
        let generation = self.write_generation.clone();
        generation.fetch_add(1, Ordering::AcqRel);
        let changed = self
            .enqueue(move |tx| {
                // Bumped on the worker so it happens even if the caller is gone
                generation.fetch_add(1, Ordering::AcqRel);
                apply_batch(tx, operations)
            })
            .await?;

        debug!("Committed batch of {} writes ({} rows changed)", count, changed);
        Ok(changed)
    }

    // == Drain And Close ==
    /// Rejects new work, waits for everything already queued, then releases
    /// the connection.
    ///
    /// Fails with `CacheClosed` if called a second time.
    pub async fn drain_and_close(&self) -> Result<()> {
        let sender = self
            .sender
            .write()
            .await
            .take()
            .ok_or(CacheError::CacheClosed)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Command::Close(reply))
            .map_err(|_| CacheError::Internal("store worker exited before close".to_string()))?;
        drop(sender);

        let closed = response
            .await
            .map_err(|_| CacheError::Internal("store worker exited before close".to_string()));

        let worker = self
            .worker
            .lock()
            .map_err(|_| CacheError::Internal("store worker handle poisoned".to_string()))?
            .take();
        if let Some(worker) = worker {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|err| CacheError::Internal(format!("failed to join store worker: {}", err)))?
                .map_err(|_| CacheError::Internal("store worker panicked".to_string()))?;
        }

        closed??;
        info!("Closed store at {}", self.path.display());
        Ok(())
    }
}

fn apply_batch(tx: &Transaction<'_>, operations: Vec<WriteOp>) -> Result<usize> {
    let mut upsert = tx.prepare_cached(UPSERT_ENTRY_SQL)?;
    let mut delete = tx.prepare_cached(DELETE_ENTRY_SQL)?;
    let mut changed = 0;
    for op in operations {
        changed += match op {
            WriteOp::Upsert(row) => upsert.execute(params![
                row.key,
                row.type_tag,
                row.payload,
                row.created_at,
                row.expires_at,
            ])?,
            WriteOp::Delete(key) => delete.execute(params![key])?,
            WriteOp::DeleteAll => tx.execute(DELETE_ALL_SQL, [])?,
            WriteOp::DeleteType(tag) => tx.execute(DELETE_TYPE_SQL, params![tag])?,
        };
    }
    Ok(changed)
}

// == Worker Loop ==
/// Executes queued commands strictly in submission order.
fn run_worker(mut connection: Connection, mut receiver: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = receiver.blocking_recv() {
        match command {
            Command::Run(job) => job(&mut connection),
            Command::Close(reply) => {
                let result = connection.close().map_err(|(_, err)| CacheError::from(err));
                let _ = reply.send(result);
                return;
            }
        }
    }
    warn!("Store queue dropped without close; releasing connection");
}
