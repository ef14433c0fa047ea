//! SQLite storage backend.
//!
//! One database file per namespace, `<root>/<namespace>.sqlite3`, with one
//! table per collection. Tables are created on first write through a
//! schema-upgrading reopen that bumps `PRAGMA user_version`.
//!
//! Only one transaction is ever open against a handle. Operations that find
//! the handle ready run directly under the state lock; anything that needs a
//! reopen claims the transaction slot, and operations arriving while the slot
//! is held wait in a FIFO queue until it is released.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::{decode_document, encode_document};
use crate::error::{Result, StorageError, StoreError};
use crate::types::entity_id;

use super::adapter::StorageAdapter;
use super::memory::not_found;

const FILE_SUFFIX: &str = "sqlite3";

// ============================================================================
// Helpers
// ============================================================================

fn quote(collection: &str) -> String {
    format!("\"{}\"", collection.replace('"', "\"\""))
}

/// Map a rusqlite error, normalizing a missing table to `CollectionNotFound`.
fn normalize(collection: &str, e: rusqlite::Error) -> StoreError {
    if e.to_string().contains("no such table") {
        StorageError::CollectionNotFound(collection.to_string()).into()
    } else {
        StorageError::Sqlite(e).into()
    }
}

/// What to do when the target collection does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Missing {
    Fail,
    Create,
}

enum Attempt<T> {
    Done(Result<T>),
    Reopen,
}

// ============================================================================
// Handle state
// ============================================================================

struct HandleState {
    conn: Option<Connection>,
    version: i64,
    collections: HashSet<String>,
    in_transaction: bool,
    queue: VecDeque<oneshot::Sender<()>>,
}

/// Releases the transaction slot and wakes every queued operation.
///
/// Dropped on success, on error and on cancellation alike.
struct TransactionSlot<'a> {
    state: &'a Mutex<HandleState>,
}

impl Drop for TransactionSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_transaction = false;
        for waiter in state.queue.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Counters for observing transaction serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionStats {
    pub completed: usize,
    /// Highest number of transactions ever open at once.
    pub peak_concurrent: usize,
}

#[derive(Default)]
struct Counters {
    open: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl Counters {
    fn enter(&self) -> OpenTransaction<'_> {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        OpenTransaction { counters: self }
    }
}

struct OpenTransaction<'a> {
    counters: &'a Counters,
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// SqliteAdapter
// ============================================================================

pub struct SqliteAdapter {
    namespace: String,
    path: PathBuf,
    state: Mutex<HandleState>,
    counters: Counters,
}

impl SqliteAdapter {
    /// The database file is not touched until the first operation.
    pub fn new(root: &Path, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let path = root.join(format!("{namespace}.{FILE_SUFFIX}"));
        Self {
            namespace,
            path,
            state: Mutex::new(HandleState {
                conn: None,
                version: 0,
                collections: HashSet::new(),
                in_transaction: false,
                queue: VecDeque::new(),
            }),
            counters: Counters::default(),
        }
    }

    pub fn is_supported(root: &Path) -> bool {
        std::fs::create_dir_all(root).is_ok() && Connection::open_in_memory().is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current `user_version` of the open handle (0 before first open).
    pub fn schema_version(&self) -> i64 {
        self.state.lock().version
    }

    pub fn transaction_stats(&self) -> TransactionStats {
        TransactionStats {
            completed: self.counters.completed.load(Ordering::SeqCst),
            peak_concurrent: self.counters.peak.load(Ordering::SeqCst),
        }
    }

    /// Run `op` inside one transaction on `collection`.
    async fn execute<T, F>(&self, collection: &str, missing: Missing, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send,
    {
        let mut op = Some(op);
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.in_transaction {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(tx);
                    rx
                } else {
                    match self.try_run(&mut state, collection, missing, &mut op) {
                        Attempt::Done(out) => return out,
                        Attempt::Reopen => {
                            state.in_transaction = true;
                            break;
                        }
                    }
                }
            };
            // A dropped sender only means the slot holder went away; retry either way.
            let _ = waiter.await;
        }

        let _slot = TransactionSlot { state: &self.state };
        let create = (missing == Missing::Create).then(|| collection.to_string());
        self.reopen(create).await?;

        let mut state = self.state.lock();
        match self.try_run(&mut state, collection, missing, &mut op) {
            Attempt::Done(out) => out,
            Attempt::Reopen => Err(StorageError::transaction(format!(
                "collection {collection} unavailable after reopen"
            ))
            .into()),
        }
    }

    fn try_run<T, F>(
        &self,
        state: &mut HandleState,
        collection: &str,
        missing: Missing,
        op: &mut Option<F>,
    ) -> Attempt<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let present = state.collections.contains(collection);
        let Some(conn) = state.conn.as_mut() else {
            return Attempt::Reopen;
        };
        if !present {
            return match missing {
                Missing::Create => Attempt::Reopen,
                Missing::Fail => Attempt::Done(Err(StorageError::CollectionNotFound(
                    collection.to_string(),
                )
                .into())),
            };
        }
        let Some(op) = op.take() else {
            return Attempt::Done(Err(StoreError::Internal(
                "storage operation already consumed".to_string(),
            )));
        };

        let _open = self.counters.enter();
        Attempt::Done(run_in_transaction(conn, collection, op))
    }

    /// Close and reopen the database, creating `create` at the next version.
    ///
    /// Caller must hold the transaction slot.
    async fn reopen(&self, create: Option<String>) -> Result<()> {
        let previous = self.state.lock().conn.take();
        drop(previous);

        let path = self.path.clone();
        let _open = self.counters.enter();
        let (conn, version, collections) =
            tokio::task::spawn_blocking(move || open_versioned(&path, create.as_deref()))
                .await
                .map_err(|e| StorageError::Transaction {
                    message: "schema upgrade task failed".to_string(),
                    source: Some(Box::new(e)),
                })??;

        let mut state = self.state.lock();
        if state.version < version {
            tracing::debug!(
                namespace = %self.namespace,
                from = state.version,
                to = version,
                "schema upgraded"
            );
        }
        state.conn = Some(conn);
        state.version = version;
        state.collections = collections;
        Ok(())
    }
}

fn run_in_transaction<T, F>(conn: &mut Connection, collection: &str, op: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction().map_err(|e| normalize(collection, e))?;
    let out = op(&tx)?;
    tx.commit().map_err(|e| normalize(collection, e))?;
    Ok(out)
}

fn open_versioned(path: &Path, create: Option<&str>) -> Result<(Connection, i64, HashSet<String>)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )?;

    let mut version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let mut collections = HashSet::new();
    {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in names {
            collections.insert(name?);
        }
    }

    if let Some(name) = create.filter(|name| !collections.contains(*name)) {
        version += 1;
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id  TEXT PRIMARY KEY NOT NULL,
                doc TEXT NOT NULL
             );
             PRAGMA user_version = {version};",
            quote(name)
        ))?;
        tx.commit()?;
        collections.insert(name.to_string());
    }
    Ok((conn, version, collections))
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn load(&self, collection: &str) -> Result<Vec<Value>> {
        self.execute(collection, Missing::Fail, |tx| {
            let sql = format!("SELECT id, doc FROM {} ORDER BY rowid", quote(collection));
            let mut stmt = tx.prepare(&sql).map_err(|e| normalize(collection, e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| normalize(collection, e))?;
            let mut docs = Vec::new();
            for row in rows {
                let (id, raw) = row.map_err(|e| normalize(collection, e))?;
                docs.push(decode_document(collection, &id, &raw)?);
            }
            Ok(docs)
        })
        .await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Value> {
        let found = self
            .execute(collection, Missing::Fail, |tx| {
                let sql = format!("SELECT doc FROM {} WHERE id = ?1", quote(collection));
                tx.query_row(&sql, params![id], |row| row.get::<_, String>(0))
                    .optional()
                    .map_err(|e| normalize(collection, e))
            })
            .await;
        match found {
            Ok(Some(raw)) => decode_document(collection, id, &raw),
            Ok(None) => Err(not_found(collection, id)),
            Err(StoreError::Storage(StorageError::CollectionNotFound(_))) => {
                Err(not_found(collection, id))
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut encoded = Vec::with_capacity(docs.len());
        for doc in &docs {
            let id = entity_id(doc).ok_or_else(|| StorageError::MissingId {
                collection: collection.to_string(),
            })?;
            encoded.push((id.to_string(), encode_document(doc)?));
        }

        self.execute(collection, Missing::Create, move |tx| {
            let sql = format!(
                "INSERT INTO {} (id, doc) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
                quote(collection)
            );
            let mut stmt = tx.prepare(&sql).map_err(|e| normalize(collection, e))?;
            for (id, raw) in &encoded {
                stmt.execute(params![id, raw])
                    .map_err(|e| normalize(collection, e))?;
            }
            Ok(())
        })
        .await?;
        Ok(docs)
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> Result<usize> {
        let removed = self
            .execute(collection, Missing::Fail, |tx| {
                let sql = format!("DELETE FROM {} WHERE id = ?1", quote(collection));
                tx.execute(&sql, params![id])
                    .map_err(|e| normalize(collection, e))
            })
            .await;
        match removed {
            Ok(0) => Err(not_found(collection, id)),
            Ok(n) => Ok(n),
            Err(StoreError::Storage(StorageError::CollectionNotFound(_))) => {
                Err(not_found(collection, id))
            }
            Err(e) => Err(e),
        }
    }

    async fn clear(&self) -> Result<()> {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.in_transaction {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(tx);
                    rx
                } else {
                    state.in_transaction = true;
                    state.conn = None;
                    state.version = 0;
                    state.collections.clear();
                    break;
                }
            };
            let _ = waiter.await;
        }
        let _slot = TransactionSlot { state: &self.state };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for suffix in ["", "-wal", "-shm"] {
                let mut target = path.clone().into_os_string();
                target.push(suffix);
                match std::fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Transaction {
            message: "clear task failed".to_string(),
            source: Some(Box::new(e)),
        })??;
        Ok(())
    }
}
