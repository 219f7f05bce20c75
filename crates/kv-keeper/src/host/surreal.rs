//! `SurrealKV`-backed transactional host.
//!
//! Persists databases in one embedded `SurrealKV` tree. Key layout:
//!
//! | Key | Value |
//! |-----|-------|
//! | `v\0{database}` | schema version, big-endian `u32` |
//! | `c\0{database}\0{collection}` | key path of the collection |
//! | `r\0{database}\0{collection}\0{key}` | record value (UTF-8) |
//!
//! Database and collection names never contain NUL, so every range scan is
//! bounded by replacing the trailing `\0` with `\x01`.
//!
//! Schema metadata (versions and collections) is cached per database on
//! first open and written back on background tasks; [`SurrealRecordHost::flush`]
//! waits for those writes. Every record request runs in its own `SurrealKV`
//! transaction.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::HostError;
use super::memory::SnapshotCursor;
use super::record::{
    CursorRequest, OpenEvent, OpenRequest, Record, RecordCollection, RecordConnection,
    RecordFactory, RecordTransaction, Request, TransactionMode, VersionChange,
    VersionChangeHandler, cursor_request, open_request, request,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn map_kv_err(e: &surrealkv::Error) -> HostError {
    HostError::new("UnknownError", e.to_string())
}

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

fn key_of(parts: &[&[u8]]) -> Vec<u8> {
    let capacity = parts
        .iter()
        .map(|p| p.len())
        .fold(parts.len(), usize::saturating_add);
    let mut buf = Vec::with_capacity(capacity);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(part);
    }
    buf
}

fn version_key(database: &str) -> Vec<u8> {
    key_of(&[b"v", database.as_bytes()])
}

fn collection_key(database: &str, collection: &str) -> Vec<u8> {
    key_of(&[b"c", database.as_bytes(), collection.as_bytes()])
}

/// `c\0{database}\0`: prefix of every collection entry of `database`.
fn collections_prefix(database: &str) -> Vec<u8> {
    key_of(&[b"c", database.as_bytes(), b""])
}

/// `r\0{database}\0{collection}\0`: prefix of every record of a collection.
fn records_prefix(database: &str, collection: &str) -> Vec<u8> {
    key_of(&[b"r", database.as_bytes(), collection.as_bytes(), b""])
}

/// Exclusive end of the range of keys starting with `prefix`, which must end
/// in the `\0` separator.
fn range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    if let Some(last) = end.last_mut() {
        *last = 1;
    }
    end
}

fn decode_version(raw: &[u8]) -> Result<u32, HostError> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| HostError::new("DataError", "stored schema version is corrupt"))?;
    Ok(u32::from_be_bytes(bytes))
}

fn decode_value(raw: Vec<u8>) -> Result<String, HostError> {
    String::from_utf8(raw).map_err(|e| HostError::new("DataError", e.to_string()))
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DatabaseMeta {
    version: u32,
    collections: BTreeSet<String>,
    connections: Vec<Weak<SurrealConnection>>,
}

struct HostInner {
    tree: surrealkv::Tree,
    databases: Mutex<HashMap<String, DatabaseMeta>>,
    writes: Mutex<Vec<JoinHandle<()>>>,
}

impl HostInner {
    /// Keys in `[prefix, range_end(prefix))`, in order.
    fn scan(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, HostError> {
        let start = prefix.to_vec();
        let end = range_end(prefix);
        let tx = self
            .tree
            .begin_with_mode(surrealkv::Mode::ReadOnly)
            .map_err(|ref e| map_kv_err(e))?;
        let mut iter = tx.range(&start, &end).map_err(|ref e| map_kv_err(e))?;
        iter.seek_first().map_err(|ref e| map_kv_err(e))?;
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next().map_err(|ref e| map_kv_err(e))?;
        }
        Ok(keys)
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, HostError> {
        let key = key.to_vec();
        let tx = self
            .tree
            .begin_with_mode(surrealkv::Mode::ReadOnly)
            .map_err(|ref e| map_kv_err(e))?;
        tx.get(&key).map_err(|ref e| map_kv_err(e))
    }

    /// Load the stored schema of `database` into the cache, if not cached.
    /// Returns the cached version.
    fn load(&self, database: &str) -> Result<u32, HostError> {
        if let Some(meta) = lock(&self.databases).get(database) {
            return Ok(meta.version);
        }

        let version = match self.read(&version_key(database))? {
            Some(raw) => decode_version(&raw)?,
            None => 0,
        };
        let prefix = collections_prefix(database);
        let collections = self
            .scan(&prefix)?
            .iter()
            .filter_map(|k| k.get(prefix.len()..))
            .filter_map(|suffix| std::str::from_utf8(suffix).ok())
            .map(str::to_owned)
            .collect();

        debug!(database, version, "loaded schema");
        let mut databases = lock(&self.databases);
        let meta = databases.entry(database.to_owned()).or_insert(DatabaseMeta {
            version,
            collections,
            connections: Vec::new(),
        });
        Ok(meta.version)
    }

    fn open_connections(&self, database: &str) -> Vec<Arc<SurrealConnection>> {
        let mut databases = lock(&self.databases);
        let Some(meta) = databases.get_mut(database) else {
            return Vec::new();
        };
        meta.connections
            .retain(|weak| weak.upgrade().is_some_and(|conn| !conn.is_closed()));
        meta.connections.iter().filter_map(Weak::upgrade).collect()
    }

    /// Apply `op` in its own read-write transaction.
    async fn apply(&self, op: WriteOp) -> Result<(), HostError> {
        let mut tx = self.tree.begin().map_err(|ref e| map_kv_err(e))?;
        match op {
            WriteOp::Set(key, value) => tx.set(&key, &value).map_err(|ref e| map_kv_err(e))?,
            WriteOp::Delete(key) => tx.delete(&key).map_err(|ref e| map_kv_err(e))?,
            WriteOp::DeletePrefix(prefix) => {
                let end = range_end(&prefix);
                // Collect first; the iterator borrows tx.
                let keys = {
                    let mut iter = tx.range(&prefix, &end).map_err(|ref e| map_kv_err(e))?;
                    iter.seek_first().map_err(|ref e| map_kv_err(e))?;
                    let mut keys = Vec::new();
                    while iter.valid() {
                        keys.push(iter.key());
                        iter.next().map_err(|ref e| map_kv_err(e))?;
                    }
                    keys
                };
                for key in &keys {
                    tx.delete(key).map_err(|ref e| map_kv_err(e))?;
                }
            },
        }
        tx.commit().await.map_err(|ref e| map_kv_err(e))
    }

    /// Write schema metadata on a background task, tracked for
    /// [`SurrealRecordHost::flush`].
    fn persist(self: &Arc<Self>, key: Vec<u8>, value: Vec<u8>) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = inner.apply(WriteOp::Set(key, value)).await {
                error!(error = %e, "failed to persist schema metadata");
            }
        });
        lock(&self.writes).push(handle);
    }
}

enum WriteOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    /// Delete every key starting with the given `\0`-terminated prefix.
    DeletePrefix(Vec<u8>),
}

/// Transactional host store persisted in a `SurrealKV` tree.
///
/// Cloning yields another handle to the same tree.
///
/// # Example
///
/// ```rust,ignore
/// use kv_keeper::host::SurrealRecordHost;
///
/// let host = SurrealRecordHost::open("./data/kv")?;
/// let env = HostEnvironment::new().with_record_factory(Arc::new(host));
/// ```
#[derive(Clone)]
pub struct SurrealRecordHost {
    inner: Arc<HostInner>,
}

impl fmt::Debug for SurrealRecordHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurrealRecordHost").finish_non_exhaustive()
    }
}

impl SurrealRecordHost {
    /// Open a persistent host at the given directory path.
    ///
    /// Creates the directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownError` [`HostError`] if the tree cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HostError> {
        let tree = surrealkv::TreeBuilder::new()
            .with_path(path.as_ref().to_path_buf())
            .build()
            .map_err(|ref e| map_kv_err(e))?;
        Ok(Self {
            inner: Arc::new(HostInner {
                tree,
                databases: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Wait for every pending schema write.
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.writes));
        for handle in pending {
            if let Err(e) = handle.await {
                error!(error = %e, "schema write task failed");
            }
        }
    }

    /// Flush pending schema writes and close the tree.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownError` [`HostError`] if the tree fails to close.
    pub async fn close(&self) -> Result<(), HostError> {
        self.flush().await;
        self.inner.tree.close().await.map_err(|ref e| map_kv_err(e))
    }
}

impl RecordFactory for SurrealRecordHost {
    fn open(&self, name: &str, version: u32) -> OpenRequest {
        let (responder, request) = open_request();
        if version == 0 {
            responder.emit(OpenEvent::Error(HostError::new(
                "TypeError",
                "version must be greater than zero",
            )));
            return request;
        }

        let current = match self.inner.load(name) {
            Ok(current) => current,
            Err(e) => {
                responder.emit(OpenEvent::Error(e));
                return request;
            },
        };
        if version < current {
            responder.emit(OpenEvent::Error(HostError::new(
                "VersionError",
                format!(
                    "requested version ({version}) is less than the existing version ({current})"
                ),
            )));
            return request;
        }

        let upgrading = version > current;
        if upgrading {
            for conn in self.inner.open_connections(name) {
                conn.notify(VersionChange {
                    old_version: conn.version,
                    new_version: Some(version),
                });
            }
            if !self.inner.open_connections(name).is_empty() {
                responder.emit(OpenEvent::Blocked);
                return request;
            }
        }

        let conn = Arc::new(SurrealConnection {
            host: Arc::clone(&self.inner),
            database: name.to_owned(),
            version,
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
        });
        if let Some(meta) = lock(&self.inner.databases).get_mut(name) {
            meta.version = version;
            meta.connections.push(Arc::downgrade(&conn));
        }

        if upgrading {
            debug!(database = name, from = current, to = version, "upgrading schema");
            self.inner
                .persist(version_key(name), version.to_be_bytes().to_vec());
            responder.emit(OpenEvent::UpgradeNeeded {
                connection: Arc::clone(&conn) as Arc<dyn RecordConnection>,
                old_version: current,
            });
        }
        responder.emit(OpenEvent::Success(conn));
        request
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct SurrealConnection {
    host: Arc<HostInner>,
    database: String,
    version: u32,
    closed: AtomicBool,
    handler: Mutex<Option<Arc<dyn Fn(VersionChange) + Send + Sync>>>,
}

impl SurrealConnection {
    fn notify(&self, change: VersionChange) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(change);
        }
    }
}

impl RecordConnection for SurrealConnection {
    fn version(&self) -> u32 {
        self.version
    }

    fn collection_names(&self) -> Vec<String> {
        lock(&self.host.databases)
            .get(&self.database)
            .map(|meta| meta.collections.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn create_collection(&self, name: &str, key_path: &str) -> Result<(), HostError> {
        if name.contains('\0') {
            return Err(HostError::new(
                "SyntaxError",
                "collection names must not contain NUL",
            ));
        }
        {
            let mut databases = lock(&self.host.databases);
            let meta = databases.entry(self.database.clone()).or_default();
            if !meta.collections.insert(name.to_owned()) {
                return Err(HostError::new(
                    "ConstraintError",
                    format!("collection '{name}' already exists"),
                ));
            }
        }
        self.host.persist(
            collection_key(&self.database, name),
            key_path.as_bytes().to_vec(),
        );
        Ok(())
    }

    fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn RecordTransaction>, HostError> {
        if self.is_closed() {
            return Err(HostError::new(
                "InvalidStateError",
                "the database connection is closing",
            ));
        }
        let known = self.collection_names();
        let mut scope = Vec::with_capacity(collections.len());
        for name in collections {
            if !known.iter().any(|k| k == name) {
                return Err(HostError::new(
                    "NotFoundError",
                    format!("collection '{name}' was not found"),
                ));
            }
            scope.push((*name).to_owned());
        }
        Ok(Box::new(SurrealTransaction {
            host: Arc::clone(&self.host),
            database: self.database.clone(),
            scope,
            mode,
        }))
    }

    fn set_version_change_handler(&self, handler: VersionChangeHandler) {
        *lock(&self.handler) = Some(Arc::from(handler));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct SurrealTransaction {
    host: Arc<HostInner>,
    database: String,
    scope: Vec<String>,
    mode: TransactionMode,
}

impl RecordTransaction for SurrealTransaction {
    fn object_collection(&self, name: &str) -> Result<Arc<dyn RecordCollection>, HostError> {
        if !self.scope.iter().any(|s| s == name) {
            return Err(HostError::new(
                "NotFoundError",
                format!("collection '{name}' is not in the transaction scope"),
            ));
        }
        Ok(Arc::new(SurrealCollection {
            host: Arc::clone(&self.host),
            prefix: records_prefix(&self.database, name),
            mode: self.mode,
        }))
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

struct SurrealCollection {
    host: Arc<HostInner>,
    prefix: Vec<u8>,
    mode: TransactionMode,
}

impl SurrealCollection {
    fn record_key(&self, key: &str) -> Vec<u8> {
        let mut buf = self.prefix.clone();
        buf.extend_from_slice(key.as_bytes());
        buf
    }

    fn writable(&self) -> Result<(), HostError> {
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::ReadOnly => Err(HostError::new(
                "ReadOnlyError",
                "the transaction is read-only",
            )),
        }
    }

    /// Run `op` on a background task; the request settles on commit.
    fn spawn_write(&self, op: WriteOp) -> Request<()> {
        if let Err(e) = self.writable() {
            return Request::ready(Err(e));
        }
        let (responder, request) = request();
        let host = Arc::clone(&self.host);
        tokio::spawn(async move {
            responder.complete(host.apply(op).await);
        });
        request
    }

    fn snapshot(&self) -> Result<VecDeque<Record>, HostError> {
        let mut records = VecDeque::new();
        for raw_key in self.host.scan(&self.prefix)? {
            let Some(value) = self.host.read(&raw_key)? else {
                continue;
            };
            let key = raw_key
                .get(self.prefix.len()..)
                .map(|suffix| String::from_utf8_lossy(suffix).into_owned())
                .unwrap_or_default();
            records.push_back(Record::new(key, decode_value(value)?));
        }
        Ok(records)
    }
}

impl RecordCollection for SurrealCollection {
    fn put(&self, record: Record) -> Request<()> {
        let key = self.record_key(&record.key);
        self.spawn_write(WriteOp::Set(key, record.value.into_bytes()))
    }

    fn get(&self, key: &str) -> Request<Option<Record>> {
        let found = self
            .host
            .read(&self.record_key(key))
            .and_then(|raw| raw.map(decode_value).transpose())
            .map(|value| value.map(|v| Record::new(key, v)));
        Request::ready(found)
    }

    fn delete(&self, key: &str) -> Request<()> {
        self.spawn_write(WriteOp::Delete(self.record_key(key)))
    }

    fn clear(&self) -> Request<()> {
        self.spawn_write(WriteOp::DeletePrefix(self.prefix.clone()))
    }

    fn count(&self) -> Request<u64> {
        let count = self
            .host
            .scan(&self.prefix)
            .map(|keys| u64::try_from(keys.len()).unwrap_or(u64::MAX));
        Request::ready(count)
    }

    fn open_cursor(&self) -> CursorRequest {
        let (responder, request) = cursor_request();
        match self.snapshot() {
            Ok(records) => SnapshotCursor::step(records, responder),
            Err(e) => responder.fail(e),
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::record::RequestEvent;

    fn make_host() -> (SurrealRecordHost, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let host = SurrealRecordHost::open(dir.path()).unwrap();
        (host, dir)
    }

    async fn open_ready(host: &SurrealRecordHost, version: u32) -> Arc<dyn RecordConnection> {
        let mut req = host.open("db", version);
        loop {
            match req.next_event().await {
                Some(OpenEvent::UpgradeNeeded { connection, .. }) => {
                    if !connection.collection_names().contains(&"items".to_owned()) {
                        connection.create_collection("items", "key").unwrap();
                    }
                },
                Some(OpenEvent::Success(conn)) => return conn,
                other => panic!("unexpected open event: {other:?}"),
            }
        }
    }

    fn items(conn: &Arc<dyn RecordConnection>, mode: TransactionMode) -> Arc<dyn RecordCollection> {
        conn.transaction(&["items"], mode)
            .unwrap()
            .object_collection("items")
            .unwrap()
    }

    async fn settle<T>(request: Request<T>) -> T {
        match request.await {
            Some(RequestEvent::Success(value)) => value,
            other => panic!("request did not succeed: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_range_end_bounds_prefix() {
        let prefix = records_prefix("db", "items");
        assert_eq!(prefix, b"r\0db\0items\0".to_vec());
        assert_eq!(range_end(&prefix), b"r\0db\0items\x01".to_vec());
    }

    #[tokio::test]
    async fn test_put_get_count_delete() {
        let (host, _dir) = make_host();
        let conn = open_ready(&host, 1).await;
        let rw = items(&conn, TransactionMode::ReadWrite);

        settle(rw.put(Record::new("foo", "bar"))).await;
        settle(rw.put(Record::new("baz", ""))).await;

        let ro = items(&conn, TransactionMode::ReadOnly);
        let found = settle(ro.get("foo")).await.unwrap();
        assert_eq!(found.value, "bar");
        assert_eq!(settle(ro.count()).await, 2);

        settle(rw.delete("foo")).await;
        assert!(settle(ro.get("foo")).await.is_none());

        settle(rw.clear()).await;
        assert_eq!(settle(ro.count()).await, 0);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let (host, _dir) = make_host();
        let conn = open_ready(&host, 1).await;
        let ro = items(&conn, TransactionMode::ReadOnly);
        match ro.put(Record::new("k", "v")).await {
            Some(RequestEvent::Error(e)) => assert_eq!(e.name, "ReadOnlyError"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_cursor_walks_in_key_order() {
        let (host, _dir) = make_host();
        let conn = open_ready(&host, 1).await;
        let rw = items(&conn, TransactionMode::ReadWrite);
        settle(rw.put(Record::new("b", "2"))).await;
        settle(rw.put(Record::new("a", "1"))).await;

        let mut cursor = items(&conn, TransactionMode::ReadOnly).open_cursor();
        let mut keys = Vec::new();
        while let Some(RequestEvent::Success(Some(step))) = cursor.next_step().await {
            keys.push(step.key().to_owned());
            step.advance();
        }
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_schema_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let host = SurrealRecordHost::open(dir.path()).unwrap();
            let conn = open_ready(&host, 1).await;
            settle(items(&conn, TransactionMode::ReadWrite).put(Record::new("k", "v"))).await;
            conn.close();
            host.close().await.unwrap();
        }

        let host = SurrealRecordHost::open(dir.path()).unwrap();
        let mut req = host.open("db", 1);
        let conn = match req.next_event().await {
            Some(OpenEvent::Success(conn)) => conn,
            other => panic!("expected success without upgrade, got {other:?}"),
        };
        assert_eq!(conn.collection_names(), vec!["items"]);
        let found = settle(items(&conn, TransactionMode::ReadOnly).get("k")).await;
        assert_eq!(found.unwrap().value, "v");
    }

    #[tokio::test]
    async fn test_lower_version_is_rejected() {
        let (host, _dir) = make_host();
        let conn = open_ready(&host, 2).await;
        conn.close();
        let mut req = host.open("db", 1);
        match req.next_event().await {
            Some(OpenEvent::Error(e)) => assert_eq!(e.name, "VersionError"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
