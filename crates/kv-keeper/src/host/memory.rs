//! In-memory transactional host.
//!
//! Behaves like a browser's indexed record store closely enough to drive every
//! path of the transactional adapter: versioned databases, upgrade-needed on a
//! version bump, version-change notifications to older connections, `Blocked`
//! when one of them stays open, and read-only transaction enforcement.
//! Requests complete immediately; cursor steps are produced one at a time as
//! the consumer advances.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::HostError;
use super::record::{
    CursorRequest, CursorResponder, OpenEvent, OpenRequest, Record, RecordCollection,
    RecordConnection, RecordCursor, RecordFactory, RecordTransaction, Request, TransactionMode,
    VersionChange, VersionChangeHandler, cursor_request, open_request,
};

type Rows = Arc<Mutex<BTreeMap<String, String>>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct DatabaseState {
    version: u32,
    collections: HashMap<String, Rows>,
    connections: Vec<Weak<MemoryConnection>>,
}

#[derive(Default)]
struct MemoryDatabase {
    state: Mutex<DatabaseState>,
}

impl MemoryDatabase {
    fn open_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut state = lock(&self.state);
        state.connections.retain(|weak| {
            weak.upgrade().is_some_and(|conn| !conn.is_closed())
        });
        state.connections.iter().filter_map(Weak::upgrade).collect()
    }

    fn rows(&self, name: &str) -> Option<Rows> {
        lock(&self.state).collections.get(name).cloned()
    }
}

/// In-memory transactional host store.
///
/// Cloning yields another handle to the same databases.
#[derive(Clone, Default)]
pub struct MemoryRecordHost {
    databases: Arc<Mutex<HashMap<String, Arc<MemoryDatabase>>>>,
}

impl fmt::Debug for MemoryRecordHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = lock(&self.databases).keys().cloned().collect();
        f.debug_struct("MemoryRecordHost")
            .field("databases", &names)
            .finish()
    }
}

impl MemoryRecordHost {
    /// Create a host with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        lock(&self.databases).get(name).cloned()
    }

    /// Stored schema version of database `name`.
    #[must_use]
    pub fn database_version(&self, name: &str) -> Option<u32> {
        self.database(name).map(|db| lock(&db.state).version)
    }

    /// Number of records in `collection` of database `name`.
    #[must_use]
    pub fn record_count(&self, name: &str, collection: &str) -> Option<usize> {
        let rows = self.database(name)?.rows(collection)?;
        let count = lock(&rows).len();
        Some(count)
    }

    /// Number of connections to `name` that are still open.
    #[must_use]
    pub fn open_connection_count(&self, name: &str) -> usize {
        self.database(name)
            .map_or(0, |db| db.open_connections().len())
    }

    /// Delete database `name`, notifying open connections first.
    ///
    /// # Errors
    ///
    /// Returns `Blocked`-style [`HostError`] if a connection stays open after
    /// the notification.
    pub fn delete_database(&self, name: &str) -> Result<(), HostError> {
        let Some(db) = self.database(name) else {
            return Ok(());
        };
        for conn in db.open_connections() {
            conn.notify(VersionChange {
                old_version: conn.version,
                new_version: None,
            });
        }
        if !db.open_connections().is_empty() {
            return Err(HostError::new(
                "BlockedError",
                format!("database '{name}' still has open connections"),
            ));
        }
        lock(&self.databases).remove(name);
        Ok(())
    }
}

impl RecordFactory for MemoryRecordHost {
    fn open(&self, name: &str, version: u32) -> OpenRequest {
        let (responder, request) = open_request();
        if version == 0 {
            responder.emit(OpenEvent::Error(HostError::new(
                "TypeError",
                "version must be greater than zero",
            )));
            return request;
        }

        let db = Arc::clone(
            lock(&self.databases)
                .entry(name.to_owned())
                .or_default(),
        );
        let current = lock(&db.state).version;

        if version < current {
            responder.emit(OpenEvent::Error(HostError::new(
                "VersionError",
                format!("requested version ({version}) is less than the existing version ({current})"),
            )));
            return request;
        }

        let upgrading = version > current;
        if upgrading {
            // Handlers run without any host lock held; they may close the
            // connection they are notified on.
            for conn in db.open_connections() {
                conn.notify(VersionChange {
                    old_version: conn.version,
                    new_version: Some(version),
                });
            }
            if !db.open_connections().is_empty() {
                responder.emit(OpenEvent::Blocked);
                return request;
            }
        }

        let conn = Arc::new(MemoryConnection {
            database: Arc::clone(&db),
            version,
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
        });
        {
            let mut state = lock(&db.state);
            state.version = version;
            state.connections.push(Arc::downgrade(&conn));
        }

        if upgrading {
            responder.emit(OpenEvent::UpgradeNeeded {
                connection: Arc::clone(&conn) as Arc<dyn RecordConnection>,
                old_version: current,
            });
        }
        responder.emit(OpenEvent::Success(conn));
        request
    }
}

struct MemoryConnection {
    database: Arc<MemoryDatabase>,
    version: u32,
    closed: AtomicBool,
    handler: Mutex<Option<Arc<dyn Fn(VersionChange) + Send + Sync>>>,
}

impl MemoryConnection {
    fn notify(&self, change: VersionChange) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(change);
        }
    }
}

impl RecordConnection for MemoryConnection {
    fn version(&self) -> u32 {
        self.version
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.database.state)
            .collections
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn create_collection(&self, name: &str, key_path: &str) -> Result<(), HostError> {
        if key_path != "key" {
            return Err(HostError::new(
                "NotSupportedError",
                format!("in-memory collections are keyed by 'key', not '{key_path}'"),
            ));
        }
        let mut state = lock(&self.database.state);
        if state.collections.contains_key(name) {
            return Err(HostError::new(
                "ConstraintError",
                format!("collection '{name}' already exists"),
            ));
        }
        state.collections.insert(name.to_owned(), Rows::default());
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
        let state = lock(&self.database.state);
        let mut scope = HashMap::with_capacity(collections.len());
        for name in collections {
            let rows = state.collections.get(*name).ok_or_else(|| {
                HostError::new(
                    "NotFoundError",
                    format!("collection '{name}' was not found"),
                )
            })?;
            scope.insert((*name).to_owned(), Arc::clone(rows));
        }
        Ok(Box::new(MemoryTransaction { scope, mode }))
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

struct MemoryTransaction {
    scope: HashMap<String, Rows>,
    mode: TransactionMode,
}

impl RecordTransaction for MemoryTransaction {
    fn object_collection(&self, name: &str) -> Result<Arc<dyn RecordCollection>, HostError> {
        let rows = self.scope.get(name).ok_or_else(|| {
            HostError::new(
                "NotFoundError",
                format!("collection '{name}' is not in the transaction scope"),
            )
        })?;
        Ok(Arc::new(MemoryCollection {
            rows: Arc::clone(rows),
            mode: self.mode,
        }))
    }
}

struct MemoryCollection {
    rows: Rows,
    mode: TransactionMode,
}

impl MemoryCollection {
    fn writable(&self) -> Result<(), HostError> {
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::ReadOnly => Err(HostError::new(
                "ReadOnlyError",
                "the transaction is read-only",
            )),
        }
    }
}

impl RecordCollection for MemoryCollection {
    fn put(&self, record: Record) -> Request<()> {
        Request::ready(self.writable().map(|()| {
            lock(&self.rows).insert(record.key, record.value);
        }))
    }

    fn get(&self, key: &str) -> Request<Option<Record>> {
        let found = lock(&self.rows)
            .get(key)
            .map(|value| Record::new(key, value.clone()));
        Request::ready(Ok(found))
    }

    fn delete(&self, key: &str) -> Request<()> {
        Request::ready(self.writable().map(|()| {
            lock(&self.rows).remove(key);
        }))
    }

    fn clear(&self) -> Request<()> {
        Request::ready(self.writable().map(|()| lock(&self.rows).clear()))
    }

    fn count(&self) -> Request<u64> {
        let count = lock(&self.rows).len();
        Request::ready(Ok(u64::try_from(count).unwrap_or(u64::MAX)))
    }

    fn open_cursor(&self) -> CursorRequest {
        let (responder, request) = cursor_request();
        let entries: VecDeque<Record> = lock(&self.rows)
            .iter()
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
            .collect();
        SnapshotCursor::step(entries, responder);
        request
    }
}

/// Cursor over a snapshot of records taken when the cursor was opened.
pub(super) struct SnapshotCursor {
    current: Record,
    remaining: VecDeque<Record>,
    responder: CursorResponder,
}

impl SnapshotCursor {
    /// Emit the next step of the walk over `remaining` on `responder`.
    pub(super) fn step(mut remaining: VecDeque<Record>, responder: CursorResponder) {
        match remaining.pop_front() {
            Some(current) => {
                let next = responder.clone();
                next.yield_cursor(Box::new(Self {
                    current,
                    remaining,
                    responder,
                }));
            },
            None => responder.exhausted(),
        }
    }
}

impl RecordCursor for SnapshotCursor {
    fn key(&self) -> &str {
        &self.current.key
    }

    fn value(&self) -> &str {
        &self.current.value
    }

    fn advance(self: Box<Self>) {
        let Self {
            remaining,
            responder,
            ..
        } = *self;
        Self::step(remaining, responder);
    }
}
