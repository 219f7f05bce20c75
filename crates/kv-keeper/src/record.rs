//! Transactional-store adapter.
//!
//! Drives a [`RecordFactory`] through the connection lifecycle
//!
//! ```text
//! Unopened ──init──▶ Opening ──success──▶ Ready ──close / version change──▶ Closed
//!                       └──error / blocked──────────────────────────────────▶ Closed
//! ```
//!
//! and maps the host's event-based completion onto [`KeeperResult`]s: every
//! CRUD call opens its own single-collection transaction, issues exactly one
//! request, and turns the request's terminal event into `Ok` or `Err`.
//!
//! Key enumeration walks a host cursor one step at a time. The walk is exposed
//! as a lazy [`KeyStream`]; [`KvStorage::get_keys`] collects it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::backend::KvStorage;
use crate::config::SCHEMA_VERSION;
use crate::error::{KeeperError, KeeperResult};
use crate::host::{
    CursorRequest, HostError, OpenEvent, Record, RecordCollection, RecordConnection, RecordCursor,
    RecordFactory, Request, RequestEvent, TransactionMode,
};

/// Field every record is keyed by.
pub const RECORD_KEY_PATH: &str = "key";

/// Lazy, finite, non-restartable sequence of stored keys.
pub type KeyStream = BoxStream<'static, KeeperResult<String>>;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// `init` has not been called.
    Unopened,
    /// The open request is in flight.
    Opening,
    /// The connection is open and serving requests.
    Ready,
    /// The connection was closed, or never opened successfully.
    Closed,
}

enum ConnectionState {
    Unopened,
    Opening,
    Ready(Arc<dyn RecordConnection>),
    Closed,
}

fn lock(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn aborted(what: &str) -> HostError {
    HostError::new("AbortError", format!("{what} ended without a result"))
}

/// Adapter over an asynchronous transactional host store.
pub struct RecordStorage {
    factory: Arc<dyn RecordFactory>,
    name: String,
    collection: String,
    state: Arc<Mutex<ConnectionState>>,
}

impl fmt::Debug for RecordStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStorage")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl RecordStorage {
    /// Create an unopened adapter for database `name`, storing records in
    /// `collection`.
    #[must_use]
    pub fn new(
        factory: Arc<dyn RecordFactory>,
        name: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            name: name.into(),
            collection: collection.into(),
            state: Arc::new(Mutex::new(ConnectionState::Unopened)),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        match &*lock(&self.state) {
            ConnectionState::Unopened => ConnectionStatus::Unopened,
            ConnectionState::Opening => ConnectionStatus::Opening,
            ConnectionState::Ready(conn) if conn.is_closed() => ConnectionStatus::Closed,
            ConnectionState::Ready(_) => ConnectionStatus::Ready,
            ConnectionState::Closed => ConnectionStatus::Closed,
        }
    }

    /// Whether the adapter can no longer serve requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    /// Create the record collection unless the schema already has it.
    ///
    /// Returns `true` if the collection was created.
    ///
    /// # Errors
    ///
    /// Returns the host error if the collection cannot be created.
    pub fn setup_schema(
        connection: &dyn RecordConnection,
        collection: &str,
    ) -> Result<bool, HostError> {
        if connection.collection_names().iter().any(|n| n == collection) {
            return Ok(false);
        }
        connection.create_collection(collection, RECORD_KEY_PATH)?;
        Ok(true)
    }

    /// Open the connection.
    ///
    /// Calling `init` on a ready adapter is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::ConnectionFailed`] if the host reports an error,
    /// [`KeeperError::ConnectionBlocked`] if another connection blocks the
    /// upgrade, and [`KeeperError::Closed`] if the adapter was closed.
    /// Returns [`KeeperError::Validation`] if another `init` on this adapter
    /// is still in flight.
    pub async fn init(&self) -> KeeperResult<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Unopened => *state = ConnectionState::Opening,
                ConnectionState::Ready(_) => return Ok(()),
                // The registry shares one pending init per type; this only
                // guards direct callers racing on the same adapter.
                ConnectionState::Opening => {
                    return Err(KeeperError::Validation(
                        "Storage is already being opened".into(),
                    ));
                },
                ConnectionState::Closed => return Err(KeeperError::Closed),
            }
        }

        let opened = self.open().await;

        let mut state = lock(&self.state);
        match opened {
            Ok(conn) => {
                if matches!(*state, ConnectionState::Closed) {
                    conn.close();
                    return Err(KeeperError::Closed);
                }
                self.watch_version_changes(&conn);
                info!(
                    name = %self.name,
                    version = conn.version(),
                    "transactional storage ready"
                );
                *state = ConnectionState::Ready(conn);
                Ok(())
            },
            Err(e) => {
                *state = ConnectionState::Closed;
                Err(e)
            },
        }
    }

    async fn open(&self) -> KeeperResult<Arc<dyn RecordConnection>> {
        let mut request = self.factory.open(&self.name, SCHEMA_VERSION);
        loop {
            match request.next_event().await {
                Some(OpenEvent::UpgradeNeeded {
                    connection,
                    old_version,
                }) => {
                    match Self::setup_schema(connection.as_ref(), &self.collection) {
                        Ok(created) => info!(
                            name = %self.name,
                            collection = %self.collection,
                            old_version,
                            created,
                            "schema upgrade"
                        ),
                        Err(e) => {
                            connection.close();
                            return Err(KeeperError::ConnectionFailed(e));
                        },
                    }
                },
                Some(OpenEvent::Success(conn)) => return Ok(conn),
                Some(OpenEvent::Error(e)) => {
                    debug!(name = %self.name, error = %e, "open failed");
                    return Err(KeeperError::ConnectionFailed(e));
                },
                Some(OpenEvent::Blocked) => {
                    warn!(name = %self.name, "open blocked by another connection");
                    return Err(KeeperError::ConnectionBlocked);
                },
                None => return Err(KeeperError::ConnectionFailed(aborted("open request"))),
            }
        }
    }

    /// Close the handle when another connection changes the schema version.
    /// No reconnect; the registry replaces closed adapters on next resolution.
    fn watch_version_changes(&self, conn: &Arc<dyn RecordConnection>) {
        let state = Arc::downgrade(&self.state);
        conn.set_version_change_handler(Box::new(move |change| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let previous = std::mem::replace(&mut *lock(&state), ConnectionState::Closed);
            if let ConnectionState::Ready(conn) = previous {
                warn!(
                    old_version = change.old_version,
                    new_version = ?change.new_version,
                    "schema version changed elsewhere, closing connection"
                );
                conn.close();
            }
        }));
    }

    /// Close the host connection, if open.
    pub(crate) fn close_connection(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Closed);
        if let ConnectionState::Ready(conn) = previous {
            conn.close();
            debug!(name = %self.name, "transactional storage closed");
        }
    }

    fn connection(&self) -> KeeperResult<Arc<dyn RecordConnection>> {
        match &*lock(&self.state) {
            ConnectionState::Ready(conn) if !conn.is_closed() => Ok(Arc::clone(conn)),
            _ => Err(KeeperError::Closed),
        }
    }

    fn collection(&self, mode: TransactionMode) -> KeeperResult<Arc<dyn RecordCollection>> {
        let conn = self.connection()?;
        conn.transaction(&[self.collection.as_str()], mode)
            .and_then(|tx| tx.object_collection(&self.collection))
            .map_err(|e| KeeperError::host_request("Unable to start transaction", e))
    }

    async fn settle<T: Send>(request: Request<T>, what: &str) -> KeeperResult<T> {
        match request.await {
            Some(RequestEvent::Success(value)) => Ok(value),
            Some(RequestEvent::Error(e)) => Err(KeeperError::host_request(what, e)),
            None => Err(KeeperError::host_request(what, aborted("request"))),
        }
    }

    /// Walk every stored key with a host cursor.
    ///
    /// The cursor is advanced only after the previous key has been yielded,
    /// so at most one host request is outstanding. Once exhausted, the
    /// stream keeps returning `None`.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::Closed`] if the connection is not open, or a
    /// [`KeeperError::HostRequest`] if the transaction cannot be started.
    /// Errors during the walk are yielded as the stream's final item.
    pub fn key_stream(&self) -> KeeperResult<KeyStream> {
        let request = self.collection(TransactionMode::ReadOnly)?.open_cursor();
        let walk = CursorWalk {
            request,
            pending: None,
            done: false,
        };
        Ok(stream::unfold(walk, CursorWalk::step).fuse().boxed())
    }
}

struct CursorWalk {
    request: CursorRequest,
    pending: Option<Box<dyn RecordCursor>>,
    done: bool,
}

impl CursorWalk {
    async fn step(mut self) -> Option<(KeeperResult<String>, Self)> {
        if self.done {
            return None;
        }
        if let Some(cursor) = self.pending.take() {
            cursor.advance();
        }
        match self.request.next_step().await {
            Some(RequestEvent::Success(Some(cursor))) => {
                let key = cursor.key().to_owned();
                self.pending = Some(cursor);
                Some((Ok(key), self))
            },
            Some(RequestEvent::Success(None)) => None,
            Some(RequestEvent::Error(e)) => {
                self.done = true;
                Some((
                    Err(KeeperError::host_request("Unable to iterate keys", e)),
                    self,
                ))
            },
            None => {
                self.done = true;
                Some((
                    Err(KeeperError::host_request(
                        "Unable to iterate keys",
                        aborted("cursor request"),
                    )),
                    self,
                ))
            },
        }
    }
}

#[async_trait]
impl KvStorage for RecordStorage {
    async fn set_item(&self, key: &str, value: &str) -> KeeperResult<()> {
        let request = self
            .collection(TransactionMode::ReadWrite)?
            .put(Record::new(key, value));
        Self::settle(request, "Unable to set item").await
    }

    async fn get_item(&self, key: &str) -> KeeperResult<Option<String>> {
        let request = self.collection(TransactionMode::ReadOnly)?.get(key);
        let record = Self::settle(request, "Unable to get item").await?;
        Ok(record.map(|r| r.value))
    }

    async fn has_item(&self, key: &str) -> KeeperResult<bool> {
        let request = self.collection(TransactionMode::ReadOnly)?.get(key);
        let record = Self::settle(request, "Unable to check item").await?;
        Ok(record.is_some())
    }

    async fn remove_item(&self, key: &str) -> KeeperResult<()> {
        let request = self.collection(TransactionMode::ReadWrite)?.delete(key);
        Self::settle(request, "Unable to remove item").await?;
        // Some hosts finalize deletion after the request completes.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn get_keys(&self) -> KeeperResult<Vec<String>> {
        self.key_stream()?.try_collect().await
    }

    async fn get_length(&self) -> KeeperResult<u64> {
        let request = self.collection(TransactionMode::ReadOnly)?.count();
        Self::settle(request, "Unable to count items").await
    }

    async fn clear(&self) -> KeeperResult<()> {
        let request = self.collection(TransactionMode::ReadWrite)?.clear();
        Self::settle(request, "Unable to clear storage").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryRecordHost;

    async fn ready_storage() -> (MemoryRecordHost, RecordStorage) {
        let host = MemoryRecordHost::new();
        let storage = RecordStorage::new(Arc::new(host.clone()), "db", "items");
        storage.init().await.unwrap();
        (host, storage)
    }

    #[tokio::test]
    async fn test_init_creates_collection() {
        let (host, storage) = ready_storage().await;
        assert_eq!(storage.status(), ConnectionStatus::Ready);
        assert_eq!(host.database_version("db"), Some(SCHEMA_VERSION));
        assert_eq!(host.record_count("db", "items"), Some(0));
    }

    #[tokio::test]
    async fn test_init_is_idempotent_when_ready() {
        let (_host, storage) = ready_storage().await;
        storage.init().await.unwrap();
        assert_eq!(storage.status(), ConnectionStatus::Ready);
    }

    #[tokio::test]
    async fn test_second_adapter_skips_existing_collection() {
        let (host, first) = ready_storage().await;
        first.set_item("foo", "bar").await.unwrap();
        let second = RecordStorage::new(Arc::new(host.clone()), "db", "items");
        second.init().await.unwrap();
        assert_eq!(second.get_item("foo").await.unwrap().as_deref(), Some("bar"));
    }

    #[tokio::test]
    async fn test_crud_scenario() {
        let (_host, storage) = ready_storage().await;

        storage.set_item("foo", "bar").await.unwrap();
        assert_eq!(storage.get_item("foo").await.unwrap().as_deref(), Some("bar"));
        assert!(storage.has_item("foo").await.unwrap());

        storage.remove_item("foo").await.unwrap();
        assert!(!storage.has_item("foo").await.unwrap());
        assert!(storage.get_item("foo").await.unwrap().is_none());
        storage.remove_item("foo").await.unwrap();

        storage.set_item("foo", "baz").await.unwrap();
        storage.set_item("bar", "qux").await.unwrap();
        let mut keys = storage.get_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["bar", "foo"]);
        assert_eq!(storage.get_length().await.unwrap(), 2);

        storage.clear().await.unwrap();
        assert_eq!(storage.get_length().await.unwrap(), 0);
        assert!(storage.get_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_stream_is_lazy_and_finite() {
        let (_host, storage) = ready_storage().await;
        for key in ["a", "b", "c"] {
            storage.set_item(key, "v").await.unwrap();
        }
        let mut keys = storage.key_stream().unwrap();
        assert_eq!(keys.next().await.unwrap().unwrap(), "a");
        assert_eq!(keys.next().await.unwrap().unwrap(), "b");
        assert_eq!(keys.next().await.unwrap().unwrap(), "c");
        assert!(keys.next().await.is_none());
        assert!(keys.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_operations() {
        let (host, storage) = ready_storage().await;
        storage.close_connection();
        assert!(storage.is_closed());
        assert_eq!(host.open_connection_count("db"), 0);
        assert!(matches!(
            storage.get_item("foo").await,
            Err(KeeperError::Closed)
        ));
        assert!(matches!(storage.init().await, Err(KeeperError::Closed)));
    }

    #[tokio::test]
    async fn test_version_change_closes_connection() {
        let (host, storage) = ready_storage().await;
        host.delete_database("db").unwrap();
        assert!(storage.is_closed());
        assert!(matches!(storage.get_keys().await, Err(KeeperError::Closed)));
    }

    #[tokio::test]
    async fn test_open_error_never_reaches_ready() {
        let host = MemoryRecordHost::new();
        let newer = RecordStorage::new(Arc::new(host.clone()), "db", "items");
        newer.init().await.unwrap();
        newer.close_connection();

        // Move the stored schema past the version this adapter requests.
        let mut bump = host.open("db", SCHEMA_VERSION.saturating_add(1));
        while let Some(event) = bump.next_event().await {
            if let OpenEvent::Success(conn) = event {
                conn.close();
                break;
            }
        }

        let storage = RecordStorage::new(Arc::new(host), "db", "items");
        match storage.init().await {
            Err(KeeperError::ConnectionFailed(e)) => assert_eq!(e.name, "VersionError"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(storage.is_closed());
    }

    #[tokio::test]
    async fn test_blocked_open_reports_distinct_error() {
        let host = MemoryRecordHost::new();
        // An old connection that ignores version changes.
        let mut old = host.open("db", 1);
        let mut held = None;
        while let Some(event) = old.next_event().await {
            if let OpenEvent::Success(conn) = event {
                held = Some(conn);
                break;
            }
        }
        assert!(held.is_some());

        let factory = Arc::new(host.clone());
        let mut upgrade = factory.open("db", 2);
        assert!(matches!(upgrade.next_event().await, Some(OpenEvent::Blocked)));

        struct Versioned(MemoryRecordHost);
        impl RecordFactory for Versioned {
            fn open(&self, name: &str, _version: u32) -> crate::host::OpenRequest {
                self.0.open(name, 2)
            }
        }
        let storage = RecordStorage::new(Arc::new(Versioned(host)), "db", "items");
        assert!(matches!(
            storage.init().await,
            Err(KeeperError::ConnectionBlocked)
        ));
        assert!(storage.is_closed());
    }

    #[tokio::test]
    async fn test_key_stream_ends_on_empty_collection() {
        let (_host, storage) = ready_storage().await;
        let mut keys = storage.key_stream().unwrap();
        assert!(keys.next().await.is_none());
        assert!(keys.next().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_item_completes_on_next_tick() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (_host, storage) = ready_storage().await;
        storage.set_item("foo", "bar").await.unwrap();

        // Queued behind the current task; runs only if remove_item yields.
        let ticked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ticked);
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        storage.remove_item("foo").await.unwrap();
        assert!(ticked.load(Ordering::SeqCst));
        assert!(!storage.has_item("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_init_on_same_adapter_rejected() {
        use futures::FutureExt;

        #[derive(Default)]
        struct Stalled(Mutex<Vec<crate::host::OpenResponder>>);
        impl RecordFactory for Stalled {
            fn open(&self, _name: &str, _version: u32) -> crate::host::OpenRequest {
                let (responder, request) = crate::host::open_request();
                self.0.lock().unwrap().push(responder);
                request
            }
        }

        let factory = Arc::new(Stalled::default());
        let storage = RecordStorage::new(
            Arc::clone(&factory) as Arc<dyn RecordFactory>,
            "db",
            "items",
        );

        let mut first = Box::pin(storage.init());
        assert!((&mut first).now_or_never().is_none());
        assert_eq!(storage.status(), ConnectionStatus::Opening);

        assert!(matches!(
            storage.init().await,
            Err(KeeperError::Validation(_))
        ));

        factory.0.lock().unwrap().clear();
        assert!(matches!(
            first.await,
            Err(KeeperError::ConnectionFailed(_))
        ));
        assert!(storage.is_closed());
    }
}
