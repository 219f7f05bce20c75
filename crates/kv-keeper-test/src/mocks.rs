//! Mock host stores and listeners for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kv_keeper::KeeperError;
use kv_keeper::host::{
    CursorRequest, FlatStore, HostError, MemoryFlatStore, MemoryRecordHost, OpenEvent,
    OpenRequest, OpenResponder, Record, RecordCollection, RecordConnection, RecordFactory,
    RecordTransaction, Request, TransactionMode, VersionChangeHandler, cursor_request,
    open_request,
};
use kv_keeper::hub::ErrorListener;
use tracing::debug;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Flat store
// ---------------------------------------------------------------------------

/// Flat store with injectable faults.
///
/// Backed by a [`MemoryFlatStore`]; reads always succeed.
#[derive(Debug, Default)]
pub struct MockFlatStore {
    inner: MemoryFlatStore,
    probe_error: Option<HostError>,
    write_error: Option<HostError>,
    writes: AtomicUsize,
}

impl MockFlatStore {
    /// Create a store without faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the access probe, so the host reports the store as unavailable.
    #[must_use]
    pub fn with_failing_probe(mut self) -> Self {
        self.probe_error = Some(HostError::new(
            "SecurityError",
            "access to storage is denied",
        ));
        self
    }

    /// Reject every write with a `QuotaExceededError`.
    #[must_use]
    pub fn with_failing_writes(mut self) -> Self {
        self.write_error = Some(HostError::new(
            "QuotaExceededError",
            "the quota has been exceeded",
        ));
        self
    }

    /// Number of attempted writes, failed ones included.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl FlatStore for MockFlatStore {
    fn set_item(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        match &self.write_error {
            Some(e) => Err(e.clone()),
            None => self.inner.set_item(key, value),
        }
    }

    fn get_item(&self, key: &str) -> Option<String> {
        self.inner.get_item(key)
    }

    fn remove_item(&self, key: &str) {
        self.inner.remove_item(key);
    }

    fn key(&self, index: usize) -> Option<String> {
        self.inner.key(index)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn probe(&self) -> Result<(), HostError> {
        self.probe_error.clone().map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Record host
// ---------------------------------------------------------------------------

/// Outcome of one scripted open.
#[derive(Debug, Clone)]
pub enum OpenScript {
    /// Fail with the given error event.
    Fail(HostError),
    /// Report the open as blocked.
    Block,
    /// Emit nothing until [`ScriptedRecordHost::release_stalled`].
    Stall,
}

/// Transactional host that plays scripted open outcomes before falling back
/// to a [`MemoryRecordHost`].
///
/// Each open consumes the next scripted outcome; once the script is empty,
/// opens reach the in-memory host. With [`with_failing_requests`], every
/// record request on a successfully opened connection fails.
///
/// [`with_failing_requests`]: ScriptedRecordHost::with_failing_requests
#[derive(Debug, Clone, Default)]
pub struct ScriptedRecordHost {
    inner: MemoryRecordHost,
    script: Arc<Mutex<VecDeque<OpenScript>>>,
    stalled: Arc<Mutex<Vec<OpenResponder>>>,
    request_error: Option<HostError>,
    opens: Arc<AtomicUsize>,
}

impl ScriptedRecordHost {
    /// Create a host with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted outcome.
    #[must_use]
    pub fn with_open(self, outcome: OpenScript) -> Self {
        lock(&self.script).push_back(outcome);
        self
    }

    /// Queue an open failure.
    #[must_use]
    pub fn with_open_failure(self, name: &str, message: &str) -> Self {
        self.with_open(OpenScript::Fail(HostError::new(name, message)))
    }

    /// Queue a blocked open.
    #[must_use]
    pub fn with_blocked_open(self) -> Self {
        self.with_open(OpenScript::Block)
    }

    /// Queue an open that emits nothing until released.
    #[must_use]
    pub fn with_stalled_open(self) -> Self {
        self.with_open(OpenScript::Stall)
    }

    /// Fail every record request with an `UnknownError`.
    #[must_use]
    pub fn with_failing_requests(mut self) -> Self {
        self.request_error = Some(HostError::new("UnknownError", "the disk is gone"));
        self
    }

    /// The in-memory host behind the script.
    #[must_use]
    pub fn memory(&self) -> &MemoryRecordHost {
        &self.inner
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of opens currently stalled.
    #[must_use]
    pub fn stalled_count(&self) -> usize {
        lock(&self.stalled).len()
    }

    /// Drop every stalled open, which aborts them.
    pub fn release_stalled(&self) {
        lock(&self.stalled).clear();
    }

    fn forward(&self, mut upstream: OpenRequest, error: HostError) -> OpenRequest {
        let (responder, request) = open_request();
        tokio::spawn(async move {
            while let Some(event) = upstream.next_event().await {
                let event = match event {
                    OpenEvent::UpgradeNeeded {
                        connection,
                        old_version,
                    } => OpenEvent::UpgradeNeeded {
                        connection: faulty(connection, &error),
                        old_version,
                    },
                    OpenEvent::Success(connection) => {
                        debug!(error = %error, "wrapping connection with failing requests");
                        OpenEvent::Success(faulty(connection, &error))
                    },
                    other => other,
                };
                responder.emit(event);
            }
        });
        request
    }
}

impl RecordFactory for ScriptedRecordHost {
    fn open(&self, name: &str, version: u32) -> OpenRequest {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.script).pop_front();
        debug!(name, version, ?scripted, "scripted open");
        match scripted {
            Some(OpenScript::Fail(e)) => {
                let (responder, request) = open_request();
                responder.emit(OpenEvent::Error(e));
                request
            },
            Some(OpenScript::Block) => {
                let (responder, request) = open_request();
                responder.emit(OpenEvent::Blocked);
                request
            },
            Some(OpenScript::Stall) => {
                let (responder, request) = open_request();
                lock(&self.stalled).push(responder);
                request
            },
            None => {
                let upstream = self.inner.open(name, version);
                match &self.request_error {
                    Some(e) => self.forward(upstream, e.clone()),
                    None => upstream,
                }
            },
        }
    }
}

fn faulty(inner: Arc<dyn RecordConnection>, error: &HostError) -> Arc<dyn RecordConnection> {
    Arc::new(FaultyConnection {
        inner,
        error: error.clone(),
    })
}

/// Connection whose collections fail every request.
struct FaultyConnection {
    inner: Arc<dyn RecordConnection>,
    error: HostError,
}

impl RecordConnection for FaultyConnection {
    fn version(&self) -> u32 {
        self.inner.version()
    }

    fn collection_names(&self) -> Vec<String> {
        self.inner.collection_names()
    }

    fn create_collection(&self, name: &str, key_path: &str) -> Result<(), HostError> {
        self.inner.create_collection(name, key_path)
    }

    fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn RecordTransaction>, HostError> {
        self.inner.transaction(collections, mode)?;
        Ok(Box::new(FaultyTransaction {
            error: self.error.clone(),
        }))
    }

    fn set_version_change_handler(&self, handler: VersionChangeHandler) {
        self.inner.set_version_change_handler(handler);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct FaultyTransaction {
    error: HostError,
}

impl RecordTransaction for FaultyTransaction {
    fn object_collection(&self, _name: &str) -> Result<Arc<dyn RecordCollection>, HostError> {
        Ok(Arc::new(FaultyCollection {
            error: self.error.clone(),
        }))
    }
}

struct FaultyCollection {
    error: HostError,
}

impl FaultyCollection {
    fn fail<T>(&self) -> Request<T> {
        Request::ready(Err(self.error.clone()))
    }
}

impl RecordCollection for FaultyCollection {
    fn put(&self, _record: Record) -> Request<()> {
        self.fail()
    }

    fn get(&self, _key: &str) -> Request<Option<Record>> {
        self.fail()
    }

    fn delete(&self, _key: &str) -> Request<()> {
        self.fail()
    }

    fn clear(&self) -> Request<()> {
        self.fail()
    }

    fn count(&self) -> Request<u64> {
        self.fail()
    }

    fn open_cursor(&self) -> CursorRequest {
        let (responder, request) = cursor_request();
        responder.fail(self.error.clone());
        request
    }
}

// ---------------------------------------------------------------------------
// Error listener
// ---------------------------------------------------------------------------

/// Records every error broadcast to its listener.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<KeeperError>>>,
}

impl ErrorLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener appending to this log. Each call returns a distinct
    /// listener.
    #[must_use]
    pub fn listener(&self) -> ErrorListener {
        let entries = Arc::clone(&self.entries);
        Arc::new(move |e: &KeeperError| lock(&entries).push(e.clone()))
    }

    /// Recorded errors, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<KeeperError> {
        lock(&self.entries).clone()
    }

    /// Display strings of the recorded errors.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        lock(&self.entries).iter().map(ToString::to_string).collect()
    }

    /// Number of recorded errors.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
