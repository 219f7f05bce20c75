//! Asynchronous transactional host store.
//!
//! The host reports completion through events rather than return values:
//!
//! - opening a connection emits [`OpenEvent`]s (`UpgradeNeeded` then
//!   `Success`, or a single `Error`/`Blocked`)
//! - each collection request completes once with a [`RequestEvent`]
//! - a cursor request emits one [`RequestEvent`] per step; a step carrying
//!   `None` means the cursor is exhausted
//!
//! Hosts produce events through the responder half of [`request`],
//! [`open_request`], and [`cursor_request`]; adapters await the other half.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::HostError;

/// A stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub key: String,
    /// Stored value.
    pub value: String,
}

impl Record {
    /// Create a record.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// Terminal event of a host request.
#[derive(Debug)]
pub enum RequestEvent<T> {
    /// The request succeeded with a result.
    Success(T),
    /// The request failed.
    Error(HostError),
}

/// Awaitable half of a single host request.
///
/// Resolves to `None` if the host dropped the request without completing it.
#[derive(Debug)]
pub struct Request<T> {
    rx: oneshot::Receiver<RequestEvent<T>>,
}

/// Host half of a single request.
#[derive(Debug)]
pub struct Responder<T> {
    tx: oneshot::Sender<RequestEvent<T>>,
}

/// Create a linked responder/request pair.
#[must_use]
pub fn request<T>() -> (Responder<T>, Request<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, Request { rx })
}

impl<T> Responder<T> {
    /// Fire the success event.
    pub fn succeed(self, value: T) {
        // The adapter may have stopped waiting; nothing to deliver then.
        let _ = self.tx.send(RequestEvent::Success(value));
    }

    /// Fire the error event.
    pub fn fail(self, error: HostError) {
        let _ = self.tx.send(RequestEvent::Error(error));
    }

    /// Fire the event matching a host-side result.
    pub fn complete(self, result: Result<T, HostError>) {
        match result {
            Ok(value) => self.succeed(value),
            Err(error) => self.fail(error),
        }
    }
}

impl<T> Request<T> {
    /// A request that has already completed with `result`.
    #[must_use]
    pub fn ready(result: Result<T, HostError>) -> Self {
        let (responder, request) = request();
        responder.complete(result);
        request
    }
}

impl<T> Future for Request<T> {
    type Output = Option<RequestEvent<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// A positioned cursor over a collection.
pub trait RecordCursor: Send {
    /// Key of the record under the cursor.
    fn key(&self) -> &str;

    /// Value of the record under the cursor.
    fn value(&self) -> &str;

    /// Request the next step. The outcome arrives as the next event on the
    /// owning [`CursorRequest`].
    fn advance(self: Box<Self>);
}

impl fmt::Debug for dyn RecordCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCursor")
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

/// One step of a cursor walk: a positioned cursor, or `None` when exhausted.
pub type CursorStep = RequestEvent<Option<Box<dyn RecordCursor>>>;

/// Awaitable half of a cursor request.
#[derive(Debug)]
pub struct CursorRequest {
    rx: mpsc::UnboundedReceiver<CursorStep>,
}

/// Host half of a cursor request. Cloned into each cursor so that
/// `advance` can emit the next step.
#[derive(Debug, Clone)]
pub struct CursorResponder {
    tx: mpsc::UnboundedSender<CursorStep>,
}

/// Create a linked cursor responder/request pair.
#[must_use]
pub fn cursor_request() -> (CursorResponder, CursorRequest) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CursorResponder { tx }, CursorRequest { rx })
}

impl CursorResponder {
    /// Emit a positioned cursor.
    pub fn yield_cursor(&self, cursor: Box<dyn RecordCursor>) {
        let _ = self.tx.send(RequestEvent::Success(Some(cursor)));
    }

    /// Emit the exhausted signal.
    pub fn exhausted(&self) {
        let _ = self.tx.send(RequestEvent::Success(None));
    }

    /// Emit an error step.
    pub fn fail(&self, error: HostError) {
        let _ = self.tx.send(RequestEvent::Error(error));
    }
}

impl CursorRequest {
    /// Wait for the next step. `None` if the host dropped the request.
    pub async fn next_step(&mut self) -> Option<CursorStep> {
        self.rx.recv().await
    }
}

/// A version-change notification delivered to open connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    /// Version the notified connection has open.
    pub old_version: u32,
    /// Version being requested, or `None` if the database is being deleted.
    pub new_version: Option<u32>,
}

/// Callback invoked synchronously by the host on a version change.
pub type VersionChangeHandler = Box<dyn Fn(VersionChange) + Send + Sync>;

/// Events emitted while opening a connection.
pub enum OpenEvent {
    /// The stored schema is older than requested; the connection may create
    /// collections before `Success` fires.
    UpgradeNeeded {
        /// The connection being opened.
        connection: Arc<dyn RecordConnection>,
        /// Previously stored version (0 for a new database).
        old_version: u32,
    },
    /// The connection is open.
    Success(Arc<dyn RecordConnection>),
    /// Opening failed.
    Error(HostError),
    /// Other connections on an older version did not close.
    Blocked,
}

impl fmt::Debug for OpenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpgradeNeeded { old_version, .. } => f
                .debug_struct("UpgradeNeeded")
                .field("old_version", old_version)
                .finish_non_exhaustive(),
            Self::Success(_) => f.write_str("Success"),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Blocked => f.write_str("Blocked"),
        }
    }
}

/// Awaitable half of an open request.
#[derive(Debug)]
pub struct OpenRequest {
    rx: mpsc::UnboundedReceiver<OpenEvent>,
}

/// Host half of an open request.
#[derive(Debug, Clone)]
pub struct OpenResponder {
    tx: mpsc::UnboundedSender<OpenEvent>,
}

/// Create a linked open responder/request pair.
#[must_use]
pub fn open_request() -> (OpenResponder, OpenRequest) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OpenResponder { tx }, OpenRequest { rx })
}

impl OpenResponder {
    /// Emit an open event.
    pub fn emit(&self, event: OpenEvent) {
        let _ = self.tx.send(event);
    }
}

impl OpenRequest {
    /// Wait for the next open event. `None` once the host dropped the request.
    pub async fn next_event(&mut self) -> Option<OpenEvent> {
        self.rx.recv().await
    }
}

/// Entry point of a transactional host store.
pub trait RecordFactory: Send + Sync {
    /// Open database `name` at schema `version`.
    fn open(&self, name: &str, version: u32) -> OpenRequest;
}

/// An open database connection.
pub trait RecordConnection: Send + Sync {
    /// Schema version of this connection.
    fn version(&self) -> u32;

    /// Names of the collections in the schema.
    fn collection_names(&self) -> Vec<String>;

    /// Create a collection keyed by `key_path`. Only valid during an upgrade.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintError` if the collection already exists.
    fn create_collection(&self, name: &str, key_path: &str) -> Result<(), HostError>;

    /// Start a transaction over `collections`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateError` on a closed connection and `NotFoundError`
    /// for unknown collections.
    fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn RecordTransaction>, HostError>;

    /// Install the version-change handler, replacing any previous one.
    fn set_version_change_handler(&self, handler: VersionChangeHandler);

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

/// A transaction scope.
pub trait RecordTransaction: Send + Sync {
    /// Handle to one collection within the transaction.
    ///
    /// # Errors
    ///
    /// Returns `NotFoundError` if the collection is outside the scope.
    fn object_collection(&self, name: &str) -> Result<Arc<dyn RecordCollection>, HostError>;
}

/// Requests against one collection inside a transaction.
pub trait RecordCollection: Send + Sync {
    /// Insert or replace `record`.
    fn put(&self, record: Record) -> Request<()>;

    /// Fetch the record under `key`.
    fn get(&self, key: &str) -> Request<Option<Record>>;

    /// Delete the record under `key`.
    fn delete(&self, key: &str) -> Request<()>;

    /// Delete every record.
    fn clear(&self) -> Request<()>;

    /// Count every record.
    fn count(&self) -> Request<u64>;

    /// Open a cursor over every record.
    fn open_cursor(&self) -> CursorRequest;
}
