//! Error broadcast hub.
//!
//! Observers registered here see every error a facade operation returns, in
//! addition to the caller receiving it. The hub is an observability side
//! channel only: it never changes the result or retries anything.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{trace, warn};

use crate::error::{KeeperError, KeeperResult};

/// An error observer.
pub type ErrorListener = Arc<dyn Fn(&KeeperError) + Send + Sync>;

/// Ordered, duplicate-tolerant list of error observers.
///
/// Cloning yields another handle to the same list.
#[derive(Clone, Default)]
pub struct ErrorHub {
    listeners: Arc<Mutex<Vec<ErrorListener>>>,
}

impl fmt::Debug for ErrorHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHub")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ErrorHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_listeners<R>(&self, f: impl FnOnce(&mut Vec<ErrorListener>) -> R) -> R {
        let mut guard = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Register a listener. Registering the same listener twice makes it
    /// fire twice.
    pub fn add(&self, listener: ErrorListener) {
        self.with_listeners(|l| l.push(listener));
    }

    /// Remove the earliest registration of `listener`.
    ///
    /// Returns `true` if a registration was removed.
    pub fn remove(&self, listener: &ErrorListener) -> bool {
        self.with_listeners(|l| {
            let position = l.iter().position(|x| Arc::ptr_eq(x, listener));
            position.map(|i| l.remove(i)).is_some()
        })
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.with_listeners(Vec::clear);
    }

    /// Snapshot of the registered listeners, in registration order.
    #[must_use]
    pub fn listeners(&self) -> Vec<ErrorListener> {
        self.with_listeners(|l| l.clone())
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with_listeners(|l| l.len())
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener with `error`, in registration order.
    ///
    /// Listeners run on a snapshot, so they may add or remove listeners
    /// without affecting the current broadcast.
    pub fn notify(&self, error: &KeeperError) {
        let listeners = self.listeners();
        if listeners.is_empty() {
            trace!(error = %error, "operation failed, no error listeners");
            return;
        }
        warn!(error = %error, listeners = listeners.len(), "broadcasting storage error");
        for listener in &listeners {
            listener(error);
        }
    }

    /// Broadcast the error of `result`, if any, then hand `result` back.
    pub fn observe<T>(&self, result: KeeperResult<T>) -> KeeperResult<T> {
        if let Err(e) = &result {
            self.notify(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> ErrorListener {
        let log = Arc::clone(log);
        Arc::new(move |e: &KeeperError| {
            log.lock().unwrap().push(format!("{tag}:{e}"));
        })
    }

    #[test]
    fn test_notify_in_registration_order() {
        let hub = ErrorHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add(recorder(&log, "a"));
        hub.add(recorder(&log, "b"));

        hub.notify(&KeeperError::Closed);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("a:"));
        assert!(log[1].starts_with("b:"));
    }

    #[test]
    fn test_duplicates_fire_twice_and_remove_one() {
        let hub = ErrorHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = recorder(&log, "x");
        hub.add(Arc::clone(&listener));
        hub.add(Arc::clone(&listener));

        hub.notify(&KeeperError::Closed);
        assert_eq!(log.lock().unwrap().len(), 2);

        assert!(hub.remove(&listener));
        assert_eq!(hub.len(), 1);
        assert!(hub.remove(&listener));
        assert!(!hub.remove(&listener));
        assert!(hub.is_empty());
    }

    #[test]
    fn test_clear() {
        let hub = ErrorHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add(recorder(&log, "a"));
        hub.clear();
        hub.notify(&KeeperError::Closed);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_observe_passes_result_through() {
        let hub = ErrorHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add(recorder(&log, "a"));

        assert_eq!(hub.observe(Ok(5)).unwrap(), 5);
        assert!(log.lock().unwrap().is_empty());

        assert!(hub.observe::<()>(Err(KeeperError::NoSupportedStorage)).is_err());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listener_may_mutate_hub() {
        let hub = ErrorHub::new();
        let inner = hub.clone();
        hub.add(Arc::new(move |_e: &KeeperError| inner.clear()));
        hub.notify(&KeeperError::Closed);
        assert!(hub.is_empty());
    }
}
