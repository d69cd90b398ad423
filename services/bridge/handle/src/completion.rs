//! Exactly-once completion callbacks for queued writes and sends.

use crate::error::SocketError;
use std::fmt;
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce(Result<(), SocketError>) + Send + 'static>;

/// Completion callback for a write, send or destroy request.
///
/// A completion fires at most once. Dropping one that never fired reports
/// [`SocketError::Closed`], so a socket torn down with requests still queued
/// cannot leak a caller waiting on them.
pub struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<(), SocketError>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    /// Completion nobody is waiting on.
    pub fn noop() -> Self {
        Self { callback: None }
    }

    /// Completion paired with a oneshot receiver resolving to its result.
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), SocketError>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    /// Fire the callback with `result`.
    pub fn complete(mut self, result: Result<(), SocketError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Combine with `next`; both fire with the same result, `self` first.
    pub fn chain(self, next: Completion) -> Completion {
        if self.is_noop() {
            return next;
        }
        if next.is_noop() {
            return self;
        }
        Completion::new(move |result: Result<(), SocketError>| {
            self.complete(result.clone());
            next.complete(result);
        })
    }

    /// True when there is no callback attached.
    pub fn is_noop(&self) -> bool {
        self.callback.is_none()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(SocketError::Closed));
        }
    }
}
