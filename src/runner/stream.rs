//! Cancelable response stream
//!
//! A runner hands back a [`QueryStream`]: the receiving half of the
//! response channel plus an explicit cancellation handle. Cancelling
//! prevents any further sub-request from being issued, aborts the one in
//! flight and is idempotent; the last emitted response remains valid.

use crate::types::MergedResponse;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Shared cancellation flag for one logical run
///
/// Cloned into the runner task; the stream side triggers it. Double-cancel
/// is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// Create an untriggered handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation; idempotent
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("query stream cancelled");
            self.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been triggered
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is triggered
    ///
    /// Used by runners inside `select!` to abort the in-flight
    /// sub-request.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // cancel() cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Stream of progressively merged responses for one logical request
///
/// Yields the accumulated [`MergedResponse`] after every sub-request
/// completion; the final item carries the terminal state (`Done` or
/// `Error`). Dropping the stream cancels the run.
pub struct QueryStream {
    receiver: mpsc::Receiver<MergedResponse>,
    cancel: CancelHandle,
}

impl QueryStream {
    /// Create a stream with the given channel capacity
    ///
    /// Returns the stream plus the sender and cancel handle for the
    /// runner task.
    pub(crate) fn channel(buffer: usize) -> (Self, mpsc::Sender<MergedResponse>, CancelHandle) {
        let (sender, receiver) = mpsc::channel(buffer);
        let cancel = CancelHandle::new();
        let stream = Self {
            receiver,
            cancel: cancel.clone(),
        };
        (stream, sender, cancel)
    }

    /// Cancel the run; idempotent
    ///
    /// No further sub-requests are issued and the in-flight one is
    /// aborted. The already-merged partial result remains the last
    /// emitted value.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clonable handle for cancelling from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Receive the next merged snapshot
    pub async fn recv(&mut self) -> Option<MergedResponse> {
        self.receiver.recv().await
    }

    /// Drain the stream and return the terminal response
    pub async fn final_response(mut self) -> Option<MergedResponse> {
        let mut last = None;
        while let Some(response) = self.receiver.recv().await {
            last = Some(response);
        }
        last
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for QueryStream {
    type Item = MergedResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
