//! # Live Streams
//!
//! A live stream is the consumer half of an unbounded channel of
//! `RepoResult<T>` plus a cancellation handle.
//!
//! - The producer ends the stream by dropping its `LiveSender`.
//! - An `Err` item is terminal: producers send at most one and stop.
//! - Dropping the stream (or calling `cancel`) runs every registered
//!   teardown exactly once, synchronously, on the dropping thread.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::{RepoError, RepoResult};

type Teardown = Box<dyn FnOnce() + Send>;

/// Shared cancellation token with teardown callbacks
#[derive(Clone)]
pub struct Cancellation {
    // None once cancelled
    callbacks: Arc<Mutex<Option<Vec<Teardown>>>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Register a teardown; runs immediately if already cancelled
    pub fn on_cancel(&self, teardown: impl FnOnce() + Send + 'static) {
        let mut guard = self.callbacks.lock();
        match guard.as_mut() {
            Some(callbacks) => callbacks.push(Box::new(teardown)),
            None => {
                drop(guard);
                teardown();
            }
        }
    }

    /// Run all teardowns; later calls are no-ops
    pub fn cancel(&self) {
        let callbacks = self.callbacks.lock().take();
        // Run outside the lock so teardowns may register or cancel freely
        if let Some(callbacks) = callbacks {
            for teardown in callbacks {
                teardown();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.callbacks.lock().is_none()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancels its token when dropped
#[derive(Debug)]
pub struct CancelGuard {
    cancellation: Option<Cancellation>,
}

impl CancelGuard {
    pub fn new(cancellation: Cancellation) -> Self {
        Self {
            cancellation: Some(cancellation),
        }
    }

    /// Give up the guard without cancelling
    pub fn disarm(mut self) -> Cancellation {
        self.cancellation.take().unwrap_or_default()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(cancellation) = self.cancellation.take() {
            cancellation.cancel();
        }
    }
}

/// Producer half of a live stream
#[derive(Debug)]
pub struct LiveSender<T> {
    sender: mpsc::UnboundedSender<RepoResult<T>>,
    cancellation: Cancellation,
}

impl<T> Clone for LiveSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<T> LiveSender<T> {
    /// Deliver an item; returns false once the consumer is gone
    pub fn send(&self, item: T) -> bool {
        self.sender.send(Ok(item)).is_ok()
    }

    /// Deliver a terminal error
    pub fn error(&self, error: RepoError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }

    /// Returns true once the consumer dropped or cancelled
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.cancellation.is_cancelled()
    }

    /// Register a teardown that runs when the consumer cancels
    pub fn on_cancel(&self, teardown: impl FnOnce() + Send + 'static) {
        self.cancellation.on_cancel(teardown);
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}

/// Consumer half of a live stream
pub struct LiveStream<T> {
    receiver: LiveReceiver<T>,
    guard: CancelGuard,
}

/// Receiving end without cancellation semantics
#[derive(Debug)]
pub struct LiveReceiver<T> {
    receiver: mpsc::UnboundedReceiver<RepoResult<T>>,
}

/// Create a connected sender and stream
pub fn live_channel<T>() -> (LiveSender<T>, LiveStream<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let cancellation = Cancellation::new();
    (
        LiveSender {
            sender,
            cancellation: cancellation.clone(),
        },
        LiveStream {
            receiver: LiveReceiver { receiver },
            guard: CancelGuard::new(cancellation),
        },
    )
}

impl<T> LiveReceiver<T> {
    /// Next item, or `None` when the producer is done
    pub async fn recv(&mut self) -> Option<RepoResult<T>> {
        self.receiver.recv().await
    }

    /// Next item if one is ready
    pub fn try_recv(&mut self) -> Option<RepoResult<T>> {
        self.receiver.try_recv().ok()
    }
}

impl<T> LiveStream<T> {
    /// Next item, or `None` when the producer is done
    pub async fn next(&mut self) -> Option<RepoResult<T>> {
        self.receiver.recv().await
    }

    /// Next item if one is ready
    pub fn try_next(&mut self) -> Option<RepoResult<T>> {
        self.receiver.try_recv()
    }

    /// Register a teardown that runs when this stream is cancelled
    pub fn on_cancel(self, teardown: impl FnOnce() + Send + 'static) -> Self {
        if let Some(cancellation) = &self.guard.cancellation {
            cancellation.on_cancel(teardown);
        }
        self
    }

    /// Cancel and drop the stream
    pub fn cancel(self) {
        drop(self);
    }

    /// Split into the receiver and the guard that owns cancellation
    pub fn into_parts(self) -> (LiveReceiver<T>, CancelGuard) {
        (self.receiver, self.guard)
    }
}

impl<T> fmt::Debug for LiveStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStream")
            .field("guard", &self.guard)
            .finish()
    }
}

impl<T> Stream for LiveStream<T> {
    type Item = RepoResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.receiver.poll_recv(cx)
    }
}

impl<T> Stream for LiveReceiver<T> {
    type Item = RepoResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_items_then_completion() {
        let (tx, mut stream) = live_channel::<u32>();
        assert!(tx.send(1));
        assert!(tx.send(2));
        drop(tx);

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_drop_runs_teardown_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, stream) = live_channel::<u32>();
        let counter = calls.clone();
        tx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let cancellation = tx.cancellation().clone();
        drop(stream);
        cancellation.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tx.is_closed());
        assert!(!tx.send(3));
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        cancellation.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_parts_keeps_cancellation_on_guard() {
        let (tx, stream) = live_channel::<u32>();
        let (_receiver, guard) = stream.into_parts();
        assert!(!tx.is_closed());
        drop(guard);
        assert!(tx.cancellation().is_cancelled());
    }

    #[test]
    fn test_disarmed_guard_does_not_cancel() {
        let cancellation = Cancellation::new();
        let guard = CancelGuard::new(cancellation.clone());
        let _kept = guard.disarm();
        assert!(!cancellation.is_cancelled());
    }
}
