//! Timer-driven batching of live notifications
//!
//! A batch opens with the first item that arrives and closes once the
//! stream has been idle for the debounce window, or once it holds
//! `max_size` items. A terminal error is delivered after the batch that
//! was open when it arrived.

use std::time::Duration;

use tokio::time::timeout;

use crate::errors::{RepoError, RepoResult};

use super::stream::LiveReceiver;

/// Debouncing batcher over a live receiver
#[derive(Debug)]
pub struct Debouncer<T> {
    receiver: LiveReceiver<T>,
    window: Duration,
    max_size: usize,
    pending_error: Option<RepoError>,
    finished: bool,
}

impl<T> Debouncer<T> {
    pub fn new(receiver: LiveReceiver<T>, window: Duration, max_size: usize) -> Self {
        Self {
            receiver,
            window,
            max_size: max_size.max(1),
            pending_error: None,
            finished: false,
        }
    }

    /// Next non-empty batch; `None` once the producer is done
    pub async fn next_batch(&mut self) -> Option<RepoResult<Vec<T>>> {
        if let Some(error) = self.pending_error.take() {
            return Some(Err(error));
        }
        if self.finished {
            return None;
        }

        let mut batch = match self.receiver.recv().await {
            Some(Ok(item)) => vec![item],
            Some(Err(error)) => {
                self.finished = true;
                return Some(Err(error));
            }
            None => {
                self.finished = true;
                return None;
            }
        };

        while batch.len() < self.max_size {
            match timeout(self.window, self.receiver.recv()).await {
                Ok(Some(Ok(item))) => batch.push(item),
                Ok(Some(Err(error))) => {
                    self.pending_error = Some(error);
                    self.finished = true;
                    break;
                }
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                // idle
                Err(_) => break,
            }
        }
        Some(Ok(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::stream::live_channel;
    use tokio::time::sleep;

    fn debouncer(window_ms: u64, max_size: usize) -> (crate::live::LiveSender<u32>, Debouncer<u32>) {
        let (tx, stream) = live_channel();
        let (receiver, guard) = stream.into_parts();
        guard.disarm();
        (tx, Debouncer::new(receiver, Duration::from_millis(window_ms), max_size))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_batch() {
        let (tx, mut batches) = debouncer(100, 1024);
        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i);
                sleep(Duration::from_millis(10)).await;
            }
            sleep(Duration::from_millis(500)).await;
            tx.send(99);
        });

        assert_eq!(batches.next_batch().await, Some(Ok(vec![0, 1, 2, 3, 4])));
        assert_eq!(batches.next_batch().await, Some(Ok(vec![99])));
        assert_eq!(batches.next_batch().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_size_flushes_early() {
        let (tx, mut batches) = debouncer(100, 2);
        for i in 0..3 {
            tx.send(i);
        }
        drop(tx);

        assert_eq!(batches.next_batch().await, Some(Ok(vec![0, 1])));
        assert_eq!(batches.next_batch().await, Some(Ok(vec![2])));
        assert_eq!(batches.next_batch().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_follows_open_batch() {
        let (tx, mut batches) = debouncer(100, 16);
        tx.send(1);
        tx.error(RepoError::backend("gone"));

        assert_eq!(batches.next_batch().await, Some(Ok(vec![1])));
        assert_eq!(
            batches.next_batch().await,
            Some(Err(RepoError::backend("gone")))
        );
        assert_eq!(batches.next_batch().await, None);
    }
}
