//! Bounded queue between the tailers and the batcher.
//!
//! Backpressure is lossy: a producer waits at most `wait` for room and then the
//! entry is handed back as [`QueueError::Full`] so the caller can count the drop
//! and move on. The consumer waits at most `wait` for an entry so it can still
//! evaluate time-based flushes while idle.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::entry::LogEntry;

/// Default queue capacity in entries.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Errors returned by [`QueueSender::push`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue stayed full for the whole wait bound; the entry is returned.
    #[error("queue is full")]
    Full(LogEntry),

    /// The consumer has gone away.
    #[error("queue is closed")]
    Closed,
}

/// Create a bounded queue holding at most `capacity` entries.
///
/// The sender half can be cloned and shared across tailer tasks; the receiver
/// half belongs to the single batcher.
pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer handle for the queue.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<LogEntry>,
}

impl QueueSender {
    /// Push an entry, waiting up to `wait` for room.
    pub async fn push(&self, entry: LogEntry, wait: Duration) -> Result<(), QueueError> {
        self.tx.send_timeout(entry, wait).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(entry) => QueueError::Full(entry),
            mpsc::error::SendTimeoutError::Closed(_) => QueueError::Closed,
        })
    }

    /// Maximum number of entries the queue can hold.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Best-effort number of queued entries.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Best-effort emptiness probe, used for shutdown drain decisions only.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer handle for the queue.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<LogEntry>,
}

impl QueueReceiver {
    /// Pop the next entry, waiting up to `wait`. Returns `None` on timeout or
    /// when every sender has been dropped and the queue is empty.
    pub async fn pop(&mut self, wait: Duration) -> Option<LogEntry> {
        timeout(wait, self.rx.recv()).await.ok().flatten()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True once every sender has been dropped.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }

    /// Close the queue to further pushes and discard what is left.
    ///
    /// Returns how many entries were discarded. Producers see
    /// [`QueueError::Closed`] afterwards, so nothing can slip in uncounted.
    pub fn close_and_discard(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Fields;
    use std::time::Instant;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new("host", "test", message, Fields::new()).unwrap()
    }

    #[tokio::test]
    async fn test_push_pop_preserves_order() {
        let (tx, mut rx) = bounded(10);
        for i in 0..3 {
            tx.push(entry(&format!("line {}", i)), Duration::from_millis(10))
                .await
                .unwrap();
        }

        assert_eq!(tx.len(), 3);
        assert_eq!(rx.len(), 3);
        for i in 0..3 {
            let got = rx.pop(Duration::from_millis(10)).await.unwrap();
            assert_eq!(got.message, format!("line {}", i));
        }
        assert!(rx.is_empty());
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn test_push_on_full_queue_drops_after_wait() {
        let (tx, rx) = bounded(2);
        tx.push(entry("a"), Duration::from_millis(10)).await.unwrap();
        tx.push(entry("b"), Duration::from_millis(10)).await.unwrap();

        let start = Instant::now();
        let result = tx.push(entry("c"), Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));

        match result {
            Err(QueueError::Full(rejected)) => assert_eq!(rejected.message, "c"),
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(rx.len(), 2);
        assert_eq!(tx.len(), tx.capacity());
    }

    #[tokio::test]
    async fn test_push_succeeds_when_room_frees_up() {
        let (tx, mut rx) = bounded(1);
        tx.push(entry("a"), Duration::from_millis(10)).await.unwrap();

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            rx.pop(Duration::from_millis(10)).await
        });

        tx.push(entry("b"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap().message, "a");
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty_queue() {
        let (_tx, mut rx) = bounded(4);
        let start = Instant::now();
        assert!(rx.pop(Duration::from_millis(30)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_push_after_receiver_dropped() {
        let (tx, rx) = bounded(4);
        drop(rx);
        let result = tx.push(entry("a"), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_receiver_sees_closure() {
        let (tx, mut rx) = bounded(4);
        tx.push(entry("a"), Duration::from_millis(10)).await.unwrap();
        drop(tx);

        assert!(rx.is_closed());
        assert!(rx.pop(Duration::from_millis(10)).await.is_some());
        assert!(rx.pop(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_close_and_discard_counts_remaining() {
        let (tx, mut rx) = bounded(8);
        for i in 0..3 {
            tx.push(entry(&format!("line {}", i)), Duration::from_millis(10))
                .await
                .unwrap();
        }

        assert_eq!(rx.close_and_discard(), 3);
        assert!(rx.is_empty());
        assert!(matches!(
            tx.push(entry("late"), Duration::from_millis(10)).await,
            Err(QueueError::Closed)
        ));
        assert_eq!(rx.close_and_discard(), 0);
    }
}
