//! A deduplicating delay queue driving reconciliation wake-ups.
//!
//! Messages are deduplicated while queued: scheduling an already-pending
//! message keeps whichever deadline is earlier, so a burst of watch events
//! for one object collapses into a single wake.
use std::{
    collections::HashMap,
    future::poll_fn,
    hash::Hash,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// The queue of pending reconciliation wakes
pub struct RequeueQueue<T: Hash + Eq + Clone> {
    queue: DelayQueue<T>,
    scheduled: HashMap<T, ScheduledEntry>,
}

struct ScheduledEntry {
    run_at: Instant,
    queue_key: Key,
}

impl<T: Hash + Eq + Clone> Default for RequeueQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Hash + Eq + Clone> RequeueQueue<T> {
    /// An empty queue
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
        }
    }

    /// Schedule `message` to be emitted after `delay`.
    ///
    /// If the message is already queued the earlier deadline wins.
    pub fn insert(&mut self, message: T, delay: Duration) {
        let run_at = Instant::now() + delay;
        match self.scheduled.get_mut(&message) {
            Some(entry) if entry.run_at > run_at => {
                self.queue.reset_at(&entry.queue_key, run_at);
                entry.run_at = run_at;
            }
            Some(_) => {
                // the queued deadline is sooner; keep it
            }
            None => {
                let queue_key = self.queue.insert_at(message.clone(), run_at);
                self.scheduled.insert(message, ScheduledEntry { run_at, queue_key });
            }
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<T> {
        match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let message = expired.into_inner();
                self.scheduled.remove(&message);
                Poll::Ready(message)
            }
            // An empty DelayQueue reports Ready(None); stay pending. The
            // owning task inserts into this queue itself, so it is always
            // re-polled after new messages arrive.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    /// The next expired message; pending while the queue is empty
    pub async fn next(&mut self) -> T {
        poll_fn(|cx| self.poll_next(cx)).await
    }
}
