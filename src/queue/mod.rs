//! Bounded per-upstream admission queue.
//!
//! The queue holds captured requests waiting for rate-limit headroom or a
//! free worker slot. Entries are strictly FIFO; a single drain task per
//! upstream pops the head, so admission order is enqueue order (canceled
//! and expired entries are skipped). Parallel execution is bounded by the
//! worker semaphore owned by the upstream runtime, not by the queue.

use bytes::Bytes;
use http::{HeaderMap, Method};
use hyper::Response;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::proxy::context::BoxBody;

/// The immutable captured request carried through the queue to a worker.
#[derive(Debug)]
pub struct CapturedRequest {
    pub method: Method,
    /// Path suffix after the matched route prefix (leading `/` kept).
    pub suffix: String,
    /// Original query string, without the `?`.
    pub query: Option<String>,
    /// Sanitized client headers, ready to overlay with rendered templates.
    pub headers: HeaderMap,
    pub client_ip: String,
    pub user: Option<String>,
}

/// Request body as captured at admission time. Small bodies that may need
/// replay (retries, rewriting) are buffered; everything else stays a
/// one-shot stream handle that is not read until dispatch.
#[derive(Debug)]
pub enum BodySource {
    Empty,
    Buffered(Bytes),
    Streaming(hyper::body::Incoming),
}

impl BodySource {
    pub fn is_replayable(&self) -> bool {
        !matches!(self, BodySource::Streaming(_))
    }
}

#[derive(Debug)]
pub struct QueuedRequest {
    pub request: CapturedRequest,
    pub body: BodySource,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    /// Completion channel back to the waiting client task. Dropping the
    /// sender tells the client task the entry died without a response.
    pub respond: oneshot::Sender<Response<BoxBody>>,
}

impl QueuedRequest {
    pub fn expired(&self, now: Instant) -> bool {
        now > self.deadline
    }

    pub fn canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct AdmissionQueue {
    entries: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
    max_size: usize,
    depth: AtomicUsize,
}

impl AdmissionQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_size: max_size.max(1),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Enqueue, or hand the entry back when the queue is at capacity.
    pub fn try_push(&self, entry: QueuedRequest) -> Result<(), QueuedRequest> {
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.len() >= self.max_size {
                return Err(entry);
            }
            entries.push_back(entry);
            self.depth.store(entries.len(), Ordering::Relaxed);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<QueuedRequest> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.pop_front();
        self.depth.store(entries.len(), Ordering::Relaxed);
        entry
    }

    /// Park until a push (or a `notify_waiters` broadcast) arrives. Use in a
    /// `select!` with the generation's cancellation token.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wake the drain task without enqueueing (shutdown, clear).
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// Take every queued entry, marking each canceled. The caller decides
    /// what to answer the waiting clients.
    pub fn drain(&self) -> Vec<QueuedRequest> {
        let drained: Vec<QueuedRequest> = {
            let mut entries = self.entries.lock().unwrap();
            let drained = entries.drain(..).collect();
            self.depth.store(0, Ordering::Relaxed);
            drained
        };
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(deadline_in: Duration) -> (QueuedRequest, oneshot::Receiver<Response<BoxBody>>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        (
            QueuedRequest {
                request: CapturedRequest {
                    method: Method::GET,
                    suffix: "/v1".to_string(),
                    query: None,
                    headers: HeaderMap::new(),
                    client_ip: "1.1.1.1".to_string(),
                    user: None,
                },
                body: BodySource::Empty,
                enqueued_at: now,
                deadline: now + deadline_in,
                cancel: CancellationToken::new(),
                respond: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn fifo_order_and_capacity() {
        let q = AdmissionQueue::new(2);
        let (a, _rx_a) = entry(Duration::from_secs(5));
        let (b, _rx_b) = entry(Duration::from_secs(5));
        let (c, _rx_c) = entry(Duration::from_secs(5));

        assert!(q.try_push(a).is_ok());
        assert!(q.try_push(b).is_ok());
        assert_eq!(q.depth(), 2);
        // Third entry bounces back untouched.
        assert!(q.try_push(c).is_err());

        let first = q.pop().unwrap();
        assert_eq!(first.request.suffix, "/v1");
        assert_eq!(q.depth(), 1);
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }

    #[tokio::test]
    async fn drain_cancels_all_entries() {
        let q = AdmissionQueue::new(8);
        let (a, _rx_a) = entry(Duration::from_secs(5));
        let (b, _rx_b) = entry(Duration::from_secs(5));
        let token_a = a.cancel.clone();
        q.try_push(a).unwrap();
        q.try_push(b).unwrap();

        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(q.depth(), 0);
        assert!(token_a.is_cancelled());
    }

    #[tokio::test]
    async fn expiry_is_deadline_based() {
        let (e, _rx) = entry(Duration::from_millis(5));
        assert!(!e.expired(Instant::now()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(e.expired(Instant::now()));
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let q = std::sync::Arc::new(AdmissionQueue::new(8));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move {
                q.wait().await;
                q.pop().is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (e, _rx) = entry(Duration::from_secs(5));
        q.try_push(e).unwrap();
        assert!(waiter.await.unwrap());
    }
}
