//! Transaction queue (component 4.F).
//!
//! A FIFO buffer of pending transaction requests, executed one at a time.
//! Grounded in the worker-queue shape of the teacher's `datafetch` refresh
//! scheduler (`datafetch::native` — a bounded queue drained by a single
//! background loop, overflow handled by dropping instead of blocking the
//! producer) generalized from a polling refresh loop to a transaction
//! runner driven by `BackendDriver::do_transaction`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::backend::{BackendDriver, TransactionJob, TxMode};
use crate::error::Error;
use crate::result::{deferred, DeferredResult, ResultSource};

/// Default staleness-logging threshold; halved in debug builds (spec §5).
pub const DEFAULT_STALENESS: Duration = Duration::from_millis(3000);
pub const DEBUG_STALENESS: Duration = Duration::from_millis(500);

pub const MAX_QUEUE_LEN: usize = 1000;

pub struct TransactionRequest {
    pub stores: Vec<String>,
    pub mode: TxMode,
    pub job: TransactionJob,
}

struct Entry {
    request: TransactionRequest,
    source: ResultSource<()>,
    submitted_at: Instant,
}

/// FIFO of pending transaction requests. `submit` never blocks; `run_one`
/// pops the head and drives it through a backend, one request at a time,
/// matching the strict-FIFO ordering invariant (spec §8 invariant 8).
pub struct TransactionQueue {
    entries: Mutex<VecDeque<Entry>>,
    notify: Notify,
    max_len: usize,
    staleness_threshold: Duration,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUE_LEN)
    }

    pub fn with_capacity(max_len: usize) -> Self {
        let staleness_threshold = if cfg!(debug_assertions) {
            DEBUG_STALENESS
        } else {
            DEFAULT_STALENESS
        };
        TransactionQueue {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_len,
            staleness_threshold,
        }
    }

    /// Enqueues a request, returning a handle that resolves once the
    /// request has been run (or the queue is purged). Drops the *oldest*
    /// pending entry, logged as a warning, when the queue is already at
    /// capacity (spec §8 invariant 9).
    pub async fn submit(&self, request: TransactionRequest) -> DeferredResult<()> {
        let (source, handle) = deferred();
        let entry = Entry {
            request,
            source,
            submitted_at: Instant::now(),
        };

        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_len {
            if let Some(dropped) = entries.pop_front() {
                tracing::warn!(
                    queue_len = entries.len() + 1,
                    "transaction queue overflow, dropping oldest pending request"
                );
                dropped
                    .source
                    .resolve(Err(Error::invalid_state("dropped by queue overflow")));
            }
        }
        entries.push_back(entry);
        drop(entries);
        self.notify.notify_one();
        handle
    }

    /// Waits for and removes the head entry.
    async fn pop(&self) -> (TransactionRequest, ResultSource<()>, Instant) {
        loop {
            {
                let mut entries = self.entries.lock().await;
                if let Some(entry) = entries.pop_front() {
                    return (entry.request, entry.source, entry.submitted_at);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Pops one request and runs it to completion against `backend`. A
    /// `versionchange` request is run exactly the same way — strict FIFO
    /// already gives it the "blocks non-version work until done" property
    /// spec §4.F describes, since nothing else runs concurrently with it.
    pub async fn run_one(&self, backend: &dyn BackendDriver) {
        let (request, source, submitted_at) = self.pop().await;
        if submitted_at.elapsed() > self.staleness_threshold {
            tracing::warn!(
                waited_ms = submitted_at.elapsed().as_millis() as u64,
                mode = ?request.mode,
                "transaction queue head was stale before it started running"
            );
        }
        let result = backend
            .do_transaction(&request.stores, request.mode, request.job)
            .await;
        source.resolve(result);
    }

    /// Drains every pending request, resolving each with an error — used
    /// when the connection fails to open (spec §4.F).
    pub async fn purge(&self, reason: impl Into<String> + Clone) {
        let mut entries = self.entries.lock().await;
        while let Some(entry) = entries.pop_front() {
            entry.source.resolve(Err(Error::invalid_state(reason.clone().into())));
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TransactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::NativeBackend;
    use crate::key::KeyType;
    use crate::schema::{KeyPath, Schema, StoreSchema};
    use std::sync::Arc;
    use tokio::sync::Mutex as TokioMutex;

    async fn seeded() -> NativeBackend {
        let backend = NativeBackend::new();
        let schema = Schema::fixed(vec![StoreSchema::new(
            "items",
            Some(KeyPath::Single("id".into())),
            KeyType::Number,
        )]);
        backend.connect("t", &schema).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn fifo_order_is_respected() {
        let backend = seeded().await;
        let queue = Arc::new(TransactionQueue::new());
        let order = Arc::new(TokioMutex::new(Vec::new()));

        let make_request = |label: &'static str, order: Arc<TokioMutex<Vec<&'static str>>>| TransactionRequest {
            stores: vec!["items".into()],
            mode: TxMode::ReadOnly,
            job: Box::new(move |_tx| {
                Box::pin(async move {
                    order.lock().await.push(label);
                    Ok(())
                })
            }),
        };

        let a = queue.submit(make_request("a", order.clone())).await;
        let b = queue.submit(make_request("b", order.clone())).await;

        queue.run_one(&backend).await;
        queue.run_one(&backend).await;

        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert_eq!(*order.lock().await, vec!["a", "b"]);
    }

    /// A `versionchange` submitted while two `readonly` requests are queued
    /// runs only after both complete, and a `readonly` submitted after it
    /// waits until it completes (concrete scenario 6) — strict FIFO already
    /// gives this for free, so the test is really pinning that property
    /// rather than exercising any mode-specific branch in `run_one`.
    #[tokio::test]
    async fn version_change_is_ordered_strictly_by_submission() {
        let backend = seeded().await;
        let queue = Arc::new(TransactionQueue::new());
        let order = Arc::new(TokioMutex::new(Vec::new()));

        let make = |label: &'static str, mode: TxMode, order: Arc<TokioMutex<Vec<&'static str>>>| TransactionRequest {
            stores: vec!["items".into()],
            mode,
            job: Box::new(move |_tx| {
                Box::pin(async move {
                    order.lock().await.push(label);
                    Ok(())
                })
            }),
        };

        let r1 = queue.submit(make("r1", TxMode::ReadOnly, order.clone())).await;
        let r2 = queue.submit(make("r2", TxMode::ReadOnly, order.clone())).await;
        let vc = queue.submit(make("vc", TxMode::VersionChange, order.clone())).await;
        let r3 = queue.submit(make("r3", TxMode::ReadOnly, order.clone())).await;

        for _ in 0..4 {
            queue.run_one(&backend).await;
        }

        r1.wait().await.unwrap();
        r2.wait().await.unwrap();
        vc.wait().await.unwrap();
        r3.wait().await.unwrap();
        assert_eq!(*order.lock().await, vec!["r1", "r2", "vc", "r3"]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_entry() {
        let queue = TransactionQueue::with_capacity(2);
        let make = |stores: Vec<String>| TransactionRequest {
            stores,
            mode: TxMode::ReadOnly,
            job: Box::new(|_tx| Box::pin(async move { Ok(()) })),
        };

        let oldest = queue.submit(make(vec!["one".into()])).await;
        let _middle = queue.submit(make(vec!["two".into()])).await;
        let _newest = queue.submit(make(vec!["three".into()])).await;

        assert_eq!(queue.len().await, 2);
        let err = oldest.wait().await.unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");
    }

    #[tokio::test]
    async fn purge_resolves_every_pending_request_with_an_error() {
        let queue = TransactionQueue::new();
        let make = || TransactionRequest {
            stores: vec!["items".into()],
            mode: TxMode::ReadOnly,
            job: Box::new(|_tx| Box::pin(async move { Ok(()) })),
        };

        let a = queue.submit(make()).await;
        let b = queue.submit(make()).await;
        queue.purge("connection failed").await;

        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
        assert_eq!(queue.len().await, 0);
    }
}
