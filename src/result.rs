//! Single-shot deferred result handle.
//!
//! The source library represents a request's outcome as a continuation that
//! both publishes a value and admits chained error handlers, with handlers
//! registered after resolution still firing (asynchronously, not
//! re-entrantly). This reimplements that as an explicit split between the
//! producer side (`ResultSource`, held by whoever runs the transaction
//! closure) and the consumer side (`DeferredResult`, handed back to the
//! caller), backed by a `tokio::sync::Notify` rather than a channel so late
//! subscribers still observe the stored value.

use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, Result};

struct Inner<T> {
    slot: std::sync::Mutex<Option<Result<T>>>,
    notify: Notify,
}

/// Producer half. Exactly one `resolve` call is expected per request.
pub struct ResultSource<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer half returned to callers of a CRUD/query operation.
pub struct DeferredResult<T> {
    inner: Arc<Inner<T>>,
}

pub fn deferred<T>() -> (ResultSource<T>, DeferredResult<T>) {
    let inner = Arc::new(Inner {
        slot: std::sync::Mutex::new(None),
        notify: Notify::new(),
    });
    (
        ResultSource {
            inner: inner.clone(),
        },
        DeferredResult { inner },
    )
}

impl<T> ResultSource<T> {
    /// Resolves the handle. Calling this more than once is a logic error in
    /// the caller (the second write is silently dropped) — each transaction
    /// request's `onComplete` fires exactly once per spec §4.C.
    pub fn resolve(self, value: Result<T>) {
        let mut slot = self.inner.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value);
        }
        drop(slot);
        self.inner.notify.notify_waiters();
    }
}

impl<T: Send + 'static> DeferredResult<T> {
    /// Awaits the value directly — the ergonomic path for in-crate callers.
    pub async fn wait(self) -> Result<T> {
        loop {
            {
                let mut slot = self.inner.slot.lock().unwrap();
                if let Some(result) = slot.take() {
                    return result;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Registers success/error continuations. If the result is already
    /// resolved, the continuation still runs on the next scheduler tick
    /// (via `tokio::spawn`) rather than synchronously in-line, matching the
    /// re-entry rule in the design notes.
    pub fn then<OnOk, OnErr>(self, on_ok: OnOk, on_err: OnErr)
    where
        OnOk: FnOnce(T) + Send + 'static,
        OnErr: FnOnce(Error) + Send + 'static,
    {
        tokio::spawn(async move {
            match self.wait().await {
                Ok(value) => on_ok(value),
                Err(err) => on_err(err),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_before_wait() {
        let (src, handle) = deferred::<i32>();
        src.resolve(Ok(42));
        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn resolves_after_wait_registered() {
        let (src, handle) = deferred::<i32>();
        let waiter = tokio::spawn(handle.wait());
        tokio::task::yield_now().await;
        src.resolve(Ok(7));
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn then_fires_late_subscriber_asynchronously() {
        let (src, handle) = deferred::<i32>();
        src.resolve(Ok(1));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        handle.then(
            move |v| {
                let _ = done_tx.send(v);
            },
            |_| unreachable!(),
        );

        assert_eq!(done_rx.await.unwrap(), 1);
    }
}
