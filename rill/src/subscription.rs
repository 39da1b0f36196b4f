use crate::scheduler;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

type Cleanup = Box<dyn FnOnce() -> Option<BoxFuture<'static, ()>> + Send>;

/// Idempotent teardown token. The flag flips synchronously on the first
/// `unsubscribe` so in-flight delivery loops observe the abort immediately;
/// the cleanup thunk runs exactly once, on the scheduler.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    unsubscribed: AtomicBool,
    cleanup: Mutex<Option<Cleanup>>,
}

impl Subscription {
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self::with_cleanup(Some(Box::new(move || {
            cleanup();
            None
        })))
    }

    pub fn with_async_cleanup(cleanup: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) -> Self {
        Self::with_cleanup(Some(Box::new(move || Some(cleanup()))))
    }

    pub fn noop() -> Self {
        Self::with_cleanup(None)
    }

    fn with_cleanup(cleanup: Option<Cleanup>) -> Self {
        Self {
            inner: Arc::new(Inner {
                unsubscribed: AtomicBool::new(false),
                cleanup: Mutex::new(cleanup),
            }),
        }
    }

    pub fn unsubscribed(&self) -> bool {
        self.inner.unsubscribed.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) {
        if self.inner.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cleanup = self.inner.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            // Deferred past the unsubscriber's stack: a receiver may
            // unsubscribe itself from inside its own handler. Panics inside
            // the cleanup reject only the scheduled task.
            let _ = scheduler::global().enqueue(async move {
                tokio::task::yield_now().await;
                if let Some(fut) = cleanup() {
                    fut.await
                }
            });
        }
    }
}
