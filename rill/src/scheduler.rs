use derive_more::{Display, Error};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
    task::noop_waker,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};
use tracing::warn;

#[derive(Debug, Clone, Display, Error)]
pub enum ScheduleError {
    #[display(fmt = "scheduler task panicked")]
    Panicked,
    #[display(fmt = "scheduler task was dropped before completion")]
    Canceled,
}

type Task = BoxFuture<'static, ()>;

struct SchedulerState {
    queue: VecDeque<Task>,
    /// Task currently being pumped, parked here between polls.
    current: Option<Task>,
    running: bool,
    flush_wakers: Vec<Waker>,
}

/// FIFO serialized task execution. One task runs to completion, including
/// its awaited continuations, before the next one is dequeued. The first
/// task after a quiescent period starts synchronously on the enqueuer's
/// call stack, until its first suspension.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerState>>,
}

static GLOBAL: Lazy<Scheduler> = Lazy::new(Scheduler::new);

/// The process-wide scheduler used by subscriptions and cleanup hooks.
pub fn global() -> &'static Scheduler {
    &GLOBAL
}

impl Scheduler {
    /// Isolated instance, mainly for tests.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                current: None,
                running: false,
                flush_wakers: Vec::new(),
            })),
        }
    }

    /// Enqueue a task. The returned future resolves with the task's result;
    /// a panicking task rejects only its own future, the pump continues.
    pub fn enqueue<F, T>(&self, fut: F) -> Enqueued<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = async move {
            let result = AssertUnwindSafe(fut).catch_unwind().await;
            if result.is_err() {
                warn!("scheduler task panicked");
            }
            let _ = tx.send(result.map_err(|_| ScheduleError::Panicked));
        }
        .boxed();

        let run_now = {
            let mut state = self.inner.lock();
            if state.running {
                state.queue.push_back(task);
                None
            } else {
                state.running = true;
                Some(task)
            }
        };

        if let Some(mut task) = run_now {
            // Synchronous start; a noop waker suffices because the pump
            // unconditionally re-polls the task once it takes over.
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            match task.as_mut().poll(&mut cx) {
                Poll::Ready(()) => self.task_finished(),
                Poll::Pending => {
                    self.inner.lock().current = Some(task);
                    self.spawn_pump();
                }
            }
        }
        Enqueued { rx }
    }

    /// Release the FIFO slot while `signal` is pending, then re-enqueue
    /// `fut` in FIFO order once it settles.
    pub fn after<P, F, T>(&self, signal: P, fut: F) -> Enqueued<T>
    where
        P: Future + Send + 'static,
        P::Output: Send,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scheduler = self.clone();
        tokio::spawn(async move {
            signal.await;
            let result = scheduler.enqueue(fut).await;
            let _ = tx.send(result);
        });
        Enqueued { rx }
    }

    /// `after` with a timer as the signal.
    pub fn delay<F, T>(&self, delay: Duration, fut: F) -> Enqueued<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.after(tokio::time::sleep(delay), fut)
    }

    /// Resolves once the queue has been observed empty on both sides of a
    /// cooperative yield, guarding against re-entrant enqueues from
    /// continuation chains.
    pub async fn flush(&self) {
        loop {
            Idle {
                inner: self.inner.clone(),
            }
            .await;
            tokio::task::yield_now().await;
            let state = self.inner.lock();
            if !state.running && state.queue.is_empty() && state.current.is_none() {
                return;
            }
        }
    }

    fn task_finished(&self) {
        let more = {
            let mut state = self.inner.lock();
            if state.queue.is_empty() && state.current.is_none() {
                state.running = false;
                for waker in state.flush_wakers.drain(..) {
                    waker.wake();
                }
                false
            } else {
                true
            }
        };
        if more {
            self.spawn_pump();
        }
    }

    fn spawn_pump(&self) {
        let inner = self.inner.clone();
        tokio::spawn(pump(inner));
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump(inner: Arc<Mutex<SchedulerState>>) {
    loop {
        let task = {
            let mut state = inner.lock();
            let next = state.current.take();
            match next.or_else(|| state.queue.pop_front()) {
                Some(task) => task,
                None => {
                    state.running = false;
                    for waker in state.flush_wakers.drain(..) {
                        waker.wake();
                    }
                    return;
                }
            }
        };
        task.await;
    }
}

/// Future of an enqueued task's result.
#[must_use = "futures do nothing unless polled"]
pub struct Enqueued<T> {
    rx: oneshot::Receiver<Result<T, ScheduleError>>,
}

impl<T> Future for Enqueued<T> {
    type Output = Result<T, ScheduleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ScheduleError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Idle {
    inner: Arc<Mutex<SchedulerState>>,
}

impl Future for Idle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.inner.lock();
        if !state.running && state.queue.is_empty() && state.current.is_none() {
            Poll::Ready(())
        } else {
            state.flush_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_task_after_quiescence_starts_synchronously() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let task = scheduler.enqueue(async move { o.lock().push("task") });
        order.lock().push("after-enqueue");
        task.await.unwrap();
        assert_eq!(*order.lock(), vec!["task", "after-enqueue"]);
    }

    #[tokio::test]
    async fn tasks_run_in_fifo_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..10 {
            let o = order.clone();
            handles.push(scheduler.enqueue(async move {
                tokio::task::yield_now().await;
                o.lock().push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn a_task_runs_to_completion_before_the_next_starts() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let a = scheduler.enqueue(async move {
            o1.lock().push("a1");
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            o1.lock().push("a2");
        });
        let o2 = order.clone();
        let b = scheduler.enqueue(async move { o2.lock().push("b") });
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(*order.lock(), vec!["a1", "a2", "b"]);
    }

    #[tokio::test]
    async fn a_panicking_task_rejects_only_its_own_future() {
        let scheduler = Scheduler::new();
        let bad = scheduler.enqueue(async {
            tokio::task::yield_now().await;
            panic!("boom")
        });
        let good = scheduler.enqueue(async { 42 });
        assert!(matches!(bad.await, Err(ScheduleError::Panicked)));
        assert_eq!(good.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn flush_waits_for_re_entrant_enqueues() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(Mutex::new(0));
        let inner_sched = scheduler.clone();
        let h = hits.clone();
        let _ = scheduler.enqueue(async move {
            tokio::task::yield_now().await;
            let h2 = h.clone();
            let inner = inner_sched.enqueue(async move {
                tokio::task::yield_now().await;
                *h2.lock() += 1;
            });
            *h.lock() += 1;
            drop(inner);
        });
        scheduler.flush().await;
        assert_eq!(*hits.lock(), 2);
    }

    #[tokio::test]
    async fn after_re_enqueues_in_fifo_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<()>();
        let o1 = order.clone();
        let deferred = scheduler.after(rx, async move { o1.lock().push("deferred") });
        let o2 = order.clone();
        scheduler
            .enqueue(async move { o2.lock().push("direct") })
            .await
            .unwrap();
        tx.send(()).unwrap();
        deferred.await.unwrap();
        assert_eq!(*order.lock(), vec!["direct", "deferred"]);
    }

    #[tokio::test]
    async fn delay_runs_after_the_timer() {
        tokio::time::pause();
        let scheduler = Scheduler::new();
        let done = scheduler.delay(Duration::from_millis(50), async { "late" });
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(done.await.unwrap(), "late");
    }
}
