use crate::{
    emission::Emission,
    error::StreamError,
    receiver::{Ack, Receiver},
    stamp::Stamp,
    subscription::Subscription,
};
use futures::future::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};
use tracing::trace;

type Connect<T> = Box<dyn FnOnce(QueuePusher<T>) -> Subscription + Send>;

struct QueueState<T> {
    buffer: VecDeque<(u64, Emission<T>)>,
    /// Position assigned to the next pushed item.
    next_pos: u64,
    /// Position up to which the consumer has dequeued (exclusive).
    taken_pos: u64,
    pending_error: Option<StreamError>,
    completed: bool,
    closed: bool,
    consumer_waker: Option<Waker>,
    producer_wakers: Vec<(u64, Waker)>,
    connect: Option<Connect<T>>,
    subscription: Option<Subscription>,
    last_stamp: Option<Stamp>,
}

impl<T> QueueState<T> {
    fn new(connect: Option<Connect<T>>) -> Self {
        Self {
            buffer: VecDeque::new(),
            next_pos: 0,
            taken_pos: 0,
            pending_error: None,
            completed: false,
            closed: false,
            consumer_waker: None,
            producer_wakers: Vec::new(),
            connect,
            subscription: None,
            last_stamp: None,
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer_waker.take() {
            waker.wake();
        }
    }

    fn wake_producers_up_to(&mut self, pos: u64) {
        let mut i = 0;
        while i < self.producer_wakers.len() {
            if self.producer_wakers[i].0 < pos {
                self.producer_wakers.swap_remove(i).1.wake();
            } else {
                i += 1;
            }
        }
    }

    fn release_all_producers(&mut self) -> Vec<Waker> {
        self.producer_wakers.drain(..).map(|(_, w)| w).collect()
    }
}

/// Producer handle of the single-producer, single-consumer emission queue
/// that backs every stream, subject, operator output and conversion.
pub struct QueuePusher<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for QueuePusher<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Consumer handle; an async iterator over stamped emissions. An `Err`
/// item is the error terminal, end-of-stream the completion terminal.
pub struct Emissions<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

/// Eagerly connected queue: the producer is live from the start, values
/// pushed before the first poll are buffered for the consumer.
pub fn emission_queue<T>() -> (QueuePusher<T>, Emissions<T>) {
    let state = Arc::new(Mutex::new(QueueState::new(None)));
    (
        QueuePusher {
            state: state.clone(),
        },
        Emissions { state },
    )
}

/// Lazily connected queue: `connect` runs on the first pull and receives
/// the producer handle to feed, so unused derived iterators create no work
/// on their source.
pub fn lazy_emission_queue<T>(
    connect: impl FnOnce(QueuePusher<T>) -> Subscription + Send + 'static,
) -> (QueuePusher<T>, Emissions<T>) {
    let state = Arc::new(Mutex::new(QueueState::new(Some(Box::new(connect)))));
    (
        QueuePusher {
            state: state.clone(),
        },
        Emissions { state },
    )
}

impl<T> QueuePusher<T> {
    /// Push a value. The returned future resolves once the consumer has
    /// dequeued it; if the consumer is already parked waiting, the push is
    /// acknowledged immediately.
    pub fn push(&self, emission: Emission<T>) -> PushDone<T> {
        let mut state = self.state.lock();
        if state.completed || state.closed || state.pending_error.is_some() {
            trace!("push after terminal ignored");
            return PushDone {
                state: self.state.clone(),
                pos: None,
            };
        }
        let immediate = state.consumer_waker.is_some() && state.buffer.is_empty();
        let pos = state.next_pos;
        state.next_pos += 1;
        state.buffer.push_back((pos, emission));
        state.wake_consumer();
        PushDone {
            state: self.state.clone(),
            pos: (!immediate).then(|| pos),
        }
    }

    /// Completion is sticky; buffered values still drain first.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.completed || state.closed {
            return;
        }
        state.completed = true;
        state.wake_consumer();
    }

    /// Store the error terminal; the consumer drains buffered values
    /// before the error surfaces.
    pub fn error(&self, err: StreamError) {
        let mut state = self.state.lock();
        if state.completed || state.closed || state.pending_error.is_some() {
            return;
        }
        state.pending_error = Some(err);
        state.wake_consumer();
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed
    }
}

impl<T: Send + 'static> QueuePusher<T> {
    /// A receiver that feeds this queue, acknowledging with the push
    /// backpressure future so upstream readiness tracks consumer demand.
    pub fn receiver(&self) -> Receiver<T> {
        let push = self.clone();
        let error = self.clone();
        let complete = self.clone();
        Receiver::raw(move |emission| {
            let done = push.push(emission);
            if done.is_done() {
                Ack::Now
            } else {
                Ack::Later(done.boxed())
            }
        })
        .on_error(move |err| error.error(err))
        .on_complete(move || complete.complete())
    }
}

/// Backpressure future of a single push.
#[must_use = "futures do nothing unless polled"]
pub struct PushDone<T> {
    state: Arc<Mutex<QueueState<T>>>,
    pos: Option<u64>,
}

impl<T> PushDone<T> {
    /// True when the push was acknowledged at push time.
    pub fn is_done(&self) -> bool {
        self.pos.is_none()
    }
}

impl<T> Future for PushDone<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let pos = match self.pos {
            None => return Poll::Ready(()),
            Some(pos) => pos,
        };
        let mut state = self.state.lock();
        if state.closed || state.taken_pos > pos {
            return Poll::Ready(());
        }
        match state.producer_wakers.iter_mut().find(|(p, _)| *p == pos) {
            Some(entry) => entry.1 = cx.waker().clone(),
            None => state.producer_wakers.push((pos, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl<T> Emissions<T> {
    /// Stamp of the most recently dequeued emission; consumers use it to
    /// restore the ambient stamp when forwarding.
    pub fn last_stamp(&self) -> Option<Stamp> {
        self.state.lock().last_stamp
    }

    /// Attach the subscription owning the producer side, cancelled when
    /// this iterator is closed.
    pub fn set_subscription(&mut self, subscription: Subscription) {
        let closed = {
            let mut state = self.state.lock();
            if state.closed {
                true
            } else {
                state.subscription = Some(subscription.clone());
                false
            }
        };
        if closed {
            subscription.unsubscribe();
        }
    }

    fn connect_if_needed(&mut self) {
        // Never hold the lock while connecting: registration may push
        // synchronously (behavior mirror, replay).
        let connect = self.state.lock().connect.take();
        if let Some(connect) = connect {
            let pusher = QueuePusher {
                state: self.state.clone(),
            };
            let subscription = connect(pusher);
            self.set_subscription(subscription);
        }
    }

    /// Synchronous drain variant: `Pending` when neither a value nor a
    /// terminal is available right now.
    pub fn try_next(&mut self) -> Poll<Option<Result<Emission<T>, StreamError>>> {
        self.connect_if_needed();
        let (result, finished) = {
            let mut state = self.state.lock();
            if let Some((pos, emission)) = state.buffer.pop_front() {
                state.taken_pos = pos + 1;
                state.last_stamp = Some(emission.stamp);
                state.wake_producers_up_to(pos + 1);
                (Poll::Ready(Some(Ok(emission))), false)
            } else if let Some(err) = state.pending_error.take() {
                state.completed = true;
                (Poll::Ready(Some(Err(err))), true)
            } else if state.completed {
                (Poll::Ready(None), true)
            } else {
                (Poll::Pending, false)
            }
        };
        if finished {
            self.close();
        }
        result
    }

    /// Flip completed, release all backpressure waiters, unsubscribe from
    /// the source. Idempotent.
    pub fn close(&mut self) {
        let (subscription, wakers) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.completed = true;
            state.buffer.clear();
            state.connect = None;
            (state.subscription.take(), state.release_all_producers())
        };
        for waker in wakers {
            waker.wake();
        }
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

impl<T> futures::Stream for Emissions<T> {
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.connect_if_needed();
        match this.try_next() {
            Poll::Ready(item) => Poll::Ready(item),
            Poll::Pending => {
                let mut state = this.state.lock();
                // Re-check under the lock: a push may have landed between
                // the drain attempt and the waker registration.
                if state.buffer.is_empty() && state.pending_error.is_none() && !state.completed {
                    state.consumer_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                drop(state);
                this.try_next()
            }
        }
    }
}

impl<T> Unpin for Emissions<T> {}

impl<T> Drop for Emissions<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::next_stamp;
    use futures::{FutureExt, StreamExt};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn em(value: i32) -> Emission<i32> {
        Emission::new(value, next_stamp())
    }

    #[tokio::test]
    async fn values_arrive_in_push_order() {
        let (pusher, mut emissions) = emission_queue();
        let _ = pusher.push(em(1));
        let _ = pusher.push(em(2));
        pusher.complete();
        assert_eq!(emissions.next().await.unwrap().unwrap().value, 1);
        assert_eq!(emissions.next().await.unwrap().unwrap().value, 2);
        assert!(emissions.next().await.is_none());
    }

    #[tokio::test]
    async fn push_backpressure_resolves_on_dequeue() {
        let (pusher, mut emissions) = emission_queue();
        let mut done = pusher.push(em(1));
        assert!(!done.is_done());
        assert!((&mut done).now_or_never().is_none());
        assert_eq!(emissions.next().await.unwrap().unwrap().value, 1);
        assert!(done.now_or_never().is_some());
    }

    #[tokio::test]
    async fn push_to_a_parked_consumer_acks_immediately() {
        let (pusher, mut emissions) = emission_queue::<i32>();
        let handle = tokio::spawn(async move { emissions.next().await.unwrap().unwrap().value });
        tokio::task::yield_now().await;
        let done = pusher.push(em(5));
        assert!(done.is_done());
        assert_eq!(handle.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn buffered_values_drain_before_a_pending_error() {
        let (pusher, mut emissions) = emission_queue();
        let _ = pusher.push(em(1));
        pusher.error(StreamError::NoElements);
        assert_eq!(emissions.next().await.unwrap().unwrap().value, 1);
        assert!(emissions.next().await.unwrap().is_err());
        assert!(emissions.next().await.is_none());
    }

    #[tokio::test]
    async fn completion_is_sticky() {
        let (pusher, mut emissions) = emission_queue::<i32>();
        pusher.complete();
        let _ = pusher.push(em(1));
        assert!(emissions.next().await.is_none());
    }

    #[tokio::test]
    async fn close_releases_backpressure_and_unsubscribes() {
        let (pusher, mut emissions) = emission_queue();
        let cancelled = Arc::new(Mutex::new(false));
        let c = cancelled.clone();
        emissions.set_subscription(Subscription::new(move || *c.lock() = true));
        let mut done = pusher.push(em(1));
        let _ = pusher.push(em(2));
        assert!((&mut done).now_or_never().is_none());
        emissions.close();
        assert!(done.now_or_never().is_some());
        crate::scheduler::global().flush().await;
        assert!(*cancelled.lock());
        assert!(pusher.is_closed());
    }

    #[tokio::test]
    async fn lazy_queues_connect_on_first_pull() {
        let connected = Arc::new(Mutex::new(false));
        let c = connected.clone();
        let (pusher, mut emissions) = lazy_emission_queue::<i32>(move |_pusher| {
            *c.lock() = true;
            Subscription::noop()
        });
        assert!(!*connected.lock());
        let _ = pusher.push(em(1));
        assert_eq!(emissions.next().await.unwrap().unwrap().value, 1);
        assert!(*connected.lock());
    }

    #[tokio::test]
    async fn try_next_reports_pending_values_and_terminals() {
        let (pusher, mut emissions) = emission_queue();
        assert!(emissions.try_next().is_pending());
        let _ = pusher.push(em(1));
        match emissions.try_next() {
            Poll::Ready(Some(Ok(emission))) => assert_eq!(emission.value, 1),
            other => panic!("unexpected {:?}", other.map(|o| o.map(|r| r.map(|e| e.value)))),
        }
        pusher.complete();
        assert!(matches!(emissions.try_next(), Poll::Ready(None)));
    }

    #[test]
    fn an_empty_queue_is_pending_at_the_poll_level() {
        let (_pusher, mut emissions) = emission_queue::<i32>();
        futures_test::assert_stream_pending!(emissions);
    }

    #[test]
    fn push_backpressure_wakes_the_producer_on_dequeue() {
        use std::future::Future;
        use std::sync::atomic::{AtomicBool, Ordering};

        let woken = Arc::new(AtomicBool::new(false));
        let w = woken.clone();
        let waker = waker_fn::waker_fn(move || w.store(true, Ordering::SeqCst));
        let mut cx = Context::from_waker(&waker);
        let (pusher, mut emissions) = emission_queue();
        let mut done = pusher.push(em(1));
        assert!(Pin::new(&mut done).poll(&mut cx).is_pending());
        assert!(matches!(emissions.try_next(), Poll::Ready(Some(Ok(_)))));
        assert!(woken.load(Ordering::SeqCst));
        assert!(Pin::new(&mut done).poll(&mut cx).is_ready());
    }

    #[tokio::test]
    async fn last_stamp_tracks_the_dequeued_emission() {
        let (pusher, mut emissions) = emission_queue();
        let emission = em(1);
        let stamp = emission.stamp;
        let _ = pusher.push(emission);
        assert_eq!(emissions.last_stamp(), None);
        let _ = emissions.next().await;
        assert_eq!(emissions.last_stamp(), Some(stamp));
    }
}
