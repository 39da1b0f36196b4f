use crate::{
    error::StreamError,
    stream::{create_stream, Stream},
    subject::{BehaviorSubject, ReplaySubject, Subject},
};
use futures::{future::Either, stream, Future, FutureExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;

/// Normalization seam used by `merge_map` and friends: anything that can be
/// treated as a stream of `T` — a stream handle, a subject, a vector, or a
/// single value. Futures go through [`from_future`].
pub trait IntoStream<T> {
    fn into_stream(self) -> Stream<T>;
}

impl<T: Clone + Send + Sync + 'static> IntoStream<T> for T {
    fn into_stream(self) -> Stream<T> {
        from_value(self)
    }
}

impl<T: Clone + Send + 'static> IntoStream<T> for Stream<T> {
    fn into_stream(self) -> Stream<T> {
        self
    }
}

impl<T: Clone + Send + Sync + 'static> IntoStream<T> for Vec<T> {
    fn into_stream(self) -> Stream<T> {
        from_iter(self)
    }
}

impl<T: Clone + Send + 'static> IntoStream<T> for Subject<T> {
    fn into_stream(self) -> Stream<T> {
        self.stream().clone()
    }
}

impl<T: Clone + Send + 'static> IntoStream<T> for BehaviorSubject<T> {
    fn into_stream(self) -> Stream<T> {
        self.stream().clone()
    }
}

impl<T: Clone + Send + 'static> IntoStream<T> for ReplaySubject<T> {
    fn into_stream(self) -> Stream<T> {
        self.stream().clone()
    }
}

/// Stream over a cloneable iterable; restarts replay it from the start.
pub fn from_iter<T, I>(items: I) -> Stream<T>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    create_stream("fromIterable", move || stream::iter(items.clone()))
}

/// Single-value stream.
pub fn from_value<T: Clone + Send + Sync + 'static>(value: T) -> Stream<T> {
    create_stream("fromValue", move || stream::iter([value.clone()]))
}

/// Stream of the future's eventual value; the future runs once and its
/// result is shared across subscriptions.
pub fn from_future<F>(future: F) -> Stream<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Clone + Send + Sync + 'static,
{
    let shared = future.shared();
    create_stream("fromPromise", move || stream::once(shared.clone()))
}

/// Adapt a foreign `futures::Stream`. The inner stream can be consumed
/// once; a restarted generator is empty.
pub fn from_stream<S>(inner: S) -> Stream<S::Item>
where
    S: futures::Stream + Send + 'static,
    S::Item: Clone + Send + 'static,
{
    let cell = Arc::new(Mutex::new(Some(inner)));
    create_stream("fromStream", move || match cell.lock().take() {
        Some(inner) => Either::Left(inner),
        None => Either::Right(stream::empty()),
    })
}

/// Stream → plain async iterable of values; an `Err` item carries the
/// error terminal.
pub fn each_value_from<T: Send + 'static>(
    stream: &Stream<T>,
) -> impl futures::Stream<Item = Result<T, StreamError>> + Send + 'static {
    stream.emissions().map(|item| item.map(|em| em.value))
}

/// First value of the stream; `NoElements` when it completes empty.
pub async fn first_value_from<T: Send + 'static>(stream: &Stream<T>) -> Result<T, StreamError> {
    stream.query().await
}
