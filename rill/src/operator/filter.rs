use super::{notify_phantom, retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError};
use futures::{future::BoxFuture, StreamExt};
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

enum Test<T> {
    Sync(Arc<dyn Fn(&T) -> bool + Send + Sync>),
    Async(Arc<dyn Fn(&T) -> BoxFuture<'static, bool> + Send + Sync>),
}

impl<T> Clone for Test<T> {
    fn clone(&self) -> Self {
        match self {
            Test::Sync(f) => Test::Sync(f.clone()),
            Test::Async(f) => Test::Async(f.clone()),
        }
    }
}

/// Keep values matching a predicate; dropped values surface as phantoms.
pub struct Filter<T> {
    test: Test<T>,
}

pub fn filter<T>(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Filter<T> {
    Filter {
        test: Test::Sync(Arc::new(predicate)),
    }
}

/// Filter with a predicate resolving asynchronously per value.
pub fn filter_async<T>(
    predicate: impl Fn(&T) -> BoxFuture<'static, bool> + Send + Sync + 'static,
) -> Filter<T> {
    Filter {
        test: Test::Async(Arc::new(predicate)),
    }
}

/// Keep values strictly equal to `value`.
pub fn filter_value<T>(value: T) -> Filter<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    filter(move |candidate| *candidate == value)
}

/// Keep values that are members of `values`.
pub fn filter_one_of<T>(values: Vec<T>) -> Filter<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    filter(move |candidate| values.contains(candidate))
}

impl<T> Operator<T> for Filter<T>
where
    T: fmt::Debug + Send + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "filter"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        FilterStream {
            upstream,
            test: self.test.clone(),
            pending: None,
            done: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct FilterStream<T> {
    upstream: Flow<T>,
    test: Test<T>,
    /// Emission waiting on an async predicate.
    pending: Option<(Emission<T>, BoxFuture<'static, bool>)>,
    done: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> futures::Stream for FilterStream<T>
where
    T: fmt::Debug + Send + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            if let Some((emission, mut fut)) = this.pending.take() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(pass) => {
                        if pass {
                            let emission =
                                retag_transform(emission, &this.ctx, this.index, "filter");
                            return Poll::Ready(Some(Ok(emission)));
                        }
                        notify_phantom(&this.ctx, this.index, "filter", &emission);
                    }
                    Poll::Pending => {
                        this.pending = Some((emission, fut));
                        return Poll::Pending;
                    }
                }
            }
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => match &this.test {
                    Test::Sync(predicate) => {
                        if predicate(&emission.value) {
                            let emission =
                                retag_transform(emission, &this.ctx, this.index, "filter");
                            return Poll::Ready(Some(Ok(emission)));
                        }
                        notify_phantom(&this.ctx, this.index, "filter", &emission);
                    }
                    Test::Async(predicate) => {
                        let fut = predicate(&emission.value);
                        this.pending = Some((emission, fut));
                    }
                },
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
