use super::{notify_phantom, retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError};
use fnv::FnvHashSet;
use futures::StreamExt;
use std::{
    fmt,
    hash::Hash,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Emit a value only the first time its key is seen; later occurrences are
/// dropped as phantoms. The key set is per subscription and unbounded.
pub struct Unique<F> {
    key: Arc<F>,
}

pub fn unique<T>() -> Unique<impl Fn(&T) -> T + Send + Sync>
where
    T: Clone + Hash + Eq + Send + Sync + 'static,
{
    unique_by(|value: &T| value.clone())
}

pub fn unique_by<T, K, F>(key: F) -> Unique<F>
where
    F: Fn(&T) -> K + Send + Sync,
    K: Hash + Eq + Send,
{
    Unique { key: Arc::new(key) }
}

impl<T, K, F> Operator<T> for Unique<F>
where
    T: fmt::Debug + Send + 'static,
    K: Hash + Eq + Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "unique"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        UniqueStream {
            upstream,
            key: self.key.clone(),
            seen: FnvHashSet::default(),
            done: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct UniqueStream<T, K, F> {
    upstream: Flow<T>,
    key: Arc<F>,
    seen: FnvHashSet<K>,
    done: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T, K, F> futures::Stream for UniqueStream<T, K, F>
where
    T: fmt::Debug + Send + 'static,
    K: Hash + Eq + Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => {
                    if this.seen.insert((this.key)(&emission.value)) {
                        let emission = retag_transform(emission, &this.ctx, this.index, "unique");
                        return Poll::Ready(Some(Ok(emission)));
                    }
                    notify_phantom(&this.ctx, this.index, "unique", &emission);
                }
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
