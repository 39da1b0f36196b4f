use super::{retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError};
use futures::{stream, stream::BoxStream, StreamExt};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

type IndexSource = Arc<dyn Fn() -> BoxStream<'static, u64> + Send + Sync>;

/// Pick the upstream values at the positions produced by an increasing
/// index iterator; complete when the index iterator completes.
pub struct Select {
    indices: IndexSource,
}

pub fn select<I>(indices: I) -> Select
where
    I: IntoIterator<Item = u64> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    Select {
        indices: Arc::new(move || stream::iter(indices.clone()).boxed()),
    }
}

/// `select` with an asynchronous index iterator.
pub fn select_stream<S, F>(indices: F) -> Select
where
    S: futures::Stream<Item = u64> + Send + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    Select {
        indices: Arc::new(move || indices().boxed()),
    }
}

impl<T> Operator<T> for Select
where
    T: Send + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "select"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        SelectStream {
            upstream,
            indices: (self.indices)(),
            expected: None,
            position: 0,
            done: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct SelectStream<T> {
    upstream: Flow<T>,
    indices: BoxStream<'static, u64>,
    expected: Option<u64>,
    position: u64,
    done: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> futures::Stream for SelectStream<T>
where
    T: Send + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            if this.expected.is_none() {
                match this.indices.poll_next_unpin(cx) {
                    Poll::Ready(Some(index)) => this.expected = Some(index),
                    Poll::Ready(None) => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => {
                    let position = this.position;
                    this.position += 1;
                    if Some(position) == this.expected {
                        this.expected = None;
                        let emission = retag_transform(emission, &this.ctx, this.index, "select");
                        return Poll::Ready(Some(Ok(emission)));
                    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scheduler, subject::create_subject};
    use parking_lot::Mutex;

    async fn settle() {
        scheduler::global().flush().await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn picks_the_requested_positions() {
        let subject = create_subject::<&'static str>();
        let some = subject.pipe(select(vec![0u64, 2, 3]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = some.subscribe(move |v| s.lock().push(v));
        for v in ["a", "b", "c", "d", "e"] {
            subject.next(v);
        }
        subject.complete();
        settle().await;
        assert_eq!(*seen.lock(), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn completes_when_the_index_iterator_is_exhausted() {
        let subject = create_subject::<i32>();
        let one = subject.pipe(select(vec![1u64]));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());
        let _sub = one.subscribe_with(
            crate::receiver::Receiver::next(move |v: i32| l1.lock().push(format!("next {}", v)))
                .on_complete(move || l2.lock().push("complete".to_owned())),
        );
        subject.next(10);
        subject.next(20);
        subject.next(30);
        settle().await;
        assert_eq!(*log.lock(), vec!["next 20".to_owned(), "complete".to_owned()]);
    }
}
