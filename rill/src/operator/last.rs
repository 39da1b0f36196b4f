use super::{Flow, Operator, OperatorKind};
use crate::{
    context::PipelineContext,
    emission::{Emission, ValueTag},
    error::StreamError,
};
use futures::StreamExt;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Remember the most recent (matching) value and emit it on upstream
/// completion; an empty match errors with "No elements in sequence".
pub struct Last<T> {
    predicate: Option<Predicate<T>>,
}

pub fn last<T>() -> Last<T> {
    Last { predicate: None }
}

pub fn last_where<T>(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Last<T> {
    Last {
        predicate: Some(Arc::new(predicate)),
    }
}

impl<T> Operator<T> for Last<T>
where
    T: Send + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "last"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Collapse
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        LastStream {
            upstream,
            predicate: self.predicate.clone(),
            best: None,
            finished: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct LastStream<T> {
    upstream: Flow<T>,
    predicate: Option<Predicate<T>>,
    best: Option<Emission<T>>,
    finished: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> futures::Stream for LastStream<T>
where
    T: Send + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => {
                    let matches = this
                        .predicate
                        .as_ref()
                        .map(|p| p(&emission.value))
                        .unwrap_or(true);
                    if matches {
                        this.best = Some(emission);
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return match this.best.take() {
                        Some(emission) => {
                            let tag = emission.tag.as_ref().map(|input| {
                                let tag = ValueTag::collapse(
                                    vec![input.value_id],
                                    this.index,
                                    "last",
                                );
                                this.ctx.observe(&tag);
                                tag
                            });
                            Poll::Ready(Some(Ok(Emission {
                                value: emission.value,
                                stamp: emission.stamp,
                                tag,
                            })))
                        }
                        None => Poll::Ready(Some(Err(StreamError::NoElements))),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{receiver::Receiver, scheduler, subject::create_subject};
    use parking_lot::Mutex;

    async fn settle() {
        scheduler::global().flush().await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn the_final_value_wins() {
        let subject = create_subject::<i32>();
        let tail = subject.pipe(last());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = tail.subscribe(move |v| s.lock().push(v));
        for v in [1, 2, 3] {
            subject.next(v);
        }
        subject.complete();
        settle().await;
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[tokio::test]
    async fn predicate_narrows_the_candidates() {
        let subject = create_subject::<i32>();
        let tail = subject.pipe(last_where(|v: &i32| v % 2 == 0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = tail.subscribe(move |v| s.lock().push(v));
        for v in [1, 2, 4, 5] {
            subject.next(v);
        }
        subject.complete();
        settle().await;
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[tokio::test]
    async fn empty_sequences_error() {
        let subject = create_subject::<i32>();
        let tail = subject.pipe(last());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let _sub = tail.subscribe_with(
            Receiver::<i32>::new().on_error(move |err| e.lock().push(err.to_string())),
        );
        subject.complete();
        settle().await;
        assert_eq!(*errors.lock(), vec!["No elements in sequence".to_owned()]);
    }
}
