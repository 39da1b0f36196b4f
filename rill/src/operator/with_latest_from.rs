use super::{retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError, stream::Stream};
use futures::StreamExt;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Gated combiner: every source emission is paired with the auxiliary
/// stream's latest value, but nothing is emitted until the auxiliary has
/// emitted at least once. Auxiliary errors abort the operator; auxiliary
/// completion only freezes the latest value.
pub struct WithLatestFrom<U> {
    other: Stream<U>,
}

pub fn with_latest_from<U: Clone + Send + 'static>(other: &Stream<U>) -> WithLatestFrom<U> {
    WithLatestFrom {
        other: other.clone(),
    }
}

impl<T, U> Operator<T> for WithLatestFrom<U>
where
    T: Send + 'static,
    U: Clone + Send + Sync + 'static,
{
    type Out = (T, U);

    fn name(&self) -> &str {
        "withLatestFrom"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Transform
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<(T, U)> {
        WithLatestFromStream {
            upstream: Some(upstream),
            aux: Some(self.other.emissions()),
            latest: None,
            finished: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct WithLatestFromStream<T, U> {
    upstream: Option<Flow<T>>,
    aux: Option<Flow<U>>,
    latest: Option<U>,
    finished: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T, U> futures::Stream for WithLatestFromStream<T, U>
where
    T: Send + 'static,
    U: Clone + Send + Sync + 'static,
{
    type Item = Result<Emission<(T, U)>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.finished {
            return Poll::Ready(None);
        }
        // keep the auxiliary's latest value fresh
        let mut aux_done = false;
        let mut aux_error = None;
        if let Some(aux) = this.aux.as_mut() {
            loop {
                match aux.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(emission))) => this.latest = Some(emission.value),
                    Poll::Ready(Some(Err(err))) => {
                        aux_error = Some(err);
                        break;
                    }
                    Poll::Ready(None) => {
                        aux_done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }
        if let Some(err) = aux_error {
            this.finished = true;
            this.upstream = None;
            this.aux = None;
            return Poll::Ready(Some(Err(err)));
        }
        if aux_done {
            this.aux = None;
        }
        let upstream = match this.upstream.as_mut() {
            Some(upstream) => upstream,
            None => {
                this.finished = true;
                return Poll::Ready(None);
            }
        };
        loop {
            match upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => match this.latest.clone() {
                    Some(aux_value) => {
                        let emission = emission.map(|value| (value, aux_value));
                        let emission =
                            retag_transform(emission, &this.ctx, this.index, "withLatestFrom");
                        return Poll::Ready(Some(Ok(emission)));
                    }
                    // gated until the auxiliary has emitted once
                    None => continue,
                },
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    this.aux = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    this.aux = None;
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
    use crate::{receiver::Receiver, scheduler, subject::create_subject};
    use parking_lot::Mutex;

    async fn settle() {
        scheduler::global().flush().await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn emissions_are_gated_until_the_auxiliary_fires() {
        let source = create_subject::<&'static str>();
        let aux = create_subject::<i32>();
        let paired = source.pipe(with_latest_from(aux.stream()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = paired.subscribe(move |v| s.lock().push(v));
        source.next("a");
        settle().await;
        aux.next(1);
        settle().await;
        source.next("b");
        settle().await;
        assert_eq!(*seen.lock(), vec![("b", 1)]);
    }

    #[tokio::test]
    async fn every_source_emission_after_the_gate_produces_one_tuple() {
        let source = create_subject::<i32>();
        let aux = create_subject::<&'static str>();
        let paired = source.pipe(with_latest_from(aux.stream()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = paired.subscribe(move |v| s.lock().push(v));
        aux.next("x");
        settle().await;
        source.next(1);
        source.next(2);
        settle().await;
        aux.next("y");
        settle().await;
        source.next(3);
        settle().await;
        assert_eq!(*seen.lock(), vec![(1, "x"), (2, "x"), (3, "y")]);
    }

    #[tokio::test]
    async fn auxiliary_completion_freezes_the_latest_value() {
        let source = create_subject::<i32>();
        let aux = create_subject::<&'static str>();
        let paired = source.pipe(with_latest_from(aux.stream()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = paired.subscribe(move |v| s.lock().push(v));
        aux.next("x");
        aux.complete();
        settle().await;
        source.next(1);
        settle().await;
        assert_eq!(*seen.lock(), vec![(1, "x")]);
    }

    #[tokio::test]
    async fn auxiliary_errors_abort_immediately() {
        let source = create_subject::<i32>();
        let aux = create_subject::<i32>();
        let paired = source.pipe(with_latest_from(aux.stream()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let _sub = paired.subscribe_with(
            Receiver::<(i32, i32)>::new().on_error(move |err| e.lock().push(err.to_string())),
        );
        aux.error(StreamError::NoElements);
        settle().await;
        assert_eq!(*errors.lock(), vec!["No elements in sequence".to_owned()]);
    }
}
