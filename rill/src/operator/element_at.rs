use super::{retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError};
use futures::StreamExt;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Emit only the value at the given 0-based position, then complete.
/// A negative index errors with "Invalid index"; completing before the
/// position is reached errors with "No elements in sequence".
pub struct ElementAt {
    index: i64,
}

pub fn element_at(index: i64) -> ElementAt {
    ElementAt { index }
}

impl<T> Operator<T> for ElementAt
where
    T: Send + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "elementAt"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        ElementAtStream {
            upstream: Some(upstream),
            target: self.index,
            position: 0,
            finished: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct ElementAtStream<T> {
    upstream: Option<Flow<T>>,
    target: i64,
    position: u64,
    finished: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> futures::Stream for ElementAtStream<T>
where
    T: Send + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.target < 0 {
            this.finished = true;
            this.upstream = None;
            return Poll::Ready(Some(Err(StreamError::InvalidIndex)));
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
                Poll::Ready(Some(Ok(emission))) => {
                    let position = this.position;
                    this.position += 1;
                    if position == this.target as u64 {
                        this.finished = true;
                        this.upstream = None;
                        let emission =
                            retag_transform(emission, &this.ctx, this.index, "elementAt");
                        return Poll::Ready(Some(Ok(emission)));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    this.upstream = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    this.upstream = None;
                    return Poll::Ready(Some(Err(StreamError::NoElements)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
