use super::{Flow, Operator, OperatorKind};
use crate::{
    context::PipelineContext,
    convert::IntoStream,
    emission::{Emission, ValueTag},
    error::StreamError,
};
use futures::{stream::SelectAll, StreamExt};
use std::{
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Project each upstream value into an inner stream and merge all inner
/// streams concurrently. Downstream completes once the outer stream and
/// every inner stream have completed; the first error anywhere terminates
/// downstream and cancels the rest.
pub struct MergeMap<F, S, R> {
    project: Arc<F>,
    _marker: PhantomData<fn() -> (S, R)>,
}

pub fn merge_map<In, R, S, F>(project: F) -> MergeMap<F, S, R>
where
    In: Send + 'static,
    R: Clone + Send + 'static,
    S: IntoStream<R>,
    F: Fn(In, usize) -> S + Send + Sync + 'static,
{
    MergeMap {
        project: Arc::new(project),
        _marker: PhantomData,
    }
}

impl<In, R, S, F> Operator<In> for MergeMap<F, S, R>
where
    In: Send + 'static,
    R: Clone + Send + 'static,
    S: IntoStream<R>,
    F: Fn(In, usize) -> S + Send + Sync + 'static,
{
    type Out = R;

    fn name(&self) -> &str {
        "mergeMap"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Expand
    }

    fn apply(&self, upstream: Flow<In>, ctx: Arc<PipelineContext>, index: usize) -> Flow<R> {
        MergeMapStream {
            upstream: Some(upstream),
            project: self.project.clone(),
            inners: SelectAll::new(),
            counter: 0,
            finished: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct MergeMapStream<In, F, R> {
    /// `None` once the outer stream has terminated or been cancelled.
    upstream: Option<Flow<In>>,
    project: Arc<F>,
    inners: SelectAll<Flow<R>>,
    counter: usize,
    finished: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<In, R, S, F> futures::Stream for MergeMapStream<In, F, R>
where
    In: Send + 'static,
    R: Clone + Send + 'static,
    S: IntoStream<R>,
    F: Fn(In, usize) -> S + Send + Sync + 'static,
{
    type Item = Result<Emission<R>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        // admit new inner streams first
        let mut outer_done = this.upstream.is_none();
        if let Some(upstream) = this.upstream.as_mut() {
            loop {
                match upstream.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(emission))) => {
                        let ordinal = this.counter;
                        this.counter += 1;
                        let Emission { value, tag, .. } = emission;
                        let inner = (this.project)(value, ordinal).into_stream();
                        let mut flow = inner.emissions();
                        if this.ctx.traces_values() {
                            if let Some(base) = tag.as_ref().map(|t| t.value_id) {
                                let ctx = this.ctx.clone();
                                let index = this.index;
                                flow = flow
                                    .map(move |item| {
                                        item.map(|em| {
                                            let tag = ValueTag::expand(base, index, "mergeMap");
                                            ctx.observe(&tag);
                                            Emission {
                                                value: em.value,
                                                stamp: em.stamp,
                                                tag: Some(tag),
                                            }
                                        })
                                    })
                                    .boxed();
                            }
                        }
                        this.inners.push(flow);
                    }
                    Poll::Ready(Some(Err(err))) => {
                        this.finished = true;
                        this.upstream = None;
                        this.inners = SelectAll::new();
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        outer_done = true;
                        this.upstream = None;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }
        match this.inners.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(emission))) => Poll::Ready(Some(Ok(emission))),
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                this.upstream = None;
                this.inners = SelectAll::new();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if outer_done {
                    this.finished = true;
                    Poll::Ready(None)
                } else {
                    // terminated SelectAll; a fresh one serves future inners
                    this.inners = SelectAll::new();
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
