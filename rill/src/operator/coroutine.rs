use super::{Flow, Operator, OperatorKind};
use crate::{
    context::PipelineContext,
    emission::{Emission, ValueTag},
    error::StreamError,
};
use futures::{
    future::BoxFuture,
    stream::FuturesOrdered,
    FutureExt, StreamExt,
};
use rill_pool::TaskRunner;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Offload each value to a [`TaskRunner`] (typically a worker pool) and
/// emit the results in upstream order.
pub struct Coroutine<In, Out> {
    runner: Arc<dyn TaskRunner<In = In, Out = Out>>,
}

pub fn coroutine<In, Out>(
    runner: impl TaskRunner<In = In, Out = Out> + 'static,
) -> Coroutine<In, Out> {
    Coroutine {
        runner: Arc::new(runner),
    }
}

impl<In, Out> Operator<In> for Coroutine<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Out = Out;

    fn name(&self) -> &str {
        "coroutine"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Transform
    }

    fn apply(&self, upstream: Flow<In>, ctx: Arc<PipelineContext>, index: usize) -> Flow<Out> {
        CoroutineStream {
            upstream: Some(upstream),
            runner: self.runner.clone(),
            in_flight: FuturesOrdered::new(),
            finished: false,
            ctx,
            index,
        }
        .boxed()
    }
}

type TaskFuture<Out> = BoxFuture<'static, Result<Emission<Out>, StreamError>>;

struct CoroutineStream<In, Out> {
    upstream: Option<Flow<In>>,
    runner: Arc<dyn TaskRunner<In = In, Out = Out>>,
    in_flight: FuturesOrdered<TaskFuture<Out>>,
    finished: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<In, Out> futures::Stream for CoroutineStream<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Item = Result<Emission<Out>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let mut outer_done = this.upstream.is_none();
        if let Some(upstream) = this.upstream.as_mut() {
            loop {
                match upstream.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(emission))) => {
                        let Emission { value, stamp, tag } = emission;
                        let task = this.runner.run(value);
                        let out_tag = tag
                            .as_ref()
                            .map(|input| ValueTag::transform(input, this.index, "coroutine"));
                        let ctx = this.ctx.clone();
                        this.in_flight.push(
                            async move {
                                match task.await {
                                    Ok(value) => {
                                        if let Some(tag) = &out_tag {
                                            ctx.observe(tag);
                                        }
                                        Ok(Emission {
                                            value,
                                            stamp,
                                            tag: out_tag,
                                        })
                                    }
                                    Err(err) => Err(StreamError::app(err)),
                                }
                            }
                            .boxed(),
                        );
                    }
                    Poll::Ready(Some(Err(err))) => {
                        this.finished = true;
                        this.upstream = None;
                        this.in_flight = FuturesOrdered::new();
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
        match this.in_flight.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(emission))) => Poll::Ready(Some(Ok(emission))),
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                this.upstream = None;
                this.in_flight = FuturesOrdered::new();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if outer_done {
                    this.finished = true;
                    Poll::Ready(None)
                } else {
                    this.in_flight = FuturesOrdered::new();
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
