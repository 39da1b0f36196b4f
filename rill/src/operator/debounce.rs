use super::{notify_phantom, retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError};
use futures::StreamExt;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Sleep;

/// Trailing-edge debounce: each upstream value restarts the timer, only the
/// value that survives `duration` of silence is emitted. On upstream
/// completion a buffered value is flushed immediately.
pub struct Debounce {
    duration: Duration,
}

pub fn debounce(duration: Duration) -> Debounce {
    Debounce { duration }
}

impl<T> Operator<T> for Debounce
where
    T: fmt::Debug + Send + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "debounce"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        DebounceStream {
            upstream,
            duration: self.duration,
            latest: None,
            sleep: None,
            upstream_done: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct DebounceStream<T> {
    upstream: Flow<T>,
    duration: Duration,
    latest: Option<Emission<T>>,
    sleep: Option<Pin<Box<Sleep>>>,
    upstream_done: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> futures::Stream for DebounceStream<T>
where
    T: fmt::Debug + Send + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        while !this.upstream_done {
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => {
                    if let Some(superseded) = this.latest.take() {
                        notify_phantom(&this.ctx, this.index, "debounce", &superseded);
                    }
                    this.latest = Some(emission);
                    this.sleep = Some(Box::pin(tokio::time::sleep(this.duration)));
                }
                Poll::Ready(Some(Err(err))) => {
                    // errors cut through the timer
                    this.upstream_done = true;
                    this.latest = None;
                    this.sleep = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.upstream_done = true;
                    this.sleep = None;
                    // flush the buffered value before completing
                    if let Some(emission) = this.latest.take() {
                        let emission =
                            retag_transform(emission, &this.ctx, this.index, "debounce");
                        return Poll::Ready(Some(Ok(emission)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => break,
            }
        }
        if this.upstream_done {
            return Poll::Ready(None);
        }
        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                this.sleep = None;
                if let Some(emission) = this.latest.take() {
                    let emission = retag_transform(emission, &this.ctx, this.index, "debounce");
                    return Poll::Ready(Some(Ok(emission)));
                }
            }
        }
        Poll::Pending
    }
}
