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

/// Collect `size` upstream values, emit them as one array with a collapse
/// tag. A partial buffer is flushed on upstream completion.
pub struct BufferCount {
    size: usize,
}

pub fn buffer_count(size: usize) -> BufferCount {
    BufferCount { size: size.max(1) }
}

impl<T> Operator<T> for BufferCount
where
    T: Send + 'static,
{
    type Out = Vec<T>;

    fn name(&self) -> &str {
        "bufferCount"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Collapse
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<Vec<T>> {
        BufferCountStream {
            upstream,
            size: self.size,
            buffer: Vec::with_capacity(self.size),
            done: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct BufferCountStream<T> {
    upstream: Flow<T>,
    size: usize,
    buffer: Vec<Emission<T>>,
    done: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> BufferCountStream<T> {
    fn flush(&mut self) -> Emission<Vec<T>> {
        let inputs = self
            .buffer
            .iter()
            .filter_map(|emission| emission.value_id())
            .collect::<Vec<_>>();
        let stamp = self
            .buffer
            .last()
            .map(|emission| emission.stamp)
            .unwrap_or_else(crate::stamp::emission_stamp);
        let values = self
            .buffer
            .drain(..)
            .map(Emission::into_value)
            .collect::<Vec<_>>();
        let tag = (!inputs.is_empty()).then(|| {
            let tag = ValueTag::collapse(inputs, self.index, "bufferCount");
            self.ctx.observe(&tag);
            tag
        });
        Emission {
            value: values,
            stamp,
            tag,
        }
    }
}

impl<T> futures::Stream for BufferCountStream<T>
where
    T: Send + 'static,
{
    type Item = Result<Emission<Vec<T>>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(emission))) => {
                    this.buffer.push(emission);
                    if this.buffer.len() == this.size {
                        return Poll::Ready(Some(Ok(this.flush())));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    this.buffer.clear();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if !this.buffer.is_empty() {
                        return Poll::Ready(Some(Ok(this.flush())));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
