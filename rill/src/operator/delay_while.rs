use super::{retag_transform, Flow, Operator, OperatorKind};
use crate::{context::PipelineContext, emission::Emission, error::StreamError, stream::Stream};
use futures::StreamExt;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Hold emissions back while the gate's latest value is `true`, flushing
/// them in order once it turns `false`. The gate starts open; upstream
/// completion flushes whatever is still held.
pub struct DelayWhile {
    gate: Stream<bool>,
}

pub fn delay_while(gate: &Stream<bool>) -> DelayWhile {
    DelayWhile { gate: gate.clone() }
}

impl<T> Operator<T> for DelayWhile
where
    T: Send + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "delayWhile"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Transform
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        DelayWhileStream {
            upstream: Some(upstream),
            gate: Some(self.gate.emissions()),
            holding: false,
            buffer: VecDeque::new(),
            finished: false,
            ctx,
            index,
        }
        .boxed()
    }
}

struct DelayWhileStream<T> {
    upstream: Option<Flow<T>>,
    gate: Option<Flow<bool>>,
    holding: bool,
    buffer: VecDeque<Emission<T>>,
    finished: bool,
    ctx: Arc<PipelineContext>,
    index: usize,
}

impl<T> futures::Stream for DelayWhileStream<T>
where
    T: Send + 'static,
{
    type Item = Result<Emission<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.finished {
            return Poll::Ready(None);
        }
        let mut gate_done = false;
        let mut gate_error = None;
        if let Some(gate) = this.gate.as_mut() {
            loop {
                match gate.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(emission))) => this.holding = emission.value,
                    Poll::Ready(Some(Err(err))) => {
                        gate_error = Some(err);
                        break;
                    }
                    Poll::Ready(None) => {
                        gate_done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }
        if let Some(err) = gate_error {
            this.finished = true;
            this.upstream = None;
            this.gate = None;
            this.buffer.clear();
            return Poll::Ready(Some(Err(err)));
        }
        if gate_done {
            this.gate = None;
        }
        let mut upstream_done = this.upstream.is_none();
        if let Some(upstream) = this.upstream.as_mut() {
            loop {
                match upstream.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(emission))) => this.buffer.push_back(emission),
                    Poll::Ready(Some(Err(err))) => {
                        this.finished = true;
                        this.gate = None;
                        this.buffer.clear();
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        upstream_done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }
        if upstream_done {
            this.upstream = None;
        }
        if !this.holding || upstream_done {
            if let Some(emission) = this.buffer.pop_front() {
                let emission = retag_transform(emission, &this.ctx, this.index, "delayWhile");
                return Poll::Ready(Some(Ok(emission)));
            }
        }
        if upstream_done && this.buffer.is_empty() {
            this.finished = true;
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scheduler, subject::create_subject};
    use parking_lot::Mutex;

    async fn settle() {
        scheduler::global().flush().await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn values_pass_while_the_gate_is_open() {
        let source = create_subject::<i32>();
        let gate = create_subject::<bool>();
        let gated = source.pipe(delay_while(gate.stream()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = gated.subscribe(move |v| s.lock().push(v));
        source.next(1);
        settle().await;
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn a_closed_gate_buffers_until_it_reopens() {
        let source = create_subject::<i32>();
        let gate = create_subject::<bool>();
        let gated = source.pipe(delay_while(gate.stream()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = gated.subscribe(move |v| s.lock().push(v));
        gate.next(true);
        settle().await;
        source.next(1);
        source.next(2);
        settle().await;
        assert!(seen.lock().is_empty());
        gate.next(false);
        settle().await;
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn completion_flushes_held_values() {
        let source = create_subject::<i32>();
        let gate = create_subject::<bool>();
        let gated = source.pipe(delay_while(gate.stream()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = gated.subscribe(move |v| s.lock().push(v));
        gate.next(true);
        settle().await;
        source.next(1);
        source.complete();
        settle().await;
        assert_eq!(*seen.lock(), vec![1]);
    }
}
