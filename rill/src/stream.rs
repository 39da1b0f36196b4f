use crate::{
    context::PipelineContext,
    emission::{Emission, ValueTag},
    error::StreamError,
    hooks::{self, PipeInfo, StreamInfo},
    operator::{Flow, Operator},
    queue::lazy_emission_queue,
    receiver::{Receiver, StrictReceiver},
    scheduler,
    stamp::{self, stamped, with_stamp},
    subscription::Subscription,
};
use futures::{channel::oneshot, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Stream,
    Subject,
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// The seam between the public handle and the three source families:
/// generator-backed multicast, subject-backed multicast, and piped unicast.
pub(crate) trait Source<T>: Send + Sync + 'static {
    /// Register a push receiver for this subscription.
    fn register(
        self: Arc<Self>,
        ctx: &Arc<PipelineContext>,
        receiver: StrictReceiver<T>,
    ) -> Subscription;

    /// Build the per-subscription pull iterator.
    fn flow(self: Arc<Self>, ctx: &Arc<PipelineContext>) -> Flow<T>;

    fn collect_operator_names(&self, _out: &mut Vec<String>) {}
}

/// Handle of a stream: an async-iterable factory with identity. Cloning
/// the handle shares the underlying source.
pub struct Stream<T> {
    id: u64,
    name: Arc<str>,
    kind: SourceKind,
    pub(crate) source: Arc<dyn Source<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            source: self.source.clone(),
        }
    }
}

impl<T: Send + 'static> Stream<T> {
    pub(crate) fn from_source(name: &str, kind: SourceKind, source: Arc<dyn Source<T>>) -> Self {
        let stream = Self {
            id: next_stream_id(),
            name: Arc::from(name),
            kind,
            source,
        };
        if let Some(hooks) = hooks::current() {
            hooks.on_create_stream(&StreamInfo {
                id: stream.id,
                name: stream.name.to_string(),
                kind,
            });
        }
        stream
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Subscribe with a plain value callback.
    pub fn subscribe(&self, f: impl FnMut(T) + Send + 'static) -> Subscription {
        self.subscribe_with(Receiver::next(f))
    }

    /// Subscribe with a full receiver trio.
    pub fn subscribe_with(&self, receiver: Receiver<T>) -> Subscription {
        let ctx = self.pipeline_context();
        self.source
            .clone()
            .register(&ctx, StrictReceiver::wrap(receiver))
    }

    /// Derive a new stream through an operator. Each subscription of the
    /// derived stream materializes its own source iterator and operator
    /// chain, so operator state is never shared.
    pub fn pipe<Op>(&self, op: Op) -> Stream<Op::Out>
    where
        Op: Operator<T> + 'static,
        Op::Out: Send + 'static,
    {
        let source = Arc::new(PipedSource {
            parent: self.clone(),
            op: Arc::new(op),
        });
        Stream {
            id: next_stream_id(),
            name: self.name.clone(),
            kind: SourceKind::Stream,
            source,
        }
    }

    /// Per-subscription async iterator over stamped emissions.
    pub fn emissions(&self) -> Flow<T> {
        let ctx = self.pipeline_context();
        self.source.clone().flow(&ctx)
    }

    /// First emitted value; `NoElements` on an empty stream.
    pub async fn query(&self) -> Result<T, StreamError> {
        let mut flow = self.emissions();
        match flow.next().await {
            Some(Ok(emission)) => Ok(emission.value),
            Some(Err(err)) => Err(err),
            None => Err(StreamError::NoElements),
        }
    }

    /// Alias of [`query`](Stream::query).
    pub async fn first(&self) -> Result<T, StreamError> {
        self.query().await
    }

    fn pipeline_context(&self) -> Arc<PipelineContext> {
        let ctx = PipelineContext::new(self.id, self.name.clone());
        let mut operators = Vec::new();
        self.source.collect_operator_names(&mut operators);
        if !operators.is_empty() {
            if let Some(hooks) = hooks::current() {
                let decoration = hooks.on_pipe_stream(&PipeInfo {
                    stream_id: self.id,
                    stream_name: self.name.to_string(),
                    subscription_id: ctx.subscription_id(),
                    operators,
                });
                if decoration.trace_values {
                    ctx.enable_value_tracing();
                }
                if let Some(phantom) = decoration.phantom {
                    ctx.set_phantom_handler(phantom);
                }
                if let Some(observer) = decoration.observer {
                    ctx.set_observer(observer);
                }
            }
        }
        ctx
    }
}

/// Create a generator-backed multicast stream. The generator starts on the
/// first subscriber, is aborted when the last one unsubscribes, and may
/// restart on a later subscription.
pub fn create_stream<T, S, F>(name: &str, factory: F) -> Stream<T>
where
    T: Clone + Send + 'static,
    S: futures::Stream<Item = T> + Send + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    create_result_stream(name, move || factory().map(Ok))
}

/// Like [`create_stream`] for generators that can fail; an `Err` item
/// terminates every subscriber with that error.
pub fn create_result_stream<T, S, F>(name: &str, factory: F) -> Stream<T>
where
    T: Clone + Send + 'static,
    S: futures::Stream<Item = Result<T, StreamError>> + Send + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    let source = Arc::new(GeneratorSource {
        factory: Box::new(move || factory().boxed()),
        state: Arc::new(Mutex::new(GenState {
            slots: Vec::new(),
            running: false,
            abort: None,
            next_slot_id: 0,
            epoch: 0,
        })),
    });
    Stream::from_source(name, SourceKind::Stream, source)
}

type Factory<T> = Box<dyn Fn() -> BoxStream<'static, Result<T, StreamError>> + Send + Sync>;

struct GeneratorSource<T> {
    factory: Factory<T>,
    state: Arc<Mutex<GenState<T>>>,
}

struct GenState<T> {
    slots: Vec<GenSlot<T>>,
    running: bool,
    abort: Option<oneshot::Sender<()>>,
    next_slot_id: u64,
    /// Bumped whenever a generator run logically ends, so a stale drive
    /// loop cannot clobber the state of a restarted run.
    epoch: u64,
}

struct GenSlot<T> {
    id: u64,
    receiver: Arc<Mutex<StrictReceiver<T>>>,
    subscription: Subscription,
    ctx: Arc<PipelineContext>,
}

impl<T> Clone for GenSlot<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            receiver: self.receiver.clone(),
            subscription: self.subscription.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for GeneratorSource<T> {
    fn register(
        self: Arc<Self>,
        ctx: &Arc<PipelineContext>,
        receiver: StrictReceiver<T>,
    ) -> Subscription {
        let receiver = Arc::new(Mutex::new(receiver));
        let (id, start) = {
            let mut state = self.state.lock();
            let id = state.next_slot_id;
            state.next_slot_id += 1;
            let start = if state.running {
                None
            } else {
                let (abort_tx, abort_rx) = oneshot::channel();
                state.running = true;
                state.abort = Some(abort_tx);
                Some((abort_rx, state.epoch))
            };
            (id, start)
        };

        let cleanup_state = self.state.clone();
        let cleanup_receiver = receiver.clone();
        let subscription = Subscription::new(move || {
            let abort = {
                let mut state = cleanup_state.lock();
                state.slots.retain(|slot| slot.id != id);
                if state.slots.is_empty() {
                    // the run is over as far as new subscribers are concerned
                    let abort = state.abort.take();
                    if abort.is_some() {
                        state.running = false;
                        state.epoch += 1;
                    }
                    abort
                } else {
                    None
                }
            };
            // imperative complete for the leaving receiver only
            cleanup_receiver.lock().complete();
            if let Some(abort) = abort {
                debug!("last subscriber left, aborting generator");
                let _ = abort.send(());
            }
        });

        self.state.lock().slots.push(GenSlot {
            id,
            receiver,
            subscription: subscription.clone(),
            ctx: ctx.clone(),
        });

        if let Some((abort_rx, epoch)) = start {
            let generator = (self.factory)();
            let state = self.state.clone();
            tokio::spawn(drive_generator(state, generator, abort_rx, epoch));
        }
        subscription
    }

    fn flow(self: Arc<Self>, ctx: &Arc<PipelineContext>) -> Flow<T> {
        let ctx = ctx.clone();
        // lazy: the source is not subscribed until the first pull
        let (_pusher, emissions) = lazy_emission_queue(move |pusher| {
            self.register(&ctx, StrictReceiver::wrap(pusher.receiver()))
        });
        emissions.boxed()
    }
}

async fn drive_generator<T: Clone + Send + 'static>(
    state: Arc<Mutex<GenState<T>>>,
    mut generator: BoxStream<'static, Result<T, StreamError>>,
    mut abort_rx: oneshot::Receiver<()>,
    epoch: u64,
) {
    loop {
        let item = tokio::select! {
            _ = &mut abort_rx => {
                trace!("generator aborted");
                break;
            }
            item = generator.next() => item,
        };
        match item {
            Some(Ok(value)) => {
                let stamp = stamp::emission_stamp();
                let slots = state.lock().slots.clone();
                let mut acks = Vec::new();
                with_stamp(stamp, || {
                    for slot in &slots {
                        if slot.subscription.unsubscribed() {
                            continue;
                        }
                        let tag = slot.ctx.traces_values().then(|| {
                            let tag = ValueTag::source(slot.ctx.stream_name());
                            slot.ctx.observe(&tag);
                            tag
                        });
                        let emission = Emission {
                            value: value.clone(),
                            stamp,
                            tag,
                        };
                        let ack = slot.receiver.lock().next(emission);
                        if !ack.is_now() {
                            acks.push(ack);
                        }
                    }
                });
                // per-receiver serialization before the next upstream value
                for ack in acks {
                    ack.wait().await;
                }
            }
            Some(Err(err)) => {
                let slots = finish(&state);
                for slot in &slots {
                    if !slot.subscription.unsubscribed() {
                        slot.receiver.lock().error(err.clone());
                    }
                }
                break;
            }
            None => {
                let slots = finish(&state);
                for slot in &slots {
                    if !slot.subscription.unsubscribed() {
                        slot.receiver.lock().complete();
                    }
                }
                break;
            }
        }
    }
    let mut state = state.lock();
    if state.epoch == epoch {
        state.running = false;
        state.abort = None;
        state.epoch += 1;
    }
}

/// Drain the subscriber list on a natural terminal; the generator will not
/// emit again, and a later subscriber restarts it from scratch.
fn finish<T>(state: &Arc<Mutex<GenState<T>>>) -> Vec<GenSlot<T>> {
    let mut state = state.lock();
    state.abort = None;
    state.running = false;
    state.epoch += 1;
    std::mem::take(&mut state.slots)
}

struct PipedSource<In, Op: Operator<In>> {
    parent: Stream<In>,
    op: Arc<Op>,
}

impl<In, Op> Source<Op::Out> for PipedSource<In, Op>
where
    In: Send + 'static,
    Op: Operator<In> + 'static,
    Op::Out: Send + 'static,
{
    fn register(
        self: Arc<Self>,
        ctx: &Arc<PipelineContext>,
        receiver: StrictReceiver<Op::Out>,
    ) -> Subscription {
        let mut flow = self.flow(ctx);
        let receiver = Arc::new(Mutex::new(receiver));
        let (abort_tx, mut abort_rx) = oneshot::channel::<()>();
        let cleanup_receiver = receiver.clone();
        let subscription = Subscription::new(move || {
            let _ = abort_tx.send(());
            cleanup_receiver.lock().complete();
        });
        // the task keeps a handle so dropping the token does not abort
        let keep_alive = subscription.clone();
        tokio::spawn(async move {
            let _keep_alive = keep_alive;
            loop {
                let item = tokio::select! {
                    _ = &mut abort_rx => break,
                    item = flow.next() => item,
                };
                match item {
                    Some(Ok(emission)) => {
                        let stamp = emission.stamp;
                        let receiver = receiver.clone();
                        // the outermost boundary forwards via the scheduler
                        let delivered = scheduler::global().enqueue(stamped(stamp, async move {
                            receiver.lock().next(emission)
                        }));
                        match delivered.await {
                            Ok(ack) => ack.wait().await,
                            Err(_) => break,
                        }
                    }
                    Some(Err(err)) => {
                        receiver.lock().error(err);
                        break;
                    }
                    None => {
                        receiver.lock().complete();
                        break;
                    }
                }
            }
        });
        subscription
    }

    fn flow(self: Arc<Self>, ctx: &Arc<PipelineContext>) -> Flow<Op::Out> {
        let upstream = self.parent.source.clone().flow(ctx);
        let index = ctx.register_operator(self.op.name(), self.op.kind());
        self.op.apply(upstream, ctx.clone(), index)
    }

    fn collect_operator_names(&self, out: &mut Vec<String>) {
        self.parent.source.collect_operator_names(out);
        out.push(self.op.name().to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn counted(counter: Arc<Mutex<usize>>) -> Stream<i32> {
        create_stream("numbers", move || {
            *counter.lock() += 1;
            stream::iter(vec![1, 2, 3])
        })
    }

    #[tokio::test]
    async fn generator_starts_on_first_subscriber_only() {
        let starts = Arc::new(Mutex::new(0));
        let stream = counted(starts.clone());
        assert_eq!(*starts.lock(), 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = stream.subscribe(move |v| s.lock().push(v));
        scheduler::global().flush().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*starts.lock(), 1);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn values_fan_out_to_every_subscriber() {
        let stream = create_stream("numbers", || stream::iter(vec![1, 2, 3]));
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let (s1, s2) = (a.clone(), b.clone());
        let completions = Arc::new(Mutex::new(0));
        let c1 = completions.clone();
        let c2 = completions.clone();
        let _sub_a = stream.subscribe_with(
            Receiver::next(move |v| s1.lock().push(v)).on_complete(move || *c1.lock() += 1),
        );
        let _sub_b = stream.subscribe_with(
            Receiver::next(move |v| s2.lock().push(v)).on_complete(move || *c2.lock() += 1),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*a.lock(), vec![1, 2, 3]);
        assert_eq!(*b.lock(), vec![1, 2, 3]);
        assert_eq!(*completions.lock(), 2);
    }

    #[tokio::test]
    async fn last_unsubscribe_aborts_and_resubscribe_restarts() {
        let starts = Arc::new(Mutex::new(0));
        let s = starts.clone();
        let stream = create_stream("ticks", move || {
            *s.lock() += 1;
            stream::unfold(0u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((n, n + 1))
            })
        });
        let sub = stream.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.unsubscribe();
        scheduler::global().flush().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*starts.lock(), 1);
        let sub2 = stream.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*starts.lock(), 2);
        sub2.unsubscribe();
    }

    #[tokio::test]
    async fn unsubscribing_delivers_an_imperative_complete() {
        let stream = create_stream("silence", || stream::pending::<i32>());
        let completions = Arc::new(Mutex::new(0));
        let c = completions.clone();
        let sub = stream.subscribe_with(Receiver::<i32>::new().on_complete(move || *c.lock() += 1));
        sub.unsubscribe();
        scheduler::global().flush().await;
        assert_eq!(*completions.lock(), 1);
    }

    #[tokio::test]
    async fn query_returns_the_first_value() {
        let stream = create_stream("numbers", || stream::iter(vec![7, 8]));
        assert_eq!(stream.query().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn query_on_an_empty_stream_is_no_elements() {
        let stream = create_stream("empty", || stream::iter(Vec::<i32>::new()));
        assert!(stream.query().await.unwrap_err().is_no_elements());
    }

    #[tokio::test]
    async fn a_failing_generator_errors_every_subscriber() {
        let stream = create_result_stream("faulty", || {
            stream::iter(vec![Ok(1), Err(StreamError::NoElements)])
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());
        let _sub = stream.subscribe_with(
            Receiver::next(move |v: i32| l1.lock().push(format!("next {}", v)))
                .on_error(move |err| l2.lock().push(format!("error {}", err))),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *log.lock(),
            vec!["next 1".to_owned(), "error No elements in sequence".to_owned()]
        );
    }
}
