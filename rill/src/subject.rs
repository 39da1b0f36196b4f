use crate::{
    context::PipelineContext,
    emission::{Emission, ValueTag},
    error::StreamError,
    operator::Flow,
    queue::emission_queue,
    receiver::{Ack, StrictReceiver},
    stamp::{self, with_stamp, Stamp},
    stream::{Source, SourceKind, Stream},
    subscription::Subscription,
};
use futures::{future::BoxFuture, StreamExt};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tracing::trace;

#[derive(Copy, Clone, Debug)]
enum Mode {
    Plain,
    Behavior,
    /// `None` keeps the whole history.
    Replay(Option<usize>),
}

#[derive(Clone)]
enum Terminal {
    Completed(Stamp),
    Failed(StreamError, Stamp),
}

enum QueueItem<T> {
    Next(T, Stamp),
    Complete(Stamp),
    Error(StreamError, Stamp),
}

enum Signal<T> {
    Next(Emission<T>),
    Complete,
    Error(StreamError),
}

struct SlotPending<T> {
    /// False while an `Ack::Later` is in flight; deliveries buffer behind it.
    ready: bool,
    buffer: VecDeque<Signal<T>>,
}

struct SlotShared<T> {
    id: u64,
    subscribed_at: Stamp,
    receiver: Arc<Mutex<StrictReceiver<T>>>,
    pending: Mutex<SlotPending<T>>,
    subscription: OnceCell<Subscription>,
    ctx: Arc<PipelineContext>,
}

impl<T> SlotShared<T> {
    fn unsubscribed(&self) -> bool {
        self.subscription
            .get()
            .map(|sub| sub.unsubscribed())
            .unwrap_or(false)
    }
}

struct SubjectState<T> {
    slots: Vec<Arc<SlotShared<T>>>,
    latest: Option<T>,
    replay: VecDeque<(T, Stamp)>,
    queue: VecDeque<QueueItem<T>>,
    committing: bool,
    terminal: Option<Terminal>,
    next_slot_id: u64,
}

/// Shared core of Subject, BehaviorSubject and ReplaySubject: a stamped
/// item queue drained by a single-threaded commit that honors per-receiver
/// readiness and the `subscribed_at < stamp` eligibility rule.
pub(crate) struct SubjectCore<T> {
    mode: Mode,
    state: Mutex<SubjectState<T>>,
}

impl<T: Clone + Send + 'static> SubjectCore<T> {
    fn new(mode: Mode, initial: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            state: Mutex::new(SubjectState {
                slots: Vec::new(),
                latest: initial,
                replay: VecDeque::new(),
                queue: VecDeque::new(),
                committing: false,
                terminal: None,
                next_slot_id: 0,
            }),
        })
    }

    pub fn next(self: &Arc<Self>, value: T) {
        let stamp = stamp::emission_stamp();
        {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                trace!("next after terminal ignored");
                return;
            }
            state.latest = Some(value.clone());
            if let Mode::Replay(capacity) = self.mode {
                state.replay.push_back((value.clone(), stamp));
                if let Some(capacity) = capacity {
                    while state.replay.len() > capacity {
                        state.replay.pop_front();
                    }
                }
            }
            state.queue.push_back(QueueItem::Next(value, stamp));
        }
        self.commit();
    }

    pub fn complete(self: &Arc<Self>) {
        let stamp = stamp::emission_stamp();
        {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(Terminal::Completed(stamp));
            state.queue.push_back(QueueItem::Complete(stamp));
        }
        self.commit();
    }

    pub fn error(self: &Arc<Self>, err: StreamError) {
        let stamp = stamp::emission_stamp();
        {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(Terminal::Failed(err.clone(), stamp));
            state.queue.push_back(QueueItem::Error(err, stamp));
        }
        self.commit();
    }

    pub fn completed(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// The most recently queued `next`, not the most recently delivered.
    pub fn latest(&self) -> Option<T> {
        self.state.lock().latest.clone()
    }

    /// Drain the item queue. Only one caller commits at a time; a `next`
    /// re-entered from inside a receiver handler just queues its item.
    fn commit(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.committing {
                return;
            }
            state.committing = true;
        }
        loop {
            let item = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        state.committing = false;
                        return;
                    }
                }
            };
            match item {
                QueueItem::Next(value, stamp) => {
                    let slots = self.state.lock().slots.clone();
                    for slot in slots {
                        if slot.unsubscribed() || stamp <= slot.subscribed_at {
                            continue;
                        }
                        let tag = slot.ctx.traces_values().then(|| {
                            let tag = ValueTag::source(slot.ctx.stream_name());
                            slot.ctx.observe(&tag);
                            tag
                        });
                        dispatch(
                            &slot,
                            Signal::Next(Emission {
                                value: value.clone(),
                                stamp,
                                tag,
                            }),
                        );
                    }
                }
                QueueItem::Complete(stamp) => {
                    let slots = std::mem::take(&mut self.state.lock().slots);
                    for slot in slots {
                        if !slot.unsubscribed() && stamp > slot.subscribed_at {
                            dispatch(&slot, Signal::Complete);
                        }
                    }
                }
                QueueItem::Error(err, stamp) => {
                    let slots = std::mem::take(&mut self.state.lock().slots);
                    for slot in slots {
                        if !slot.unsubscribed() && stamp > slot.subscribed_at {
                            dispatch(&slot, Signal::Error(err.clone()));
                        }
                    }
                }
            }
        }
    }

    fn register_receiver(
        self: &Arc<Self>,
        ctx: &Arc<PipelineContext>,
        receiver: StrictReceiver<T>,
    ) -> Subscription {
        let receiver = Arc::new(Mutex::new(receiver));
        let slot = {
            let mut state = self.state.lock();
            let id = state.next_slot_id;
            state.next_slot_id += 1;
            let subscribed_at = stamp::next_stamp();
            let mut signals = Vec::new();
            match self.mode {
                Mode::Behavior => {
                    // mirrored synchronously under the registration stamp;
                    // a completed behavior subject does not replay it
                    if state.terminal.is_none() {
                        if let Some(value) = state.latest.clone() {
                            signals.push(Signal::Next(Emission::new(value, subscribed_at)));
                        }
                    }
                }
                Mode::Replay(_) => {
                    for (value, stamp) in state.replay.iter() {
                        signals.push(Signal::Next(Emission::new(value.clone(), *stamp)));
                    }
                }
                Mode::Plain => {}
            }
            match &state.terminal {
                Some(Terminal::Completed(_)) => signals.push(Signal::Complete),
                Some(Terminal::Failed(err, _)) => signals.push(Signal::Error(err.clone())),
                None => {}
            }
            // The slot starts busy with the catch-up signals preloaded, so
            // a commit racing this registration queues behind them and the
            // replay order is preserved.
            let slot = Arc::new(SlotShared {
                id,
                subscribed_at,
                receiver: receiver.clone(),
                pending: Mutex::new(SlotPending {
                    ready: false,
                    buffer: signals.into(),
                }),
                subscription: OnceCell::new(),
                ctx: ctx.clone(),
            });
            if state.terminal.is_none() {
                state.slots.push(slot.clone());
            }
            slot
        };
        let core = self.clone();
        let cleanup_slot = slot.clone();
        let subscription = Subscription::new(move || {
            core.state.lock().slots.retain(|s| s.id != cleanup_slot.id);
            // ordered behind anything already buffered for this receiver
            dispatch(&cleanup_slot, Signal::Complete);
        });
        let _ = slot.subscription.set(subscription.clone());
        // replay, mirror and terminal catch-up run outside the state lock
        run_slot(slot, None);
        subscription
    }
}

/// Hand a signal to the slot: inline if the receiver is ready, buffered
/// behind its in-flight acknowledgment otherwise.
fn dispatch<T: Clone + Send + 'static>(slot: &Arc<SlotShared<T>>, signal: Signal<T>) {
    let mut pending = slot.pending.lock();
    if pending.ready {
        pending.ready = false;
        drop(pending);
        run_slot(slot.clone(), Some(signal));
    } else {
        pending.buffer.push_back(signal);
    }
}

/// Deliver signals for one slot until its buffer is empty or a delivery
/// suspends. Callers own the not-ready state (`pending.ready == false`).
fn run_slot<T: Clone + Send + 'static>(slot: Arc<SlotShared<T>>, mut first: Option<Signal<T>>) {
    loop {
        let signal = match first.take() {
            Some(signal) => signal,
            None => {
                let mut pending = slot.pending.lock();
                match pending.buffer.pop_front() {
                    Some(signal) => signal,
                    None => {
                        pending.ready = true;
                        return;
                    }
                }
            }
        };
        if let Some(ack) = perform(&slot, signal) {
            let continued = slot.clone();
            tokio::spawn(async move {
                ack.await;
                run_slot(continued, None);
            });
            return;
        }
    }
}

fn perform<T>(slot: &Arc<SlotShared<T>>, signal: Signal<T>) -> Option<BoxFuture<'static, ()>> {
    match signal {
        Signal::Next(emission) => {
            if slot.unsubscribed() {
                return None;
            }
            let stamp = emission.stamp;
            match with_stamp(stamp, || slot.receiver.lock().next(emission)) {
                Ack::Now => None,
                Ack::Later(fut) => Some(fut),
            }
        }
        Signal::Complete => {
            slot.receiver.lock().complete();
            None
        }
        Signal::Error(err) => {
            slot.receiver.lock().error(err);
            None
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for SubjectCore<T> {
    fn register(
        self: Arc<Self>,
        ctx: &Arc<PipelineContext>,
        receiver: StrictReceiver<T>,
    ) -> Subscription {
        self.register_receiver(ctx, receiver)
    }

    fn flow(self: Arc<Self>, ctx: &Arc<PipelineContext>) -> Flow<T> {
        // eager: the queue is registered right away so values pushed before
        // the first pull are buffered for the consumer
        let (pusher, mut emissions) = emission_queue();
        let subscription = self.register_receiver(ctx, StrictReceiver::wrap(pusher.receiver()));
        emissions.set_subscription(subscription);
        emissions.boxed()
    }
}

macro_rules! subject_common {
    ($name:ident) => {
        impl<T: Clone + Send + 'static> $name<T> {
            pub fn next(&self, value: T) {
                self.core.next(value)
            }

            pub fn complete(&self) {
                self.core.complete()
            }

            pub fn error(&self, err: impl Into<StreamError>) {
                self.core.error(err.into())
            }

            pub fn completed(&self) -> bool {
                self.core.completed()
            }

            pub fn stream(&self) -> &Stream<T> {
                &self.handle
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                    handle: self.handle.clone(),
                }
            }
        }

        impl<T> std::ops::Deref for $name<T> {
            type Target = Stream<T>;

            fn deref(&self) -> &Stream<T> {
                &self.handle
            }
        }
    };
}

/// Imperative multicast source without replay.
pub struct Subject<T> {
    core: Arc<SubjectCore<T>>,
    handle: Stream<T>,
}

subject_common!(Subject);

impl<T: Clone + Send + 'static> Subject<T> {
    pub fn value(&self) -> Option<T> {
        self.core.latest()
    }
}

pub fn create_subject<T: Clone + Send + 'static>() -> Subject<T> {
    let core = SubjectCore::new(Mode::Plain, None);
    let handle = Stream::from_source("subject", SourceKind::Subject, core.clone());
    Subject { core, handle }
}

/// Subject that mirrors its latest value to every new subscriber.
pub struct BehaviorSubject<T> {
    core: Arc<SubjectCore<T>>,
    handle: Stream<T>,
}

subject_common!(BehaviorSubject);

impl<T: Clone + Send + 'static> BehaviorSubject<T> {
    /// Always defined: seeded at creation, updated by every `next`.
    pub fn value(&self) -> T {
        self.core
            .latest()
            .expect("behavior subject always holds a value")
    }
}

pub fn create_behavior_subject<T: Clone + Send + 'static>(initial: T) -> BehaviorSubject<T> {
    let core = SubjectCore::new(Mode::Behavior, Some(initial));
    let handle = Stream::from_source("behaviorSubject", SourceKind::Subject, core.clone());
    BehaviorSubject { core, handle }
}

/// Subject replaying up to `capacity` past emissions, in order and under
/// their original stamps, to every new subscriber.
pub struct ReplaySubject<T> {
    core: Arc<SubjectCore<T>>,
    handle: Stream<T>,
}

subject_common!(ReplaySubject);

impl<T: Clone + Send + 'static> ReplaySubject<T> {
    pub fn value(&self) -> Option<T> {
        self.core.latest()
    }
}

pub fn create_replay_subject<T: Clone + Send + 'static>(
    capacity: impl Into<Option<usize>>,
) -> ReplaySubject<T> {
    let core = SubjectCore::new(Mode::Replay(capacity.into()), None);
    let handle = Stream::from_source("replaySubject", SourceKind::Subject, core.clone());
    ReplaySubject { core, handle }
}
