use crate::{emission::Emission, error::StreamError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Handler acknowledgment: the delivery either finished synchronously or
/// keeps the receiver busy until the future resolves. While an `Ack::Later`
/// is in flight, all further deliveries to the same receiver must wait.
pub enum Ack {
    Now,
    Later(BoxFuture<'static, ()>),
}

impl Ack {
    pub fn is_now(&self) -> bool {
        matches!(self, Ack::Now)
    }

    pub async fn wait(self) {
        if let Ack::Later(fut) = self {
            fut.await
        }
    }
}

type ValueFn<T> = Box<dyn FnMut(T) -> Result<Ack, anyhow::Error> + Send>;
type RawFn<T> = Box<dyn FnMut(Emission<T>) -> Ack + Send>;
type ErrorFn = Box<dyn FnMut(StreamError) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;

enum NextHandler<T> {
    /// Consumer-facing: the tag envelope is stripped before the call.
    Value(ValueFn<T>),
    /// Internal receivers (queue feeds, instrumentation) take the envelope.
    Raw(RawFn<T>),
}

/// Consumer callback trio. Built through the constructors below, then
/// wrapped into a [`StrictReceiver`] at the subscribe boundary.
pub struct Receiver<T> {
    next: Option<NextHandler<T>>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl<T> Receiver<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            next: None,
            error: None,
            complete: None,
        }
    }

    pub fn next(mut f: impl FnMut(T) + Send + 'static) -> Self {
        Self {
            next: Some(NextHandler::Value(Box::new(move |value| {
                f(value);
                Ok(Ack::Now)
            }))),
            error: None,
            complete: None,
        }
    }

    /// A `next` handler that may fail; the failure is normalized and routed
    /// to this receiver's `error`.
    pub fn try_next(mut f: impl FnMut(T) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            next: Some(NextHandler::Value(Box::new(move |value| {
                f(value).map(|_| Ack::Now)
            }))),
            error: None,
            complete: None,
        }
    }

    /// A `next` handler returning a future; further deliveries wait for it.
    pub fn async_next(
        mut f: impl FnMut(T) -> BoxFuture<'static, ()> + Send + 'static,
    ) -> Self {
        Self {
            next: Some(NextHandler::Value(Box::new(move |value| {
                Ok(Ack::Later(f(value)))
            }))),
            error: None,
            complete: None,
        }
    }

    /// Internal: a handler that sees the full emission envelope.
    pub fn raw(f: impl FnMut(Emission<T>) -> Ack + Send + 'static) -> Self {
        Self {
            next: Some(NextHandler::Raw(Box::new(f))),
            error: None,
            complete: None,
        }
    }

    pub fn on_error(mut self, f: impl FnMut(StreamError) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Test and demo helper collecting every delivered value.
    pub fn collect_into(sink: Arc<Mutex<Vec<T>>>) -> Self {
        Receiver::next(move |value| sink.lock().push(value))
    }
}

/// Wrapper enforcing the at-most-once terminal discipline:
///
/// 1. every call after `complete` or `error` is a no-op;
/// 2. a failing `next` handler is normalized and routed to `error`;
/// 3. `error` implies one trailing `complete` as a cleanup hook;
/// 4. the tag envelope is stripped before consumer-facing handlers.
pub struct StrictReceiver<T> {
    inner: Receiver<T>,
    completed: bool,
}

impl<T> StrictReceiver<T> {
    pub fn wrap(receiver: Receiver<T>) -> Self {
        Self {
            inner: receiver,
            completed: false,
        }
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn next(&mut self, emission: Emission<T>) -> Ack {
        if self.completed {
            trace!("dropping delivery after terminal");
            return Ack::Now;
        }
        match self.inner.next.as_mut() {
            Some(NextHandler::Value(f)) => match f(emission.into_value()) {
                Ok(ack) => ack,
                Err(err) => {
                    self.error(StreamError::from(err));
                    Ack::Now
                }
            },
            Some(NextHandler::Raw(f)) => f(emission),
            None => Ack::Now,
        }
    }

    pub fn error(&mut self, err: StreamError) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(f) = self.inner.error.as_mut() {
            f(err);
        }
        if let Some(f) = self.inner.complete.as_mut() {
            f();
        }
    }

    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(f) = self.inner.complete.as_mut() {
            f();
        }
    }
}
