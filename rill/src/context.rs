use crate::{
    emission::{ValueId, ValueTag},
    operator::OperatorKind,
    stamp::Stamp,
};
use itertools::Itertools;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::trace;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Notification for a value dropped inside a pipeline: the subscriber never
/// sees it, observers may record it.
#[derive(Clone, Debug)]
pub struct PhantomDrop {
    pub operator_index: usize,
    pub operator_name: Arc<str>,
    pub stamp: Stamp,
    pub value_id: Option<ValueId>,
    /// `Debug` rendering of the dropped value.
    pub rendered: String,
}

pub type PhantomHandler = Arc<dyn Fn(PhantomDrop) + Send + Sync>;
pub type EmissionObserver = Arc<dyn Fn(&ValueTag) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct OperatorInfo {
    pub index: usize,
    pub name: Arc<str>,
    pub kind: OperatorKind,
}

/// Per-subscription record threading operator identity and observer hooks
/// through the chain. One context is created per subscribe and shared by
/// every operator instance of that subscription.
pub struct PipelineContext {
    subscription_id: u64,
    stream_id: u64,
    stream_name: Arc<str>,
    operators: Mutex<Vec<OperatorInfo>>,
    phantom: Mutex<Option<PhantomHandler>>,
    observer: Mutex<Option<EmissionObserver>>,
    trace_values: AtomicBool,
}

impl PipelineContext {
    pub(crate) fn new(stream_id: u64, stream_name: Arc<str>) -> Arc<Self> {
        Arc::new(Self {
            subscription_id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            stream_id,
            stream_name,
            operators: Mutex::new(Vec::new()),
            phantom: Mutex::new(None),
            observer: Mutex::new(None),
            trace_values: AtomicBool::new(false),
        })
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Register an operator for this subscription; index 0 is the source,
    /// operators count upward along the chain.
    pub fn register_operator(&self, name: &str, kind: OperatorKind) -> usize {
        let mut operators = self.operators.lock();
        let index = operators.len() + 1;
        operators.push(OperatorInfo {
            index,
            name: Arc::from(name),
            kind,
        });
        index
    }

    pub fn operators(&self) -> Vec<OperatorInfo> {
        self.operators.lock().clone()
    }

    /// The operator stack, source first, for log formatting.
    pub fn operator_stack(&self) -> String {
        let operators = self.operators.lock();
        std::iter::once(self.stream_name.to_string())
            .chain(operators.iter().map(|op| op.name.to_string()))
            .join(" -> ")
    }

    pub fn set_phantom_handler(&self, handler: PhantomHandler) {
        *self.phantom.lock() = Some(handler);
    }

    pub fn set_observer(&self, observer: EmissionObserver) {
        *self.observer.lock() = Some(observer);
    }

    pub fn enable_value_tracing(&self) {
        self.trace_values.store(true, Ordering::Relaxed);
    }

    pub fn traces_values(&self) -> bool {
        self.trace_values.load(Ordering::Relaxed)
    }

    /// True when an operator should bother rendering dropped values.
    pub fn wants_phantoms(&self) -> bool {
        self.phantom.lock().is_some()
    }

    pub fn phantom(&self, drop: PhantomDrop) {
        trace!(
            operator = %drop.operator_name,
            stamp = %drop.stamp,
            "phantom: {}",
            drop.rendered
        );
        let handler = self.phantom.lock().clone();
        if let Some(handler) = handler {
            handler(drop);
        }
    }

    pub fn observe(&self, tag: &ValueTag) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(tag);
        }
    }
}
