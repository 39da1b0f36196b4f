use crate::stamp::Stamp;
use derive_more::{Display, From, Into};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Identity of a value as it travels through an operator chain. 1:1
/// transforms keep the id, collapse and expand mint fresh ones linked back
/// to their inputs.
#[derive(Copy, Clone, Debug, Display, From, Into, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(u64);

static NEXT_VALUE_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_value_id() -> ValueId {
    ValueId(NEXT_VALUE_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TagKind {
    Transform,
    Collapse,
    Expand,
}

/// Side-band trace tag attached to an emission when value tracing is on.
#[derive(Clone, Debug)]
pub struct ValueTag {
    pub value_id: ValueId,
    pub operator_index: usize,
    pub operator_name: Arc<str>,
    pub kind: Option<TagKind>,
    pub input_value_ids: Vec<ValueId>,
}

impl ValueTag {
    /// Tag for a value as it enters a pipeline from its source.
    pub fn source(origin: &str) -> Arc<ValueTag> {
        Arc::new(ValueTag {
            value_id: next_value_id(),
            operator_index: 0,
            operator_name: Arc::from(origin),
            kind: None,
            input_value_ids: Vec::new(),
        })
    }

    /// 1:1 transform: the output keeps the input's `value_id`.
    pub fn transform(input: &ValueTag, operator_index: usize, operator_name: &str) -> Arc<ValueTag> {
        Arc::new(ValueTag {
            value_id: input.value_id,
            operator_index,
            operator_name: Arc::from(operator_name),
            kind: Some(TagKind::Transform),
            input_value_ids: vec![input.value_id],
        })
    }

    /// Many inputs merged into one output.
    pub fn collapse(
        inputs: Vec<ValueId>,
        operator_index: usize,
        operator_name: &str,
    ) -> Arc<ValueTag> {
        Arc::new(ValueTag {
            value_id: next_value_id(),
            operator_index,
            operator_name: Arc::from(operator_name),
            kind: Some(TagKind::Collapse),
            input_value_ids: inputs,
        })
    }

    /// One input forked into many outputs; each fork links back to the base.
    pub fn expand(base: ValueId, operator_index: usize, operator_name: &str) -> Arc<ValueTag> {
        Arc::new(ValueTag {
            value_id: next_value_id(),
            operator_index,
            operator_name: Arc::from(operator_name),
            kind: Some(TagKind::Expand),
            input_value_ids: vec![base],
        })
    }
}

/// The envelope a value travels in between source, operators and the
/// receiver discipline. The discipline strips it before user callbacks.
#[derive(Clone, Debug)]
pub struct Emission<T> {
    pub value: T,
    pub stamp: Stamp,
    pub tag: Option<Arc<ValueTag>>,
}

impl<T> Emission<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self {
            value,
            stamp,
            tag: None,
        }
    }

    pub fn tagged(value: T, stamp: Stamp, tag: Arc<ValueTag>) -> Self {
        Self {
            value,
            stamp,
            tag: Some(tag),
        }
    }

    pub fn value_id(&self) -> Option<ValueId> {
        self.tag.as_ref().map(|tag| tag.value_id)
    }

    /// Map the value, keeping stamp and tag (the 1:1 transform discipline).
    pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Emission<R> {
        Emission {
            value: f(self.value),
            stamp: self.stamp,
            tag: self.tag,
        }
    }

    /// Replace the value, keeping the stamp but adopting a new tag.
    pub fn replace<R>(self, value: R, tag: Option<Arc<ValueTag>>) -> Emission<R> {
        Emission {
            value,
            stamp: self.stamp,
            tag,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}
