//! The contract between operators and the engine: an operator consumes its
//! upstream iterator and exposes a downstream iterator, propagating values,
//! terminals and side-band metadata.

use crate::{
    context::{PhantomDrop, PipelineContext},
    emission::{Emission, ValueTag},
    error::StreamError,
};
use futures::stream::BoxStream;
use std::{fmt, marker::PhantomData, sync::Arc};

mod buffer_count;
mod coroutine;
mod debounce;
mod delay_while;
mod element_at;
mod filter;
mod last;
mod merge_map;
mod select;
mod tap;
mod unique;
mod with_latest_from;

pub use buffer_count::{buffer_count, BufferCount};
pub use coroutine::{coroutine, Coroutine};
pub use debounce::{debounce, Debounce};
pub use delay_while::{delay_while, DelayWhile};
pub use element_at::{element_at, ElementAt};
pub use filter::{filter, filter_async, filter_one_of, filter_value, Filter};
pub use last::{last, last_where, Last};
pub use merge_map::{merge_map, MergeMap};
pub use select::{select, select_stream, Select};
pub use tap::{tap, Tap};
pub use unique::{unique, unique_by, Unique};
pub use with_latest_from::{with_latest_from, WithLatestFrom};

/// The iterator shape flowing between operators: stamped emissions, an
/// `Err` item as the error terminal, end-of-stream as completion.
pub type Flow<T> = BoxStream<'static, Result<Emission<T>, StreamError>>;

/// How an operator relates outputs to inputs, mirrored by the tag kinds
/// its outputs carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorKind {
    /// 1:1, keeps the input's value identity.
    Transform,
    /// May drop values; drops surface as phantoms.
    Filter,
    /// Merges many inputs into one output.
    Collapse,
    /// Forks one input into many outputs.
    Expand,
}

/// An operator is a pure factory: `apply` builds a fresh downstream
/// iterator per subscription, so operator state is never shared between
/// subscriptions. `index` is the operator's position in the pipeline,
/// assigned by the context at registration.
pub trait Operator<In>: Send + Sync {
    type Out;

    fn name(&self) -> &str;

    fn kind(&self) -> OperatorKind;

    fn apply(&self, upstream: Flow<In>, ctx: Arc<PipelineContext>, index: usize)
        -> Flow<Self::Out>;
}

/// Wrap a plain iterator-to-iterator transform into an operator of kind
/// [`OperatorKind::Transform`].
pub fn create_operator<In, Out, F>(name: &str, transform: F) -> FnOperator<In, Out, F>
where
    F: Fn(Flow<In>, Arc<PipelineContext>, usize) -> Flow<Out> + Send + Sync,
{
    FnOperator {
        name: Arc::from(name),
        kind: OperatorKind::Transform,
        transform,
        _marker: PhantomData,
    }
}

pub struct FnOperator<In, Out, F> {
    name: Arc<str>,
    kind: OperatorKind,
    transform: F,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F> FnOperator<In, Out, F> {
    /// Reclassify the operator, e.g. for a custom aggregate.
    pub fn with_kind(mut self, kind: OperatorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl<In, Out, F> Operator<In> for FnOperator<In, Out, F>
where
    F: Fn(Flow<In>, Arc<PipelineContext>, usize) -> Flow<Out> + Send + Sync,
{
    type Out = Out;

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperatorKind {
        self.kind
    }

    fn apply(&self, upstream: Flow<In>, ctx: Arc<PipelineContext>, index: usize) -> Flow<Out> {
        (self.transform)(upstream, ctx, index)
    }
}

/// 1:1 value transform, the canonical [`create_operator`] client.
pub fn map<In, Out, F>(f: F) -> impl Operator<In, Out = Out> + 'static
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Clone + Send + Sync + 'static,
{
    use futures::StreamExt;
    create_operator("map", move |upstream: Flow<In>, ctx: Arc<PipelineContext>, index| {
        let f = f.clone();
        upstream
            .map(move |item| {
                item.map(|emission| {
                    let emission = emission.map(&f);
                    retag_transform(emission, &ctx, index, "map")
                })
            })
            .fuse()
            .boxed()
    })
}

/// Apply the transform tag discipline: the output keeps the input's value
/// id, stamped with this operator's identity.
pub(crate) fn retag_transform<T>(
    emission: Emission<T>,
    ctx: &PipelineContext,
    index: usize,
    name: &str,
) -> Emission<T> {
    match emission.tag {
        Some(ref input) => {
            let tag = ValueTag::transform(input, index, name);
            ctx.observe(&tag);
            Emission {
                value: emission.value,
                stamp: emission.stamp,
                tag: Some(tag),
            }
        }
        None => emission,
    }
}

/// Report a dropped value to the pipeline's phantom hook, if installed.
pub(crate) fn notify_phantom<T: fmt::Debug>(
    ctx: &PipelineContext,
    index: usize,
    name: &str,
    emission: &Emission<T>,
) {
    if ctx.wants_phantoms() {
        ctx.phantom(PhantomDrop {
            operator_index: index,
            operator_name: Arc::from(name),
            stamp: emission.stamp,
            value_id: emission.value_id(),
            rendered: format!("{:?}", emission.value),
        });
    }
}
