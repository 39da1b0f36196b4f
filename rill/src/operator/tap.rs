use super::{retag_transform, Flow, Operator, OperatorKind};
use crate::context::PipelineContext;
use futures::StreamExt;
use std::sync::Arc;

/// Run a side effect for every value, forwarding everything untouched.
pub struct Tap<F> {
    effect: Arc<F>,
}

pub fn tap<T, F>(effect: F) -> Tap<F>
where
    F: Fn(&T) + Send + Sync,
{
    Tap {
        effect: Arc::new(effect),
    }
}

impl<T, F> Operator<T> for Tap<F>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    type Out = T;

    fn name(&self) -> &str {
        "tap"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Transform
    }

    fn apply(&self, upstream: Flow<T>, ctx: Arc<PipelineContext>, index: usize) -> Flow<T> {
        let effect = self.effect.clone();
        upstream
            .map(move |item| {
                item.map(|emission| {
                    effect(&emission.value);
                    retag_transform(emission, &ctx, index, "tap")
                })
            })
            .fuse()
            .boxed()
    }
}
