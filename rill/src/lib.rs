//! Reactive push/pull streaming runtime: multicast streams and subjects
//! over a stamped emission queue, composable stateful operators with
//! backpressure, deterministic ordering, cancellation and introspection.
//!
//! Producers drive values through the receiver discipline into
//! per-consumer pull iterators; operators consume their upstream iterator
//! and expose a downstream one; the outermost iterator forwards into
//! subscriber receivers via the scheduler. Emission stamps flow alongside
//! values to order parallel deliveries.

pub mod context;
pub mod convert;
pub mod emission;
pub mod error;
pub mod hooks;
pub mod operator;
pub mod queue;
pub mod receiver;
pub mod scheduler;
pub mod stamp;
pub mod stream;
pub mod subject;
pub mod subscription;

pub use convert::{
    each_value_from, first_value_from, from_future, from_iter, from_stream, from_value, IntoStream,
};
pub use emission::{Emission, TagKind, ValueId, ValueTag};
pub use error::StreamError;
pub use hooks::{
    clear_runtime_hooks, set_runtime_hooks, PipeDecoration, PipeInfo, RuntimeHooks, StreamInfo,
};
pub use receiver::{Ack, Receiver};
pub use stamp::{current_stamp, next_stamp, with_stamp, Stamp};
pub use stream::{create_result_stream, create_stream, SourceKind, Stream};
pub use subject::{
    create_behavior_subject, create_replay_subject, create_subject, BehaviorSubject, ReplaySubject,
    Subject,
};
pub use subscription::Subscription;

pub mod prelude {
    pub use crate::convert::IntoStream;
    pub use crate::operator::{
        buffer_count, coroutine, create_operator, debounce, delay_while, element_at, filter,
        filter_async, filter_one_of, filter_value, last, last_where, map, merge_map, select,
        select_stream, tap, unique, unique_by, with_latest_from, Flow, Operator, OperatorKind,
    };
    pub use crate::{
        create_behavior_subject, create_replay_subject, create_stream, create_subject, Receiver,
        Stream, StreamError, Subscription,
    };
}
