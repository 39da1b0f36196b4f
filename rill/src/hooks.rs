use crate::context::{EmissionObserver, PhantomHandler};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;

/// Identity of a newly created stream or subject.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub id: u64,
    pub name: String,
    pub kind: crate::stream::SourceKind,
}

/// Snapshot handed to instrumentation before an iterator chain is built.
#[derive(Clone, Debug)]
pub struct PipeInfo {
    pub stream_id: u64,
    pub stream_name: String,
    pub subscription_id: u64,
    pub operators: Vec<String>,
}

/// What instrumentation may install on a pipeline before it materializes.
#[derive(Default)]
pub struct PipeDecoration {
    pub trace_values: bool,
    pub phantom: Option<PhantomHandler>,
    pub observer: Option<EmissionObserver>,
}

/// Process-wide lifecycle observation. Implementations are consulted when
/// streams are created and when a piped subscription builds its chain.
pub trait RuntimeHooks: Send + Sync {
    fn on_create_stream(&self, _info: &StreamInfo) {}

    fn on_pipe_stream(&self, _info: &PipeInfo) -> PipeDecoration {
        PipeDecoration::default()
    }
}

static HOOKS: Lazy<RwLock<Option<Arc<dyn RuntimeHooks>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide hooks, replacing any previous ones.
pub fn set_runtime_hooks(hooks: Arc<dyn RuntimeHooks>) {
    *HOOKS.write() = Some(hooks);
}

pub fn clear_runtime_hooks() {
    *HOOKS.write() = None;
}

pub(crate) fn current() -> Option<Arc<dyn RuntimeHooks>> {
    HOOKS.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        created: Arc<Mutex<Vec<String>>>,
    }

    impl RuntimeHooks for Recording {
        fn on_create_stream(&self, info: &StreamInfo) {
            self.created.lock().push(info.name.clone());
        }
    }

    #[test]
    fn set_replaces_instead_of_merging() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        set_runtime_hooks(Arc::new(Recording {
            created: first.clone(),
        }));
        set_runtime_hooks(Arc::new(Recording {
            created: second.clone(),
        }));
        if let Some(hooks) = current() {
            hooks.on_create_stream(&StreamInfo {
                id: 1,
                name: "numbers".to_owned(),
                kind: crate::stream::SourceKind::Stream,
            });
        }
        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec!["numbers".to_owned()]);
        clear_runtime_hooks();
    }
}
