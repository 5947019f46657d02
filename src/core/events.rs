//! Typed observer bus for user-facing build hooks. Internal phase
//! transitions are plain function calls; only user-observable milestones go
//! through here.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::module::{LogEntry, Module};

/// User-observable build milestones.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    BuildStart {
        build_mode: &'static str,
    },
    LoadFile {
        module: Arc<Module>,
    },
    EmitFile {
        module: Arc<Module>,
    },
    WriteFile {
        path: PathBuf,
        size: u64,
    },
    BuildLog {
        module: Arc<Module>,
        entry: LogEntry,
    },
    BuildEnd {
        error_count: usize,
        warning_count: usize,
        aborted: bool,
    },
    UpdateFile {
        path: PathBuf,
    },
    ResetFile {
        module: Arc<Module>,
    },
    DependencyNotFound {
        module: Arc<Module>,
        url: String,
    },
}

pub type Listener = Arc<dyn Fn(&BuildEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: &BuildEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |event| {
                if matches!(event, BuildEvent::BuildStart { .. }) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        bus.emit(&BuildEvent::BuildStart { build_mode: "full" });
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
