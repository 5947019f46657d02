//! Watch mode: translates filesystem events into dirty modules, cascades
//! invalidation through the reverse-dependency index, debounces, and re-runs
//! the driver in incremental mode.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

use crate::core::builder::Builder;
use crate::core::events::BuildEvent;
use crate::core::module::ModuleState;
use crate::core::options::WatchOptions;
use crate::utils::{Logger, Result, TabaError};

/// Edge kinds in the reverse-dependency index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEdge {
    /// Depender re-loads when the target changes or is deleted.
    Reload,
    /// Depender re-loads only when the target is deleted (mutual
    /// output-path watches).
    ReloadOnDelete,
}

/// For each module, the set of modules to invalidate when it changes.
/// Reload edges are repopulated from `module.dependencies` after each load;
/// reload-on-delete edges are sticky until their depender reloads.
#[derive(Default)]
pub struct WatchIndex {
    reverse: DashMap<PathBuf, HashMap<PathBuf, WatchEdge>>,
    forward: DashMap<PathBuf, HashSet<PathBuf>>,
}

impl WatchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reload edges contributed by `module` with its current
    /// dependency list.
    pub fn update_module(&self, module: &Arc<crate::core::module::Module>) {
        let depender = module.original_path().to_path_buf();

        let old_targets = self
            .forward
            .get(&depender)
            .map(|t| t.value().clone())
            .unwrap_or_default();
        for target in &old_targets {
            if let Some(mut entry) = self.reverse.get_mut(target) {
                if entry.get(&depender) == Some(&WatchEdge::Reload) {
                    entry.remove(&depender);
                }
            }
        }

        let mut new_targets = HashSet::new();
        for dep in module.dependencies() {
            if let Some(resolved) = dep.resolved_file {
                let target = resolved.original_path().to_path_buf();
                self.reverse
                    .entry(target.clone())
                    .or_default()
                    .insert(depender.clone(), WatchEdge::Reload);
                new_targets.insert(target);
            }
        }
        self.forward.insert(depender, new_targets);
    }

    pub fn add_reload_on_delete(&self, target: &Path, depender: &Path) {
        self.reverse
            .entry(target.to_path_buf())
            .or_default()
            .entry(depender.to_path_buf())
            .or_insert(WatchEdge::ReloadOnDelete);
    }

    /// Transitive dependers to invalidate when `target` changes.
    pub fn dependers_on_change(&self, target: &Path) -> Vec<PathBuf> {
        self.collect(target, false)
    }

    /// Transitive dependers to invalidate when `target` is deleted; includes
    /// reload-on-delete edges at the first hop.
    pub fn dependers_on_delete(&self, target: &Path) -> Vec<PathBuf> {
        self.collect(target, true)
    }

    fn collect(&self, target: &Path, include_delete_edges: bool) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((target.to_path_buf(), true));

        while let Some((current, first_hop)) = queue.pop_front() {
            let Some(edges) = self.reverse.get(&current) else {
                continue;
            };
            for (depender, kind) in edges.iter() {
                let follow = match kind {
                    WatchEdge::Reload => true,
                    WatchEdge::ReloadOnDelete => include_delete_edges && first_hop,
                };
                if follow && seen.insert(depender.clone()) {
                    queue.push_back((depender.clone(), false));
                }
            }
        }
        let mut out: Vec<_> = seen.into_iter().collect();
        out.sort();
        out
    }
}

/// Filesystem event classes the watcher reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Create,
    Change,
    Delete,
}

impl FileChange {
    fn target_state(self) -> ModuleState {
        match self {
            FileChange::Create => ModuleState::Creating,
            FileChange::Change => ModuleState::Changing,
            FileChange::Delete => ModuleState::Deleting,
        }
    }
}

fn classify(kind: &EventKind) -> Option<FileChange> {
    match kind {
        EventKind::Create(_) => Some(FileChange::Create),
        EventKind::Modify(_) => Some(FileChange::Change),
        EventKind::Remove(_) => Some(FileChange::Delete),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Rebuild trigger: owns the notify watcher and the debounce loop.
pub struct TabaWatcher {
    builder: Arc<Builder>,
    options: WatchOptions,
}

impl TabaWatcher {
    pub fn new(builder: Arc<Builder>, options: WatchOptions) -> Self {
        Self { builder, options }
    }

    /// Watch the root directory until ctrl-c, rebuilding incrementally after
    /// each debounced batch of events.
    pub async fn watch(&self) -> Result<()> {
        let root = self.builder.root_dir().to_path_buf();
        Logger::info(&format!("watching {} for changes", root.display()));

        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| TabaError::build(format!("failed to create watcher: {}", e)))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| TabaError::build(format!("failed to watch {}: {}", root.display(), e)))?;

        self.event_loop(rx).await
    }

    async fn event_loop(&self, rx: Receiver<Event>) -> Result<()> {
        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        let mut last_change = Instant::now();
        let debounce = Duration::from_millis(self.options.debounce_ms);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(()).await;
        });

        loop {
            if shutdown_rx.try_recv().is_ok() {
                Logger::info("stopping watch mode");
                break;
            }

            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => {
                    let Some(kind) = classify(&event.kind) else {
                        continue;
                    };
                    for path in &event.paths {
                        self.apply_event(path, kind, &mut pending);
                        last_change = Instant::now();
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if !pending.is_empty() && last_change.elapsed() >= debounce {
                        let batch = std::mem::take(&mut pending);
                        self.rebuild_pending(batch).await;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    Logger::warn("watch channel disconnected");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Map one filesystem event onto module states and the pending set.
    pub fn apply_event(&self, path: &Path, kind: FileChange, pending: &mut BTreeSet<PathBuf>) {
        let relative = path
            .strip_prefix(self.builder.root_dir())
            .unwrap_or(path);
        if !self.options.ignored.matches(relative) {
            return;
        }

        // The directly affected module.
        let direct = match self.builder.module_at(path) {
            Some(module) => Some(module),
            None if kind == FileChange::Create && self.builder.is_entry_path(path) => {
                Some(self.builder.get_module(path))
            }
            None => None,
        };

        let Some(direct) = direct else {
            return;
        };
        let original = direct.original_path().to_path_buf();

        if !direct.state().is_pending_change() {
            direct.set_state(kind.target_state());
        }
        pending.insert(original.clone());

        // Cascade through the reverse-dependency index.
        let dependers = match kind {
            FileChange::Delete => self.builder.watch_index().dependers_on_delete(&original),
            _ => self.builder.watch_index().dependers_on_change(&original),
        };
        for depender in dependers {
            if let Some(module) = self.builder.module_at(&depender) {
                if !module.state().is_pending_change() {
                    module.set_state(ModuleState::Changing);
                }
                pending.insert(depender);
            }
        }

        // A new file may satisfy an earlier "cannot find".
        if kind == FileChange::Create {
            for module in self.builder.modules() {
                if module.has_logs() && !module.state().is_pending_change() {
                    module.set_state(ModuleState::Changing);
                    pending.insert(module.original_path().to_path_buf());
                }
            }
        }

        self.builder
            .events_ref()
            .emit(&BuildEvent::UpdateFile {
                path: path.to_path_buf(),
            });
    }

    /// Reset every pending module and drive an incremental rebuild with the
    /// still-existing ones as the entry set.
    pub async fn rebuild_pending(&self, pending: BTreeSet<PathBuf>) {
        let mut entries = Vec::new();
        for path in pending {
            let Some(module) = self.builder.module_at(&path) else {
                continue;
            };
            let deleted = module.state() == ModuleState::Deleting;
            let next = if deleted {
                ModuleState::Deleted
            } else {
                ModuleState::Initial
            };
            self.builder.reset_module(&module, next).await;
            if !deleted {
                entries.push(module);
            }
        }
        if entries.is_empty() {
            return;
        }

        Logger::info(&format!("rebuilding {} changed file(s)", entries.len()));
        let start = Instant::now();
        match self.builder.build_incremental(entries).await {
            Ok(context) => {
                Logger::info(&format!(
                    "rebuild finished in {:.0?} ({} errors, {} warnings)",
                    start.elapsed(),
                    context.error_count,
                    context.warning_count
                ));
            }
            Err(err) => {
                Logger::error(&format!("rebuild failed: {}", err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::{Dependency, DependencyKind, Module};
    use crate::utils::mime::MimeRegistry;

    fn module(path: &str) -> Arc<Module> {
        Arc::new(Module::new(
            PathBuf::from(path),
            0,
            "h".into(),
            false,
            Arc::new(MimeRegistry::default()),
        ))
    }

    #[test]
    fn test_reload_edges_follow_dependencies() {
        let index = WatchIndex::new();
        let a = module("/src/a.css");
        let b = module("/src/b.css");
        let mut dep = Dependency::new("./b.css", DependencyKind::Import);
        dep.resolved_file = Some(b.clone());
        a.add_dependency(dep);
        index.update_module(&a);

        assert_eq!(
            index.dependers_on_change(Path::new("/src/b.css")),
            vec![PathBuf::from("/src/a.css")]
        );
    }

    #[test]
    fn test_edges_replaced_on_reload() {
        let index = WatchIndex::new();
        let a = module("/src/a.css");
        let b = module("/src/b.css");
        let mut dep = Dependency::new("./b.css", DependencyKind::Import);
        dep.resolved_file = Some(b);
        a.add_dependency(dep);
        index.update_module(&a);

        // After a re-load a no longer depends on b.
        let a2 = module("/src/a.css");
        index.update_module(&a2);
        assert!(index.dependers_on_change(Path::new("/src/b.css")).is_empty());
    }

    #[test]
    fn test_cascade_is_transitive() {
        let index = WatchIndex::new();
        let a = module("/src/a.html");
        let b = module("/src/b.css");
        let c = module("/src/c.css");
        let mut ab = Dependency::new("./b.css", DependencyKind::Import);
        ab.resolved_file = Some(b.clone());
        a.add_dependency(ab);
        index.update_module(&a);
        let mut bc = Dependency::new("./c.css", DependencyKind::Import);
        bc.resolved_file = Some(c);
        b.add_dependency(bc);
        index.update_module(&b);

        let affected = index.dependers_on_change(Path::new("/src/c.css"));
        assert_eq!(
            affected,
            vec![PathBuf::from("/src/a.html"), PathBuf::from("/src/b.css")]
        );
    }

    #[test]
    fn test_reload_on_delete_only_fires_for_deletes() {
        let index = WatchIndex::new();
        index.add_reload_on_delete(Path::new("/src/a.js"), Path::new("/src/b.js"));

        assert!(index.dependers_on_change(Path::new("/src/a.js")).is_empty());
        assert_eq!(
            index.dependers_on_delete(Path::new("/src/a.js")),
            vec![PathBuf::from("/src/b.js")]
        );
    }

    #[test]
    fn test_classify_event_kinds() {
        assert_eq!(
            classify(&EventKind::Create(notify::event::CreateKind::File)),
            Some(FileChange::Create)
        );
        assert_eq!(
            classify(&EventKind::Modify(notify::event::ModifyKind::Any)),
            Some(FileChange::Change)
        );
        assert_eq!(
            classify(&EventKind::Remove(notify::event::RemoveKind::File)),
            Some(FileChange::Delete)
        );
        assert_eq!(classify(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }
}
