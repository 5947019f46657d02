//! Processor chains: ordered, match-conditioned transform stages applied to
//! a module during the compile and optimize phases.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::core::builder::Builder;
use crate::core::bundler::ReadMode;
use crate::core::module::{Dependency, LogEntry, Module};
use crate::core::sourcemap::SourceMapData;
use crate::utils::{Matcher, MatcherSet, Result, TabaError};

/// A transform stage. Implementations either override `process` for full
/// builder access, or `process_blocking` to become eligible for the worker
/// pool when `parallel` is true.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `process_blocking` may be dispatched to the worker pool.
    fn parallel(&self) -> bool {
        false
    }

    async fn process(&self, module: &Arc<Module>, _builder: &Arc<Builder>) -> Result<()> {
        let mut delta = ModuleDelta::capture(module);
        self.process_blocking(&mut delta)?;
        delta.apply(module);
        Ok(())
    }

    /// CPU-only transform over a detached snapshot.
    fn process_blocking(&self, _delta: &mut ModuleDelta) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Processor({})", self.name())
    }
}

/// The slice of a module shipped to the worker pool, and the changes merged
/// back afterwards.
pub struct ModuleDelta {
    pub original_path: PathBuf,
    path: PathBuf,
    content: Option<String>,
    source_map_json: Option<String>,
    path_changed: bool,
    content_changed: bool,
    logs: Vec<LogEntry>,
    dependencies: Vec<Dependency>,
    props: Vec<(String, serde_json::Value)>,
}

impl ModuleDelta {
    pub fn capture(module: &Arc<Module>) -> Self {
        Self {
            original_path: module.original_path().to_path_buf(),
            path: module.path(),
            content: module.text_content(),
            source_map_json: None,
            path_changed: false,
            content_changed: false,
            logs: Vec::new(),
            dependencies: Vec::new(),
            props: Vec::new(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
        self.path_changed = true;
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn set_content(&mut self, content: String) {
        self.content = Some(content);
        self.content_changed = true;
    }

    pub fn set_source_map(&mut self, json: String) {
        self.source_map_json = Some(json);
        self.content_changed = true;
    }

    pub fn add_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    pub fn add_dependency(&mut self, dependency: Dependency) {
        self.dependencies.push(dependency);
    }

    pub fn set_prop(&mut self, key: &str, value: serde_json::Value) {
        self.props.push((key.to_string(), value));
    }

    /// Merge the delta back into the live module.
    pub fn apply(self, module: &Arc<Module>) {
        if self.content_changed {
            if let Some(content) = self.content {
                let map = self.source_map_json.map(SourceMapData::Json);
                module.set_content(content, map);
            }
        }
        if self.path_changed {
            module.set_path(self.path);
        }
        for entry in self.logs {
            module.add_log(entry);
        }
        for dependency in self.dependencies {
            module.add_dependency(dependency);
        }
        for (key, value) in self.props {
            module.set_prop(&key, value);
        }
    }
}

type ProcessorFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Processor>> + Send + Sync>;

/// Hook invoked to install a missing processor package. Supplied by the CLI
/// layer from the `installCommand` option; the core never installs anything
/// itself.
pub type InstallHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Maps logical processor names to compiled-in factories. Unknown names go
/// through the install hook once; failures are remembered so every later file
/// gets the uniform "skipped" warning without retrying.
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, ProcessorFactory>>,
    failed: Mutex<HashMap<String, String>>,
    install_hook: RwLock<Option<InstallHook>>,
    install_queue: Mutex<()>,
    attempted_install: Mutex<HashSet<String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register("copy", |_| Ok(Arc::new(CopyProcessor) as Arc<dyn Processor>));
        registry.register("text-replace", |options| {
            Ok(Arc::new(TextReplaceProcessor::from_options(options)?) as Arc<dyn Processor>)
        });
        registry
    }

    pub fn register(
        &self,
        name: &str,
        factory: impl Fn(&serde_json::Value) -> Result<Arc<dyn Processor>> + Send + Sync + 'static,
    ) {
        self.factories
            .write()
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn set_install_hook(&self, hook: InstallHook) {
        *self.install_hook.write() = Some(hook);
    }

    /// Resolve a name to a processor instance, or the remembered failure
    /// message.
    pub fn resolve(
        &self,
        name: &str,
        options: &serde_json::Value,
    ) -> std::result::Result<Arc<dyn Processor>, String> {
        if let Some(message) = self.failed.lock().get(name) {
            return Err(message.clone());
        }

        if let Some(factory) = self.factories.read().get(name).cloned() {
            return match factory(options) {
                Ok(processor) => Ok(processor),
                Err(err) => {
                    let message = format!("processor '{}' failed to initialize: {}", name, err);
                    self.failed.lock().insert(name.to_string(), message.clone());
                    Err(message)
                }
            };
        }

        // Unknown name: try the install hook exactly once, serialised so
        // concurrent loads don't race the package manager.
        let hook = self.install_hook.read().clone();
        if let Some(hook) = hook {
            let _queue = self.install_queue.lock();
            let first_attempt = self.attempted_install.lock().insert(name.to_string());
            if first_attempt && hook(name) {
                if let Some(factory) = self.factories.read().get(name).cloned() {
                    return match factory(options) {
                        Ok(processor) => Ok(processor),
                        Err(err) => {
                            let message =
                                format!("processor '{}' failed to initialize: {}", name, err);
                            self.failed.lock().insert(name.to_string(), message.clone());
                            Err(message)
                        }
                    };
                }
            }
        }

        let message = format!("cannot find processor '{}'", name);
        self.failed.lock().insert(name.to_string(), message.clone());
        Err(message)
    }
}

/// One node of a chain: matcher, processor reference, and traversal links.
pub struct ChainNode {
    pub matcher: MatcherSet,
    pub reference: ProcessorRef,
    pub options: serde_json::Value,
    pub out_path: Option<String>,
    pub read: ReadMode,
    pub break_after: bool,
    pub parallel: Option<bool>,
    pub next_true: Option<usize>,
    pub next_false: Option<usize>,
    resolved: Mutex<Option<std::result::Result<Arc<dyn Processor>, String>>>,
}

pub enum ProcessorRef {
    Instance(Arc<dyn Processor>),
    Named(String),
}

impl ChainNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: MatcherSet,
        reference: ProcessorRef,
        options: serde_json::Value,
        out_path: Option<String>,
        read: ReadMode,
        break_after: bool,
        parallel: Option<bool>,
    ) -> Self {
        Self {
            matcher,
            reference,
            options,
            out_path,
            read,
            break_after,
            parallel,
            next_true: None,
            next_false: None,
            resolved: Mutex::new(None),
        }
    }

    fn resolve(
        &self,
        registry: &PluginRegistry,
    ) -> std::result::Result<Arc<dyn Processor>, String> {
        let mut cached = self.resolved.lock();
        if let Some(result) = cached.as_ref() {
            return result.clone();
        }
        let result = match &self.reference {
            ProcessorRef::Instance(processor) => Ok(processor.clone()),
            ProcessorRef::Named(name) => registry.resolve(name, &self.options),
        };
        *cached = Some(result.clone());
        result
    }
}

/// Linked-list chain of processor nodes, walked per module.
#[derive(Default)]
pub struct ProcessorChain {
    nodes: Vec<ChainNode>,
}

impl ProcessorChain {
    pub fn new(mut nodes: Vec<ChainNode>) -> Self {
        // Default linking: a linear chain. `break_after` cuts the true path.
        let len = nodes.len();
        for (idx, node) in nodes.iter_mut().enumerate() {
            let next = if idx + 1 < len { Some(idx + 1) } else { None };
            if node.next_false.is_none() {
                node.next_false = next;
            }
            if node.next_true.is_none() {
                node.next_true = if node.break_after { None } else { next };
            }
        }
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, label: &str) -> Option<&ChainNode> {
        self.nodes.iter().find(|n| match &n.reference {
            ProcessorRef::Named(name) => name == label,
            ProcessorRef::Instance(p) => p.name() == label,
        })
    }

    /// Walk the chain over `module`. Matchers test the current (possibly
    /// already rewritten) path. A processor error is logged on the module and
    /// terminates the walk; a state change means another phase took over.
    pub async fn run(&self, module: &Arc<Module>, builder: &Arc<Builder>) -> Result<()> {
        let entry_state = module.state();
        let mut cursor = if self.nodes.is_empty() { None } else { Some(0) };

        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            if module.state() != entry_state {
                return Ok(());
            }

            let current_path = module.path();
            if !node.matcher.matches(&current_path) {
                cursor = node.next_false;
                continue;
            }

            let processor = match node.resolve(builder.plugins()) {
                Ok(processor) => processor,
                Err(message) => {
                    module.add_log(LogEntry::warning(
                        "processor",
                        format!("skipped {}: {}", current_path.display(), message),
                    ));
                    cursor = node.next_true;
                    continue;
                }
            };

            builder.ensure_data(module, node.read).await?;
            if module.state() != entry_state {
                return Ok(());
            }

            let use_pool =
                node.parallel.unwrap_or_else(|| processor.parallel()) && builder.worker_pool() > 1;
            let outcome = if use_pool {
                run_on_pool(&processor, module).await
            } else {
                processor.process(module, builder).await
            };

            if let Err(err) = outcome {
                module.add_log(LogEntry::error(processor.name(), err.to_string()));
                return Ok(());
            }
            if module.state() != entry_state {
                return Ok(());
            }

            if let Some(template) = &node.out_path {
                builder.apply_out_path(module, template);
            }

            cursor = node.next_true;
        }
        Ok(())
    }
}

/// Ship a snapshot to the blocking pool and merge the returned delta.
async fn run_on_pool(processor: &Arc<dyn Processor>, module: &Arc<Module>) -> Result<()> {
    let delta = ModuleDelta::capture(module);
    let worker = processor.clone();
    let delta = tokio::task::spawn_blocking(move || {
        let mut delta = delta;
        worker.process_blocking(&mut delta).map(|_| delta)
    })
    .await
    .map_err(|e| TabaError::build(format!("worker pool task failed: {}", e)))??;
    delta.apply(module);
    Ok(())
}

// ---- builtin processors ----

/// Passthrough; exists so rules can opt a file class into outPath rewriting
/// without transforming content.
pub struct CopyProcessor;

#[async_trait]
impl Processor for CopyProcessor {
    fn name(&self) -> &str {
        "copy"
    }
}

/// Literal search/replace over text content.
pub struct TextReplaceProcessor {
    search: String,
    replace: String,
}

impl TextReplaceProcessor {
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
        }
    }

    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        let search = options
            .get("search")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TabaError::config("text-replace requires a 'search' option"))?;
        let replace = options
            .get("replace")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(Self::new(search, replace))
    }
}

#[async_trait]
impl Processor for TextReplaceProcessor {
    fn name(&self) -> &str {
        "text-replace"
    }

    fn parallel(&self) -> bool {
        true
    }

    fn process_blocking(&self, delta: &mut ModuleDelta) -> Result<()> {
        if let Some(content) = delta.content() {
            if content.contains(&self.search) {
                let replaced = content.replace(&self.search, &self.replace);
                delta.set_content(replaced);
            }
        }
        Ok(())
    }
}

/// Build a matcher set from optional glob lists, the shape rules use.
pub fn rule_matcher(include: &[String], exclude: &[String]) -> Result<MatcherSet> {
    let mut set = MatcherSet::new();
    for pattern in include {
        set = set.include(Matcher::glob(pattern)?);
    }
    for pattern in exclude {
        set = set.exclude(Matcher::glob(pattern)?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = PluginRegistry::new();
        assert!(registry.resolve("copy", &serde_json::Value::Null).is_ok());
        assert!(registry
            .resolve(
                "text-replace",
                &serde_json::json!({"search": "a", "replace": "b"})
            )
            .is_ok());
    }

    #[test]
    fn test_registry_remembers_failures() {
        let registry = PluginRegistry::new();
        let first = registry.resolve("no-such-thing", &serde_json::Value::Null);
        let second = registry.resolve("no-such-thing", &serde_json::Value::Null);
        assert_eq!(first.unwrap_err(), second.unwrap_err());
    }

    #[test]
    fn test_install_hook_called_once_per_package() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let registry = PluginRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        registry.set_install_hook(Arc::new(move |_name| {
            seen.fetch_add(1, Ordering::SeqCst);
            false
        }));
        let _ = registry.resolve("pkg-a", &serde_json::Value::Null);
        let _ = registry.resolve("pkg-a", &serde_json::Value::Null);
        let _ = registry.resolve("pkg-a", &serde_json::Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_construction_error_remembered() {
        let registry = PluginRegistry::new();
        // Missing required option
        let first = registry.resolve("text-replace", &serde_json::Value::Null);
        assert!(first.unwrap_err().contains("failed to initialize"));
        let second = registry.resolve("text-replace", &serde_json::Value::Null);
        assert!(second.is_err());
    }

    #[test]
    fn test_chain_linking_with_break() {
        let nodes = vec![
            ChainNode {
                matcher: MatcherSet::new(),
                reference: ProcessorRef::Named("copy".into()),
                options: serde_json::Value::Null,
                out_path: None,
                read: ReadMode::None,
                break_after: true,
                parallel: None,
                next_true: None,
                next_false: None,
                resolved: Mutex::new(None),
            },
            ChainNode {
                matcher: MatcherSet::new(),
                reference: ProcessorRef::Named("copy".into()),
                options: serde_json::Value::Null,
                out_path: None,
                read: ReadMode::None,
                break_after: false,
                parallel: None,
                next_true: None,
                next_false: None,
                resolved: Mutex::new(None),
            },
        ];
        let chain = ProcessorChain::new(nodes);
        assert_eq!(chain.nodes[0].next_true, None);
        assert_eq!(chain.nodes[0].next_false, Some(1));
        assert_eq!(chain.nodes[1].next_true, None);
    }

    #[test]
    fn test_text_replace_blocking() {
        let processor = TextReplaceProcessor::new("__VERSION__", "1.2.3");
        let module = Arc::new(crate::core::module::Module::new(
            PathBuf::from("/src/a.js"),
            1,
            "h".into(),
            false,
            Arc::new(crate::utils::mime::MimeRegistry::default()),
        ));
        module.set_content("const v = '__VERSION__';".into(), None);
        let mut delta = ModuleDelta::capture(&module);
        processor.process_blocking(&mut delta).unwrap();
        delta.apply(&module);
        assert_eq!(module.text_content().unwrap(), "const v = '1.2.3';");
    }
}
