//! The build driver: owns the module table, runs the phase sequence
//! clean → scan → load → bundle → emit → write, and carries the per-build
//! progress context.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};

use crate::bundlers;
use crate::core::bundler::{
    apply_reserved_queries, Bundler, BundlerRegistry, ReadMode, Resolution,
};
use crate::core::deferred::Deferred;
use crate::core::events::{BuildEvent, EventBus, Listener};
use crate::core::externals::{self, ExternalRule};
use crate::core::module::{
    Dependency, LogEntry, LogLevel, Module, ModuleData, ModuleState,
};
use crate::core::options::{version, BuildOptions, ProcessorRule};
use crate::core::out_path::{expand, resolve_in, root_relative, TemplateContext};
use crate::core::plugin::PluginManager;
use crate::core::processor::{
    rule_matcher, ChainNode, InstallHook, PluginRegistry, ProcessorChain, ProcessorRef,
};
use crate::core::sourcemap::{compose_for_output, relative_url};
use crate::utils::mime::MimeRegistry;
use crate::utils::{Logger, Result, TabaError};
use crate::watch::WatchIndex;

/// Which phase sequence a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Full,
    Incremental,
    /// Compute paths and maps without content I/O.
    PathOnly,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Full => "full",
            BuildMode::Incremental => "incremental",
            BuildMode::PathOnly => "pathOnly",
        }
    }
}

/// Progress and outcome counters reported to the optional reporter.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub build_mode: BuildMode,
    pub start_time: Instant,
    pub elapsed: Duration,
    pub total_task_count: usize,
    pub done_task_count: usize,
    pub files: Vec<PathBuf>,
    pub aborted: bool,
    pub error_count: usize,
    pub warning_count: usize,
    pub hash: String,
}

impl BuildContext {
    fn new(mode: BuildMode, hash: String) -> Self {
        Self {
            build_mode: mode,
            start_time: Instant::now(),
            elapsed: Duration::ZERO,
            total_task_count: 0,
            done_task_count: 0,
            files: Vec::new(),
            aborted: false,
            error_count: 0,
            warning_count: 0,
            hash,
        }
    }

    pub fn progress(&self) -> u32 {
        if self.total_task_count == 0 {
            return 0;
        }
        (self.done_task_count * 100 / self.total_task_count).min(100) as u32
    }
}

pub trait Reporter: Send + Sync {
    fn report(&self, context: &BuildContext);
}

/// One recorded output file, keyed by root-relative output path.
#[derive(Debug, Clone)]
pub struct EmittedFile {
    pub key: String,
    pub original_path: PathBuf,
    pub out_path: PathBuf,
    pub size: u64,
}

pub struct Builder {
    options: BuildOptions,
    mime: Arc<MimeRegistry>,
    modules: DashMap<PathBuf, Arc<Module>>,
    emitted: DashMap<String, EmittedFile>,
    compilers: ProcessorChain,
    optimizers: ProcessorChain,
    bundlers: RwLock<BundlerRegistry>,
    external_rules: Vec<ExternalRule>,
    plugin_registry: PluginRegistry,
    plugin_manager: PluginManager,
    deferred: Arc<Deferred>,
    events: EventBus,
    context: RwLock<BuildContext>,
    watch_index: WatchIndex,
    reporter: RwLock<Option<Arc<dyn Reporter>>>,
    module_counter: AtomicU64,
    build_hash: RwLock<String>,
    fatal: Mutex<Option<TabaError>>,
    reported_logs: DashMap<PathBuf, usize>,
}

impl Builder {
    pub fn new(options: BuildOptions) -> Result<Arc<Self>> {
        let mime = Arc::new(MimeRegistry::new(options.mime_types.clone()));

        let plugin_registry = PluginRegistry::new();
        let compilers = build_chain(&options.compilers)?;
        let optimizers = build_chain(&options.optimizers)?;

        let mut external_rules = Vec::with_capacity(options.external_modules.len());
        for rule in &options.external_modules {
            external_rules.push(ExternalRule {
                matcher: rule_matcher(
                    &rule
                        .matches
                        .clone()
                        .map(|m| m.into_vec())
                        .unwrap_or_default(),
                    &rule
                        .exclude
                        .clone()
                        .map(|m| m.into_vec())
                        .unwrap_or_default(),
                )?,
                mime: rule.match_type.clone(),
                min_size: rule.min_size,
                out_path: rule.out_path.clone(),
            });
        }

        let mut registry = BundlerRegistry::new();
        bundlers::register_defaults(&mut registry);
        for ext in &options.disabled_bundlers {
            registry.unregister(ext);
        }

        let plugin_manager = PluginManager::new(options.plugins.clone());

        let builder = Arc::new(Self {
            mime,
            modules: DashMap::new(),
            emitted: DashMap::new(),
            compilers,
            optimizers,
            bundlers: RwLock::new(registry),
            external_rules,
            plugin_registry,
            plugin_manager,
            deferred: Deferred::new(),
            events: EventBus::new(),
            context: RwLock::new(BuildContext::new(BuildMode::Full, new_build_hash())),
            watch_index: WatchIndex::new(),
            reporter: RwLock::new(None),
            module_counter: AtomicU64::new(0),
            build_hash: RwLock::new(new_build_hash()),
            fatal: Mutex::new(None),
            reported_logs: DashMap::new(),
            options,
        });
        Ok(builder)
    }

    // ---- accessors ----

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn root_dir(&self) -> &Path {
        &self.options.root_dir
    }

    pub fn out_dir(&self) -> &Path {
        &self.options.out_dir
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugin_registry
    }

    pub fn set_install_hook(&self, hook: InstallHook) {
        self.plugin_registry.set_install_hook(hook);
    }

    pub fn register_bundler(&self, ext: &str, bundler: Arc<dyn Bundler>) {
        self.bundlers.write().register(ext, bundler);
    }

    pub fn on(&self, listener: Listener) {
        self.events.subscribe(listener);
    }

    pub fn events_ref(&self) -> &EventBus {
        &self.events
    }

    pub fn set_reporter(&self, reporter: Arc<dyn Reporter>) {
        *self.reporter.write() = Some(reporter);
    }

    pub fn watch_index(&self) -> &WatchIndex {
        &self.watch_index
    }

    pub fn build_hash(&self) -> String {
        self.build_hash.read().clone()
    }

    pub fn worker_pool(&self) -> usize {
        self.options.parallel
    }

    pub fn context(&self) -> BuildContext {
        self.context.read().clone()
    }

    pub fn emitted_files(&self) -> Vec<EmittedFile> {
        let mut files: Vec<_> = self.emitted.iter().map(|e| e.value().clone()).collect();
        files.sort_by(|a, b| a.key.cmp(&b.key));
        files
    }

    pub fn emitted_file(&self, key: &str) -> Option<EmittedFile> {
        self.emitted.get(key).map(|e| e.value().clone())
    }

    // ---- module table ----

    fn next_module_hash(&self) -> String {
        let counter = self.module_counter.fetch_add(1, Ordering::SeqCst);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{:x}-{:x}", counter, millis)
    }

    /// Whether a path would be picked up by the scanner as an entry.
    pub fn is_entry_path(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.options.root_dir) else {
            return false;
        };
        if path.starts_with(&self.options.out_dir) {
            return false;
        }
        self.options.matches.matches(relative) && self.options.filter.matches(relative)
    }

    /// Get or create the module for `path` (normalized, rooted). There is
    /// exactly one module per original path.
    pub fn get_module(&self, path: &Path) -> Arc<Module> {
        let normalized = self.normalize(path);
        if let Some(existing) = self.modules.get(&normalized) {
            return existing.clone();
        }
        let is_external = !self.is_entry_path(&normalized);
        let module = Arc::new(Module::new(
            normalized.clone(),
            self.module_counter.fetch_add(1, Ordering::SeqCst),
            self.next_module_hash(),
            is_external,
            self.mime.clone(),
        ));
        self.modules
            .entry(normalized)
            .or_insert(module)
            .value()
            .clone()
    }

    pub fn module_at(&self, path: &Path) -> Option<Arc<Module>> {
        self.modules.get(&self.normalize(path)).map(|m| m.value().clone())
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.iter().map(|m| m.value().clone()).collect()
    }

    /// Lexical normalization: rooted at `root_dir` when relative, `.`/`..`
    /// folded without touching the filesystem.
    fn normalize(&self, path: &Path) -> PathBuf {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.options.root_dir.join(path)
        };
        let mut out = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Register a sub-file module carved out of `parent` at byte `index`.
    /// The synthetic path keeps the parent visible in diagnostics.
    pub fn create_subfile(
        &self,
        parent: &Arc<Module>,
        index: usize,
        content: String,
        ext: &str,
    ) -> Arc<Module> {
        let parent_path = parent.path();
        let synthetic = PathBuf::from(format!(
            "{}#{}.{}",
            parent_path.display(),
            index,
            ext.trim_start_matches('.')
        ));
        let module = self.get_module(&synthetic);
        // A re-parse of the parent must see a fresh sub-file, not the one
        // left over from the previous build.
        if module.state() != ModuleState::Initial {
            module.reset(ModuleState::Initial, self.next_module_hash());
        }
        module.mark_subfile(parent, index);
        module.set_data(ModuleData::Text(content));
        if self.options.source_map.enabled() {
            module.set_source_map_enabled(true);
        }
        module
    }

    // ---- builds ----

    /// Full build: clean, scan, then the shared load/bundle/emit pipeline.
    pub async fn build(self: &Arc<Self>) -> Result<BuildContext> {
        self.plugin_manager.apply_all(self)?;
        self.start_build(BuildMode::Full);

        if self.options.clean && !self.options.no_write {
            self.clean_out_dir().await?;
        }

        let entries = self.scan()?;
        self.run_pipeline(entries, BuildMode::Full).await
    }

    /// Incremental build over a caller-supplied entry set; the module table
    /// is reused and modules not reset by the watcher are skipped.
    pub async fn build_incremental(
        self: &Arc<Self>,
        entries: Vec<Arc<Module>>,
    ) -> Result<BuildContext> {
        self.plugin_manager.apply_all(self)?;
        self.start_build(BuildMode::Incremental);
        self.run_pipeline(entries, BuildMode::Incremental).await
    }

    /// Path-only build: everything runs against empty content.
    pub async fn build_path_only(self: &Arc<Self>) -> Result<BuildContext> {
        self.plugin_manager.apply_all(self)?;
        self.start_build(BuildMode::PathOnly);
        let entries = self.scan()?;
        for entry in &entries {
            entry.set_no_data(true);
        }
        self.run_pipeline(entries, BuildMode::PathOnly).await
    }

    fn start_build(&self, mode: BuildMode) {
        *self.build_hash.write() = new_build_hash();
        *self.context.write() = BuildContext::new(mode, self.build_hash());
        *self.fatal.lock() = None;
        self.events.emit(&BuildEvent::BuildStart {
            build_mode: mode.as_str(),
        });
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        entries: Vec<Arc<Module>>,
        mode: BuildMode,
    ) -> Result<BuildContext> {
        // load + emit per entry, plus the scan and bundle tasks.
        {
            let mut context = self.context.write();
            context.total_task_count = entries.len() * 2 + 2;
            context.done_task_count = 1; // scan
        }

        // Load fan-out; the barrier drains when the whole reachable graph
        // is loaded.
        for entry in &entries {
            self.load_file(entry);
        }
        self.deferred.wait().await;
        self.check_fatal()?;
        self.check_bail()?;

        // Bundle: once per registered bundler.
        let registered = self.bundlers.read().all();
        for (_ext, bundler) in registered {
            bundler.bundle(&entries, self).await?;
        }
        self.bump_done(1);

        // Emit sequentially per entry for deterministic dependency order.
        for entry in &entries {
            if self.context.read().aborted {
                break;
            }
            self.emit_file(entry).await?;
            self.check_bail()?;
        }

        self.finish_build()
    }

    fn finish_build(&self) -> Result<BuildContext> {
        let snapshot = {
            let mut context = self.context.write();
            context.elapsed = context.start_time.elapsed();
            context.clone()
        };
        self.events.emit(&BuildEvent::BuildEnd {
            error_count: snapshot.error_count,
            warning_count: snapshot.warning_count,
            aborted: snapshot.aborted,
        });
        if let Some(reporter) = self.reporter.read().clone() {
            reporter.report(&snapshot);
        }
        self.check_fatal()?;
        Ok(snapshot)
    }

    /// Signal every in-flight load/emit to stop at its next checkpoint.
    pub fn abort(&self) {
        self.context.write().aborted = true;
        for module in self.modules.iter() {
            let module = module.value();
            if matches!(
                module.state(),
                ModuleState::Loading | ModuleState::Loaded | ModuleState::Emitting
            ) {
                module.set_state(ModuleState::Changing);
            }
        }
    }

    fn check_fatal(&self) -> Result<()> {
        if let Some(err) = self.fatal.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    fn check_bail(&self) -> Result<()> {
        if self.options.bail && self.context.read().error_count > 0 {
            return Err(TabaError::build("build failed (bail is enabled)"));
        }
        Ok(())
    }

    fn record_fatal(&self, err: TabaError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn bump_done(&self, n: usize) {
        self.context.write().done_task_count += n;
    }

    async fn clean_out_dir(&self) -> Result<()> {
        let out_dir = &self.options.out_dir;
        if out_dir == &self.options.root_dir {
            return Err(TabaError::config(
                "refusing to clean: outDir equals rootDir",
            ));
        }
        if out_dir.exists() {
            tokio::fs::remove_dir_all(out_dir).await?;
        }
        tokio::fs::create_dir_all(out_dir).await?;
        self.emitted.clear();
        Ok(())
    }

    /// Walk the root directory, pruning ignored and excluded subtrees, and
    /// return entry modules sorted by original path so two full builds
    /// produce identical orderings.
    fn scan(&self) -> Result<Vec<Arc<Module>>> {
        let ignored = crate::utils::default_ignored();
        let root = self.options.root_dir.clone();
        let out_dir = self.options.out_dir.clone();

        let mut paths = Vec::new();
        let walker = walkdir::WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let path = entry.path();
                if path == root {
                    return true;
                }
                if path == out_dir {
                    return false;
                }
                let relative = path.strip_prefix(&root).unwrap_or(path);
                ignored.matches(relative)
            });

        for entry in walker {
            let entry = entry.map_err(|e| TabaError::build(format!("scan failed: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if self.is_entry_path(entry.path()) {
                paths.push(entry.path().to_path_buf());
            }
        }
        paths.sort();
        Ok(paths.iter().map(|p| self.get_module(p)).collect())
    }

    // ---- load phase ----

    /// Start loading a module. Recursive fan-out: children are spawned, not
    /// awaited; the deferred barrier tracks completion of the whole tree.
    pub fn load_file(self: &Arc<Self>, module: &Arc<Module>) {
        if !module.transition(ModuleState::Initial, ModuleState::Loading) {
            return;
        }
        self.deferred.begin();
        let builder = self.clone();
        let module = module.clone();
        tokio::spawn(async move {
            if let Err(err) = builder.load_body(&module).await {
                builder.record_fatal(err);
            }
            builder.deferred.end();
        });
    }

    async fn load_body(self: &Arc<Self>, module: &Arc<Module>) -> Result<()> {
        if self.options.source_map.enabled() {
            module.set_source_map_enabled(true);
        }

        // Compiler chain; may rewrite path and data.
        self.compilers.run(module, self).await?;
        if module.state() != ModuleState::Loading {
            return Ok(()); // another phase took over
        }

        let bundler = self.bundlers.read().get(&module.ext());
        if let Some(bundler) = &bundler {
            module.set_bundler(Some(bundler.clone()));
            if let Err(err) = self.ensure_data(module, bundler.read_mode()).await {
                module.add_log(LogEntry::error(
                    "read",
                    format!("cannot read {}: {}", module.original_path().display(), err),
                ));
            } else {
                if let Err(err) = bundler.parse(module, self).await {
                    module.add_log(LogEntry::error("bundler", err.to_string()));
                }
                if module.state() != ModuleState::Loading {
                    return Ok(());
                }
                self.resolve_dependencies(module, bundler).await;
            }
        }
        if module.state() != ModuleState::Loading {
            return Ok(());
        }

        module.set_state(ModuleState::Loaded);
        self.watch_index.update_module(module);
        self.bump_done(1);
        self.events.emit(&BuildEvent::LoadFile {
            module: module.clone(),
        });
        self.report_logs(module);
        Ok(())
    }

    async fn resolve_dependencies(self: &Arc<Self>, module: &Arc<Module>, bundler: &Arc<dyn Bundler>) {
        let count = module.dependency_count();
        for index in 0..count {
            let Some(dep) = module.with_dependency_mut(index, |d| {
                apply_reserved_queries(d);
                d.clone()
            }) else {
                continue;
            };

            if let Some(resolved) = &dep.resolved_file {
                self.load_file(resolved);
                continue;
            }
            if dep.no_check {
                continue;
            }

            match bundler.resolve(&dep, module, self) {
                Resolution::Resolved(path) => {
                    let child = self.get_module(&path);
                    module.with_dependency_mut(index, |d| {
                        d.resolved_path = Some(path.clone());
                        d.resolved_file = Some(child.clone());
                    });
                    self.load_file(&child);
                }
                Resolution::Ignore => {}
                Resolution::NotFound => {
                    let level = if dep.dynamic {
                        LogLevel::Warning
                    } else {
                        LogLevel::Error
                    };
                    let mut entry = LogEntry::new(
                        level,
                        "bundler",
                        format!("cannot find '{}'", dep.url),
                    );
                    if let (Some(start), Some(end)) = (dep.index, dep.end_index) {
                        entry = entry.at_index(start, end);
                    }
                    module.add_log(entry);
                    self.events.emit(&BuildEvent::DependencyNotFound {
                        module: module.clone(),
                        url: dep.url.clone(),
                    });
                }
            }
        }
    }

    /// Populate module data from disk per the requested read mode.
    pub async fn ensure_data(&self, module: &Arc<Module>, read: ReadMode) -> Result<()> {
        if read == ReadMode::None || module.has_data() || module.no_data() {
            return Ok(());
        }
        let path = module.original_path().to_path_buf();
        match read {
            ReadMode::Text => {
                let bytes = tokio::fs::read(&path).await?;
                module.set_data(ModuleData::Text(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ));
            }
            ReadMode::Binary => {
                let bytes = tokio::fs::read(&path).await?;
                module.set_data(ModuleData::Binary(bytes));
            }
            ReadMode::None => {}
        }
        Ok(())
    }

    /// Expand an `outPath` template against a module and rewrite its path.
    /// Used by processor chain nodes after a successful invocation.
    pub fn apply_out_path(&self, module: &Arc<Module>, template: &str) {
        // Compile-phase rewrites live in source space; optimizer rewrites on
        // emit clones live in output space.
        let base = if module.state() == ModuleState::Emitting {
            &self.options.out_dir
        } else {
            &self.options.root_dir
        };
        let relative = root_relative(&module.path(), base);
        let hash = module.hash();
        let build_hash = self.build_hash();
        let md5 = || module.md5();
        let sha1 = || module.sha1();
        let cx = TemplateContext {
            path: &relative,
            hash: &hash,
            build_hash: &build_hash,
            version: version(),
            md5: &md5,
            sha1: &sha1,
        };
        let expanded = expand(template, &cx);
        module.set_path(resolve_in(base, &expanded));
    }

    // ---- emit phase ----

    /// Emit a loaded module: ensure non-skipped dependencies are emitted
    /// (marking cycles), then generate, optimize, place, map, record, and
    /// write the output clone.
    pub fn emit_file<'a>(
        self: &'a Arc<Self>,
        module: &'a Arc<Module>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !module.transition(ModuleState::Loaded, ModuleState::Emitting) {
                return Ok(());
            }

            // Pass A: pre-scan dependencies and mark cycle-closing edges.
            // A child already in Emitting is an ancestor of this very call
            // chain, so awaiting it would deadlock.
            let deps = module.dependencies();
            for (index, dep) in deps.iter().enumerate() {
                let Some(child) = &dep.resolved_file else {
                    continue;
                };
                if !dep.inline && dep.kind.skips_emit() {
                    continue;
                }
                if child.state() == ModuleState::Emitting && child.generated().is_none() {
                    module.with_dependency_mut(index, |d| d.circular = true);
                    if dep.inline && dep.dynamic {
                        module.with_dependency_mut(index, |d| d.inline = false);
                        module.add_log(LogEntry::warning(
                            "bundler",
                            format!(
                                "circular dependency on '{}', inlining disabled",
                                dep.url
                            ),
                        ));
                    } else if !dep.dynamic {
                        module.with_dependency_mut(index, |d| d.resolved_file = None);
                        module.add_log(LogEntry::error(
                            "bundler",
                            format!("circular dependency on '{}'", dep.url),
                        ));
                    }
                }
            }

            // Pass B: emit children, skipping the circular edges marked above.
            let deps = module.dependencies();
            for (index, dep) in deps.iter().enumerate() {
                let Some(child) = &dep.resolved_file else {
                    continue;
                };
                if dep.circular || (!dep.inline && dep.kind.skips_emit()) {
                    continue;
                }
                if child.state() == ModuleState::Loaded {
                    self.emit_file(child).await?;
                }
                if let Some(generated) = child.generated() {
                    if generated.no_write() && !dep.inline {
                        module.with_dependency_mut(index, |d| d.inline = true);
                    }
                    let inline_now =
                        module.dependencies().get(index).map(|d| d.inline).unwrap_or(false);
                    if inline_now && !generated.has_data() {
                        self.ensure_data(&generated, ReadMode::Binary).await?;
                    }
                }
            }
            if module.state() != ModuleState::Emitting {
                return Ok(()); // aborted mid-emit
            }

            // Detached output clone; the loaded module stays pristine for
            // incremental rebuilds.
            let generated = Arc::new(module.clone_for_emit());
            self.place_output(module, &generated);

            if let Some(bundler) = module.bundler() {
                bundler.generate(module, &generated, self).await?;
            }

            if self.options.optimize && self.context.read().error_count == 0 {
                self.optimizers.run(&generated, self).await?;
            }

            self.attach_source_map(module, &generated)?;

            let path_only = self.context.read().build_mode == BuildMode::PathOnly;
            if !generated.no_write() && !generated.has_data() && !path_only {
                self.ensure_data(&generated, ReadMode::Binary).await?;
            }
            self.record_emitted(module, &generated);

            let write_output =
                !self.options.no_write && !generated.no_write() && !path_only;
            if write_output {
                // An I/O failure abandons this module, not the build.
                if let Err(err) = self.write_output(&generated).await {
                    module.add_log(LogEntry::error("write", err.to_string()));
                }
            }

            module.set_generated(Some(generated));
            module.set_state(ModuleState::Emitted);
            self.bump_done(1);
            self.events.emit(&BuildEvent::EmitFile {
                module: module.clone(),
            });
            self.report_logs(module);
            Ok(())
        })
    }

    /// Decide the output path for the emit clone: the mirrored location for
    /// entry modules, the external-module policy for everything else.
    fn place_output(&self, module: &Arc<Module>, generated: &Arc<Module>) {
        // Sub-files are embedded into their parent, never standalone output.
        // They still get a mirrored path so URLs they rewrite are computed
        // against the parent's output directory.
        if module.is_subfile() {
            let relative = root_relative(&generated.path(), &self.options.root_dir);
            generated.set_path(self.options.out_dir.join(&relative));
            generated.set_no_write(true);
            return;
        }
        if module.is_external() {
            let hash = generated.hash();
            let build_hash = self.build_hash();
            let key = externals::extraction_path(
                &self.external_rules,
                generated,
                &hash,
                &build_hash,
                version(),
                |candidate| self.emitted.contains_key(candidate),
            );
            match key {
                Some(key) => {
                    generated.set_path(self.options.out_dir.join(&key));
                    generated.set_no_write(false);
                }
                None => generated.set_no_write(true),
            }
            return;
        }

        let relative = root_relative(&generated.path(), &self.options.root_dir);
        let out_path = self.options.out_dir.join(&relative);

        if !self.options.no_path_check {
            if !out_path.starts_with(&self.options.out_dir) {
                module.add_log(LogEntry::error(
                    "emit",
                    format!(
                        "output path {} escapes the output directory",
                        out_path.display()
                    ),
                ));
                generated.set_no_write(true);
            } else if out_path == module.original_path() {
                module.add_log(LogEntry::error(
                    "emit",
                    format!(
                        "output path {} would overwrite the source file",
                        out_path.display()
                    ),
                ));
                generated.set_no_write(true);
            }
        }
        generated.set_path(out_path);
    }

    fn attach_source_map(&self, module: &Arc<Module>, generated: &Arc<Module>) -> Result<()> {
        if !self.options.source_map.enabled() {
            return Ok(());
        }
        let Some(mut data) = generated.take_source_map_data() else {
            return Ok(());
        };
        let composer_options = self.options.source_map.composer_options();
        let composed = compose_for_output(
            &mut data,
            &generated.path(),
            &self.options.root_dir,
            &generated.mime_type(),
            &composer_options,
        )?;

        if let Some(content) = generated.text_content() {
            let mut content = content;
            content.push_str(&composed.url_comment);
            generated.set_content(content, None);
        }

        if let Some((map_path, json)) = composed.sibling {
            let sibling = Arc::new(Module::new(
                map_path.clone(),
                module.id(),
                generated.hash(),
                module.is_external(),
                self.mime.clone(),
            ));
            sibling.set_data(ModuleData::Text(json));
            sibling.set_path(map_path);
            generated.add_sibling(sibling);
        }
        Ok(())
    }

    /// Record the output under its root-relative key, detecting collisions
    /// between different source files (I6).
    fn record_emitted(&self, module: &Arc<Module>, generated: &Arc<Module>) {
        if generated.no_write() {
            return;
        }
        let key = root_relative(&generated.path(), &self.options.out_dir);
        if let Some(existing) = self.emitted.get(&key) {
            if existing.original_path != module.original_path() {
                let other = existing.original_path.clone();
                drop(existing);
                module.add_log(LogEntry::error(
                    "emit",
                    format!(
                        "output path '{}' collides with the output of {}",
                        key,
                        other.display()
                    ),
                ));
                generated.set_no_write(true);
                // Mutual watch: deleting either source re-emits the other.
                self.watch_index
                    .add_reload_on_delete(&other, module.original_path());
                self.watch_index
                    .add_reload_on_delete(module.original_path(), &other);
                return;
            }
        }
        self.emitted.insert(
            key.clone(),
            EmittedFile {
                key,
                original_path: module.original_path().to_path_buf(),
                out_path: generated.path(),
                size: generated.size(),
            },
        );
    }

    async fn write_output(&self, generated: &Arc<Module>) -> Result<()> {
        if !generated.has_data() {
            self.ensure_data(generated, ReadMode::Binary).await?;
        }
        let mut writes = Vec::new();
        writes.push((generated.path(), generated.bytes().unwrap_or_default()));
        for sibling in generated.siblings() {
            writes.push((sibling.path(), sibling.bytes().unwrap_or_default()));
        }

        // Sibling writes go out in parallel; emit order stays sequential.
        let results = futures::future::join_all(writes.into_iter().map(|(path, bytes)| {
            let events = &self.events;
            async move {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let size = bytes.len() as u64;
                tokio::fs::write(&path, bytes).await?;
                events.emit(&BuildEvent::WriteFile {
                    path: path.clone(),
                    size,
                });
                Ok::<PathBuf, std::io::Error>(path)
            }
        }))
        .await;

        for result in results {
            match result {
                Ok(path) => self.context.write().files.push(path),
                Err(err) => {
                    generated.set_no_write(true);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Rewrite target for one dependency of `module`, as it should appear in
    /// the generated output. `None` leaves the original reference untouched.
    pub fn dependency_url(
        &self,
        generated: &Arc<Module>,
        dep: &Dependency,
    ) -> Option<String> {
        if dep.circular {
            return None;
        }
        let child = dep.resolved_file.as_ref()?;
        let child_out = child.generated().unwrap_or_else(|| child.clone());

        if dep.inline || child_out.no_write() {
            let bytes = child_out.bytes().or_else(|| child.bytes())?;
            return Some(externals::encode_data_uri(&child_out.mime_type(), &bytes));
        }

        let parent_dir = generated.path().parent()?.to_path_buf();
        Some(relative_url(&parent_dir, &child_out.path()) + &dep.url_suffix())
    }

    // ---- diagnostics ----

    /// Forward unreported module logs to the logger, the event bus and the
    /// build counters.
    pub fn report_logs(&self, module: &Arc<Module>) {
        let from = self
            .reported_logs
            .get(module.original_path())
            .map(|c| *c)
            .unwrap_or(0);
        let fresh = module.logs_since(from);
        if fresh.is_empty() {
            return;
        }
        self.reported_logs
            .insert(module.original_path().to_path_buf(), from + fresh.len());

        let mut context = self.context.write();
        for entry in &fresh {
            match entry.level {
                LogLevel::Error => context.error_count += 1,
                LogLevel::Warning => context.warning_count += 1,
                LogLevel::Info => {}
            }
        }
        drop(context);

        for entry in fresh {
            let location = entry
                .file_name
                .as_ref()
                .map(|f| f.display().to_string())
                .unwrap_or_default();
            let line = match (entry.line, entry.column) {
                (Some(l), Some(c)) => format!("{}:{}:{}", location, l + 1, c + 1),
                _ => location,
            };
            match entry.level {
                LogLevel::Error => Logger::error(&format!("{} [{}] {}", line, entry.source, entry.message)),
                LogLevel::Warning => Logger::warn(&format!("{} [{}] {}", line, entry.source, entry.message)),
                LogLevel::Info => Logger::info(&format!("{} [{}] {}", line, entry.source, entry.message)),
            }
            self.events.emit(&BuildEvent::BuildLog {
                module: module.clone(),
                entry,
            });
        }
    }

    // ---- watcher support ----

    /// Reset a module back to `Initial`/`Deleted` ahead of an incremental
    /// rebuild, clearing its reported-log counter and emitted outputs.
    pub async fn reset_module(&self, module: &Arc<Module>, state: ModuleState) {
        let delete_outputs = state == ModuleState::Deleted;
        self.remove_emitted_outputs(module, delete_outputs).await;
        self.reported_logs.remove(module.original_path());
        module.reset(state, self.next_module_hash());
        self.events.emit(&BuildEvent::ResetFile {
            module: module.clone(),
        });
    }

    /// Drop the module's entries from the emitted index, optionally deleting
    /// the files on disk.
    pub async fn remove_emitted_outputs(&self, module: &Arc<Module>, delete_from_disk: bool) {
        let keys: Vec<String> = self
            .emitted
            .iter()
            .filter(|e| e.value().original_path == module.original_path())
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.emitted.remove(&key) {
                if delete_from_disk && !self.options.no_write {
                    let _ = tokio::fs::remove_file(&entry.out_path).await;
                }
            }
        }
    }
}

fn build_chain(rules: &[ProcessorRule]) -> Result<ProcessorChain> {
    let mut nodes = Vec::with_capacity(rules.len());
    for rule in rules {
        let reference = match (&rule.processor, &rule.use_name) {
            (Some(instance), _) => ProcessorRef::Instance(instance.clone()),
            (None, Some(name)) => ProcessorRef::Named(name.clone()),
            (None, None) => {
                return Err(TabaError::config(
                    "processor rule needs either 'use' or a processor instance",
                ))
            }
        };
        nodes.push(ChainNode::new(
            rule_matcher(&rule.matches, &rule.excludes)?,
            reference,
            rule.options.clone(),
            rule.out_path.clone(),
            rule.read,
            rule.break_after,
            rule.parallel,
        ));
    }
    Ok(ProcessorChain::new(nodes))
}

fn new_build_hash() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_for(root: &Path) -> Arc<Builder> {
        let options = BuildOptions {
            root_dir: root.to_path_buf(),
            out_dir: root.join("dist"),
            ..Default::default()
        };
        Builder::new(options).unwrap()
    }

    #[test]
    fn test_module_table_is_keyed_by_normalized_path() {
        let builder = builder_for(Path::new("/project/src"));
        let a = builder.get_module(Path::new("/project/src/a/../main.js"));
        let b = builder.get_module(Path::new("/project/src/main.js"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_relative_paths_root_at_root_dir() {
        let builder = builder_for(Path::new("/project/src"));
        let m = builder.get_module(Path::new("lib/util.js"));
        assert_eq!(
            m.original_path(),
            Path::new("/project/src/lib/util.js")
        );
    }

    #[test]
    fn test_entry_vs_external_classification() {
        let builder = builder_for(Path::new("/project/src"));
        assert!(builder.is_entry_path(Path::new("/project/src/app.js")));
        assert!(!builder.is_entry_path(Path::new("/project/vendor/lib.js")));
        let external = builder.get_module(Path::new("/project/vendor/lib.js"));
        assert!(external.is_external());
        let entry = builder.get_module(Path::new("/project/src/app.js"));
        assert!(!entry.is_external());
    }

    #[test]
    fn test_module_hashes_are_unique() {
        let builder = builder_for(Path::new("/p"));
        let a = builder.get_module(Path::new("/p/a.js"));
        let b = builder.get_module(Path::new("/p/b.js"));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_subfile_registration() {
        let builder = builder_for(Path::new("/p"));
        let parent = builder.get_module(Path::new("/p/page.html"));
        parent.set_content("<style>a{}</style>".into(), None);
        let child = builder.create_subfile(&parent, 7, "a{}".into(), "css");
        assert!(child.is_subfile());
        assert_eq!(child.ext(), "css");
        assert!(Arc::ptr_eq(&child.subfile_parent().unwrap(), &parent));
        // Registered in the table (I3)
        assert!(builder.module_at(&child.original_path().to_path_buf()).is_some());
    }
}
