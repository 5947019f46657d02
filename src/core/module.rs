//! The module value object: one tracked source, intermediate, or generated
//! artifact, with its lifecycle state, content, map, dependencies, and logs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::core::sourcemap::{compose, SourceMapData};
use crate::utils::mime::MimeRegistry;
use crate::utils::text::{code_frame, position_at};
use crate::utils::hash as digest;

/// Lifecycle states. The happy path walks Initial → Loading → Loaded →
/// Emitting → Emitted; the watcher pushes modules back to Initial/Deleted
/// through the pending-change states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Initial,
    Loading,
    Loaded,
    Emitting,
    Emitted,
    Deleted,
    Changing,
    Creating,
    Deleting,
}

impl ModuleState {
    /// Watcher-owned states awaiting the next incremental build.
    pub fn is_pending_change(self) -> bool {
        matches!(
            self,
            ModuleState::Changing | ModuleState::Creating | ModuleState::Deleting
        )
    }
}

/// Lazily generated content: text plus the map that produced it.
pub struct GeneratedContent {
    pub text: String,
    pub source_map: Option<SourceMapData>,
}

/// Module content in whichever form the producer left it.
#[derive(Clone)]
pub enum ModuleData {
    Text(String),
    Binary(Vec<u8>),
    Lazy(Arc<dyn Fn() -> GeneratedContent + Send + Sync>),
}

impl std::fmt::Debug for ModuleData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleData::Text(t) => write!(f, "Text({} bytes)", t.len()),
            ModuleData::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            ModuleData::Lazy(_) => write!(f, "Lazy(..)"),
        }
    }
}

/// Dependency kind labels recorded by bundlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// `import`/`@import` edges that participate in emit ordering.
    Import,
    /// Asset references (`url(...)`, `src=`, `href=`); inline-capable.
    Url,
    /// Server-side style includes whose content is spliced into the parent.
    Include,
    /// Module-graph links emitted as separate chunks; never awaited.
    StaticImport,
    /// Configured external reference.
    External,
    /// Expanded list of configured externals.
    ExternalList,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::Import => "import",
            DependencyKind::Url => "url",
            DependencyKind::Include => "include",
            DependencyKind::StaticImport => "static-import",
            DependencyKind::External => "external",
            DependencyKind::ExternalList => "external-list",
        }
    }

    /// Kinds skipped during emit unless the dependency is inlined.
    pub fn skips_emit(self) -> bool {
        matches!(
            self,
            DependencyKind::StaticImport | DependencyKind::External | DependencyKind::ExternalList
        )
    }
}

/// One directed edge recorded by a bundler during parse.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Raw reference text as written in the source.
    pub url: String,
    pub pathname: String,
    pub search: String,
    pub fragment: String,
    pub query: Vec<(String, String)>,
    /// Byte range of the reference in the parent's source.
    pub index: Option<usize>,
    pub end_index: Option<usize>,
    pub kind: DependencyKind,
    /// Failure to resolve a dynamic dependency is a warning, not an error.
    pub dynamic: bool,
    /// Embed the target as a data URI instead of referencing it.
    pub inline: bool,
    /// Reserved `noCheckQuery` seen; resolution is skipped entirely.
    pub no_check: bool,
    pub resolved_path: Option<PathBuf>,
    pub resolved_file: Option<Arc<Module>>,
    /// Set during emit when this edge closes a cycle.
    pub circular: bool,
}

impl Dependency {
    pub fn new(url: &str, kind: DependencyKind) -> Self {
        let (rest, fragment) = match url.split_once('#') {
            Some((r, f)) => (r, f.to_string()),
            None => (url, String::new()),
        };
        let (pathname, search) = match rest.split_once('?') {
            Some((p, s)) => (p.to_string(), s.to_string()),
            None => (rest.to_string(), String::new()),
        };
        let query = search
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Self {
            url: url.to_string(),
            pathname,
            search,
            fragment,
            query,
            index: None,
            end_index: None,
            kind,
            dynamic: false,
            inline: false,
            no_check: false,
            resolved_path: None,
            resolved_file: None,
            circular: false,
        }
    }

    pub fn at(mut self, index: usize, end_index: usize) -> Self {
        self.index = Some(index);
        self.end_index = Some(end_index);
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// The suffix (`?search#fragment`) carried through to the rewritten URL,
    /// with reserved query parameters already stripped.
    pub fn url_suffix(&self) -> String {
        let mut suffix = String::new();
        if !self.search.is_empty() {
            suffix.push('?');
            suffix.push_str(&self.search);
        }
        if !self.fragment.is_empty() {
            suffix.push('#');
            suffix.push_str(&self.fragment);
        }
        suffix
    }
}

/// Pending range replacement registered during parse, evaluated during
/// generate. `dep` indexes into the owning module's dependency list.
#[derive(Debug, Clone, Copy)]
pub struct Replacement {
    pub start: usize,
    pub end: usize,
    pub dep: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Final resolved location after remapping through sub-file snapshots.
#[derive(Debug, Clone)]
pub struct OriginalLocation {
    pub file: PathBuf,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

/// One diagnostic attached to a module.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Producer label: "compiler", "bundler", "optimizer", ...
    pub source: String,
    pub message: String,
    pub file_name: Option<PathBuf>,
    pub index: Option<usize>,
    pub end_index: Option<usize>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub end_line: Option<usize>,
    pub end_column: Option<usize>,
    pub content: Option<String>,
    pub code_frame: Option<String>,
    pub original_location: Option<OriginalLocation>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.to_string(),
            message: message.into(),
            file_name: None,
            index: None,
            end_index: None,
            line: None,
            column: None,
            end_line: None,
            end_column: None,
            content: None,
            code_frame: None,
            original_location: None,
        }
    }

    pub fn error(source: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, source, message)
    }

    pub fn warning(source: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, source, message)
    }

    pub fn at_index(mut self, index: usize, end_index: usize) -> Self {
        self.index = Some(index);
        self.end_index = Some(end_index);
        self
    }
}

/// Snapshot of a parent taken when a sub-file is split out of it, used to
/// remap log locations back to the parent.
#[derive(Debug)]
struct SubfileOrigin {
    parent: Weak<Module>,
    parent_path: PathBuf,
    data: String,
    index: usize,
    source_map: Option<SourceMapData>,
    revision: u64,
}

#[derive(Default)]
struct ModuleInner {
    path: PathBuf,
    state: ModuleState,
    data: Option<ModuleData>,
    no_data: bool,
    source_map: bool,
    source_map_data: Option<SourceMapData>,
    dependencies: Vec<Dependency>,
    replacements: Vec<Replacement>,
    siblings: Vec<Arc<Module>>,
    subfile: Option<SubfileOrigin>,
    logs: Vec<LogEntry>,
    props: HashMap<String, serde_json::Value>,
    hash: String,
    no_write: bool,
    bundler: Option<Arc<dyn crate::core::bundler::Bundler>>,
    generated: Option<Arc<Module>>,
    modified: bool,
    md5: Option<String>,
    sha1: Option<String>,
    size: Option<u64>,
    revision: u64,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState::Initial
    }
}

/// A tracked file or in-memory fragment. Created by the builder's module
/// table; shared by reference everywhere else.
pub struct Module {
    original_path: PathBuf,
    is_external: bool,
    id: u64,
    mime: Arc<MimeRegistry>,
    inner: RwLock<ModuleInner>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("original_path", &self.original_path)
            .field("state", &self.state())
            .finish()
    }
}

impl Module {
    pub fn new(
        original_path: PathBuf,
        id: u64,
        hash: String,
        is_external: bool,
        mime: Arc<MimeRegistry>,
    ) -> Self {
        let inner = ModuleInner {
            path: original_path.clone(),
            hash,
            ..Default::default()
        };
        Self {
            original_path,
            is_external,
            id,
            mime,
            inner: RwLock::new(inner),
        }
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> PathBuf {
        self.inner.read().path.clone()
    }

    pub fn set_path(&self, path: PathBuf) {
        self.inner.write().path = path;
    }

    /// Extension (lowercase, without dot) of the current path.
    pub fn ext(&self) -> String {
        self.inner
            .read()
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default()
    }

    /// MIME type from the current extension, honoring configured overrides.
    pub fn mime_type(&self) -> String {
        self.mime.lookup(&self.ext())
    }

    pub fn state(&self) -> ModuleState {
        self.inner.read().state
    }

    /// Compare-and-set state transition; returns false when another task got
    /// there first.
    pub fn transition(&self, from: ModuleState, to: ModuleState) -> bool {
        let mut inner = self.inner.write();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        let siblings = inner.siblings.clone();
        drop(inner);
        for sibling in siblings {
            sibling.inner.write().state = to;
        }
        true
    }

    /// Transition this module and, yoked to it, all of its siblings.
    pub fn set_state(&self, state: ModuleState) {
        let siblings = {
            let mut inner = self.inner.write();
            inner.state = state;
            inner.siblings.clone()
        };
        for sibling in siblings {
            sibling.inner.write().state = state;
        }
    }

    pub fn hash(&self) -> String {
        self.inner.read().hash.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    pub fn no_write(&self) -> bool {
        self.inner.read().no_write
    }

    pub fn set_no_write(&self, no_write: bool) {
        self.inner.write().no_write = no_write;
    }

    pub fn no_data(&self) -> bool {
        self.inner.read().no_data
    }

    pub fn set_no_data(&self, no_data: bool) {
        self.inner.write().no_data = no_data;
    }

    pub fn source_map_enabled(&self) -> bool {
        self.inner.read().source_map
    }

    pub fn set_source_map_enabled(&self, enabled: bool) {
        self.inner.write().source_map = enabled;
    }

    pub fn has_data(&self) -> bool {
        self.inner.read().data.is_some()
    }

    pub fn set_data(&self, data: ModuleData) {
        let mut inner = self.inner.write();
        inner.data = Some(data);
        inner.md5 = None;
        inner.sha1 = None;
        inner.size = None;
    }

    /// Replace the content, composing the new map over the previous one when
    /// source maps are being tracked.
    pub fn set_content(&self, text: String, map: Option<SourceMapData>) {
        let mut inner = self.inner.write();
        if inner.source_map {
            match (inner.source_map_data.take(), map) {
                (Some(mut old), Some(mut new)) => {
                    let composed = match (old.normalize(), new.normalize()) {
                        (Ok(old_map), Ok(new_map)) => {
                            Some(SourceMapData::Map(compose(old_map, new_map)))
                        }
                        _ => Some(new),
                    };
                    inner.source_map_data = composed;
                }
                (None, Some(new)) => inner.source_map_data = Some(new),
                (old, None) => inner.source_map_data = old,
            }
        }
        inner.data = Some(ModuleData::Text(text));
        inner.modified = true;
        inner.md5 = None;
        inner.sha1 = None;
        inner.size = None;
        inner.revision += 1;
    }

    /// Current content as text, forcing and caching a lazy generator.
    pub fn text_content(&self) -> Option<String> {
        {
            let inner = self.inner.read();
            match &inner.data {
                Some(ModuleData::Text(t)) => return Some(t.clone()),
                Some(ModuleData::Binary(b)) => {
                    return Some(String::from_utf8_lossy(b).into_owned())
                }
                Some(ModuleData::Lazy(_)) => {}
                None => {
                    if inner.no_data {
                        return Some(String::new());
                    }
                    return None;
                }
            }
        }
        let generator = {
            let inner = self.inner.read();
            match &inner.data {
                Some(ModuleData::Lazy(g)) => Some(g.clone()),
                _ => None,
            }
        };
        let generator = generator?;
        let generated = generator();
        self.set_content(generated.text.clone(), generated.source_map);
        Some(generated.text)
    }

    /// Current content as bytes.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        {
            let inner = self.inner.read();
            match &inner.data {
                Some(ModuleData::Binary(b)) => return Some(b.clone()),
                Some(ModuleData::Text(t)) => return Some(t.clone().into_bytes()),
                Some(ModuleData::Lazy(_)) => {}
                None => {
                    if inner.no_data {
                        return Some(Vec::new());
                    }
                    return None;
                }
            }
        }
        self.text_content().map(String::into_bytes)
    }

    pub fn take_source_map_data(&self) -> Option<SourceMapData> {
        self.inner.write().source_map_data.take()
    }

    pub fn set_source_map_data(&self, data: Option<SourceMapData>) {
        self.inner.write().source_map_data = data;
    }

    pub fn has_source_map_data(&self) -> bool {
        self.inner.read().source_map_data.is_some()
    }

    pub fn size(&self) -> u64 {
        if let Some(size) = self.inner.read().size {
            return size;
        }
        let size = self.bytes().map(|b| b.len() as u64).unwrap_or(0);
        self.inner.write().size = Some(size);
        size
    }

    pub fn md5(&self) -> String {
        if let Some(md5) = self.inner.read().md5.clone() {
            return md5;
        }
        let md5 = digest::md5_hex(&self.bytes().unwrap_or_default());
        self.inner.write().md5 = Some(md5.clone());
        md5
    }

    pub fn sha1(&self) -> String {
        if let Some(sha1) = self.inner.read().sha1.clone() {
            return sha1;
        }
        let sha1 = digest::sha1_hex(&self.bytes().unwrap_or_default());
        self.inner.write().sha1 = Some(sha1.clone());
        sha1
    }

    // ---- dependencies and replacements ----

    /// Record a dependency edge, returning its index for replacements.
    pub fn add_dependency(&self, dependency: Dependency) -> usize {
        let mut inner = self.inner.write();
        inner.dependencies.push(dependency);
        inner.dependencies.len() - 1
    }

    pub fn add_replacement(&self, start: usize, end: usize, dep: usize) {
        self.inner
            .write()
            .replacements
            .push(Replacement { start, end, dep });
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.inner.read().dependencies.clone()
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.read().dependencies.len()
    }

    pub fn with_dependency_mut<R>(&self, index: usize, f: impl FnOnce(&mut Dependency) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.dependencies.get_mut(index).map(f)
    }

    pub fn replacements(&self) -> Vec<Replacement> {
        self.inner.read().replacements.clone()
    }

    // ---- siblings / sub-files ----

    pub fn add_sibling(&self, sibling: Arc<Module>) {
        self.inner.write().siblings.push(sibling);
    }

    pub fn siblings(&self) -> Vec<Arc<Module>> {
        self.inner.read().siblings.clone()
    }

    /// Mark `self` as a sub-file split out of `parent` at byte `index`,
    /// snapshotting the parent for later log remapping.
    pub fn mark_subfile(&self, parent: &Arc<Module>, index: usize) {
        let snapshot = SubfileOrigin {
            parent: Arc::downgrade(parent),
            parent_path: parent.path(),
            data: parent.text_content().unwrap_or_default(),
            index,
            source_map: None,
            revision: parent.revision(),
        };
        self.inner.write().subfile = Some(snapshot);
    }

    pub fn is_subfile(&self) -> bool {
        self.inner.read().subfile.is_some()
    }

    pub fn subfile_parent(&self) -> Option<Arc<Module>> {
        self.inner
            .read()
            .subfile
            .as_ref()
            .and_then(|s| s.parent.upgrade())
    }

    pub fn subfile_index(&self) -> Option<usize> {
        self.inner.read().subfile.as_ref().map(|s| s.index)
    }

    // ---- props ----

    pub fn set_prop(&self, key: &str, value: serde_json::Value) {
        self.inner.write().props.insert(key.to_string(), value);
    }

    pub fn prop(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().props.get(key).cloned()
    }

    // ---- logs ----

    /// Attach a log entry, expanding byte offsets into line/column and
    /// remapping sub-file locations back into the parent.
    pub fn add_log(&self, mut entry: LogEntry) {
        let (content, subfile_remap, modified) = {
            let inner = self.inner.read();
            let content = match &inner.data {
                Some(ModuleData::Text(t)) => Some(t.clone()),
                _ => None,
            };
            let remap = inner
                .subfile
                .as_ref()
                .map(|s| (s.parent_path.clone(), s.data.clone(), s.index));
            (content, remap, inner.modified)
        };

        // Expand an index-only location to line/column against our own text.
        if entry.line.is_none() {
            if let (Some(index), Some(text)) = (entry.index, content.as_ref()) {
                let pos = position_at(text, index);
                entry.line = Some(pos.line);
                entry.column = Some(pos.column);
                if let Some(end_index) = entry.end_index {
                    let end = position_at(text, end_index);
                    entry.end_line = Some(end.line);
                    entry.end_column = Some(end.column);
                }
            }
        }

        if entry.file_name.is_none() {
            entry.file_name = Some(self.original_path.clone());
        }

        // Sub-file offsets are rebased to the parent snapshot.
        if let Some((parent_path, parent_data, base_index)) = subfile_remap {
            let parent_offset = entry.index.map(|i| i + base_index);
            let pos = parent_offset.map(|offset| position_at(&parent_data, offset));
            entry.original_location = Some(OriginalLocation {
                file: parent_path.clone(),
                line: pos.map(|p| p.line),
                column: pos.map(|p| p.column),
            });
            if entry.code_frame.is_none() {
                if let Some(p) = pos {
                    entry.code_frame = Some(code_frame(&parent_data, p.line, p.column));
                }
            }
            entry.file_name = Some(parent_path);
        } else if modified && entry.line.is_some() && entry.original_location.is_none() {
            // The reported position is in transformed text; keep the final
            // resolved location so reporters can still point somewhere real.
            entry.original_location = Some(OriginalLocation {
                file: self.original_path.clone(),
                line: entry.line,
                column: entry.column,
            });
        }

        if entry.code_frame.is_none() {
            if let (Some(text), Some(line), Some(column)) =
                (content.as_ref(), entry.line, entry.column)
            {
                entry.code_frame = Some(code_frame(text, line, column));
            }
        }

        self.inner.write().logs.push(entry);
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.read().logs.clone()
    }

    pub fn has_logs(&self) -> bool {
        !self.inner.read().logs.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.inner
            .read()
            .logs
            .iter()
            .filter(|l| l.level == LogLevel::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.inner
            .read()
            .logs
            .iter()
            .filter(|l| l.level == LogLevel::Warning)
            .count()
    }

    /// Logs past `from`, for incremental reporting after each phase.
    pub fn logs_since(&self, from: usize) -> Vec<LogEntry> {
        self.inner.read().logs.iter().skip(from).cloned().collect()
    }

    // ---- emit support ----

    /// Bundler bound during load; reused at emit so a path rewritten by
    /// processors keeps the bundler that actually parsed it.
    pub fn set_bundler(&self, bundler: Option<Arc<dyn crate::core::bundler::Bundler>>) {
        self.inner.write().bundler = bundler;
    }

    pub fn bundler(&self) -> Option<Arc<dyn crate::core::bundler::Bundler>> {
        self.inner.read().bundler.clone()
    }

    pub fn set_generated(&self, generated: Option<Arc<Module>>) {
        self.inner.write().generated = generated;
    }

    pub fn generated(&self) -> Option<Arc<Module>> {
        self.inner.read().generated.clone()
    }

    /// Shallow copy for the emit phase: content, path and flags carry over;
    /// dependencies, logs and siblings start empty so the loaded module stays
    /// pristine for incremental rebuilds.
    pub fn clone_for_emit(&self) -> Module {
        let mut source = self.inner.write();
        let source_map_data = source
            .source_map_data
            .as_mut()
            .and_then(|d| d.duplicate().ok());
        let inner = ModuleInner {
            path: source.path.clone(),
            state: ModuleState::Emitting,
            data: source.data.clone(),
            no_data: source.no_data,
            source_map: source.source_map,
            source_map_data,
            props: source.props.clone(),
            hash: source.hash.clone(),
            no_write: source.no_write,
            subfile: source.subfile.as_ref().map(|s| SubfileOrigin {
                parent: s.parent.clone(),
                parent_path: s.parent_path.clone(),
                data: s.data.clone(),
                index: s.index,
                source_map: None,
                revision: s.revision,
            }),
            ..Default::default()
        };
        Module {
            original_path: self.original_path.clone(),
            is_external: self.is_external,
            id: self.id,
            mime: self.mime.clone(),
            inner: RwLock::new(inner),
        }
    }

    /// Clear everything derived from content and return to `state`.
    pub fn reset(&self, state: ModuleState, new_hash: String) {
        let mut inner = self.inner.write();
        inner.logs.clear();
        inner.dependencies.clear();
        inner.replacements.clear();
        inner.siblings.clear();
        inner.props.clear();
        inner.data = None;
        inner.no_data = false;
        inner.source_map_data = None;
        inner.bundler = None;
        inner.generated = None;
        inner.path = self.original_path.clone();
        inner.state = state;
        inner.hash = new_hash;
        inner.modified = false;
        inner.md5 = None;
        inner.sha1 = None;
        inner.size = None;
        inner.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(path: &str) -> Arc<Module> {
        Arc::new(Module::new(
            PathBuf::from(path),
            1,
            "h1".to_string(),
            false,
            Arc::new(MimeRegistry::default()),
        ))
    }

    #[test]
    fn test_dependency_url_split() {
        let dep = Dependency::new("lib/a.css?inline&x=1#frag", DependencyKind::Url);
        assert_eq!(dep.pathname, "lib/a.css");
        assert_eq!(dep.search, "inline&x=1");
        assert_eq!(dep.fragment, "frag");
        assert_eq!(
            dep.query,
            vec![
                ("inline".to_string(), String::new()),
                ("x".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn test_state_yokes_siblings() {
        let owner = make("/src/a.css");
        let map = make("/src/a.css.map");
        owner.add_sibling(map.clone());
        owner.set_state(ModuleState::Emitted);
        assert_eq!(map.state(), ModuleState::Emitted);
    }

    #[test]
    fn test_reset_clears_everything() {
        let m = make("/src/a.js");
        m.set_content("text".into(), None);
        m.set_path(PathBuf::from("/out/a.min.js"));
        m.add_dependency(Dependency::new("./b", DependencyKind::Import));
        m.add_log(LogEntry::error("test", "boom"));
        m.set_prop("k", serde_json::json!(1));
        m.set_state(ModuleState::Loaded);

        m.reset(ModuleState::Initial, "h2".to_string());

        assert_eq!(m.state(), ModuleState::Initial);
        assert_eq!(m.path(), PathBuf::from("/src/a.js"));
        assert!(!m.has_data());
        assert!(m.dependencies().is_empty());
        assert!(!m.has_logs());
        assert!(m.prop("k").is_none());
        assert_eq!(m.hash(), "h2");
    }

    #[test]
    fn test_lazy_data_forced_and_cached() {
        let m = make("/src/a.js");
        m.set_data(ModuleData::Lazy(Arc::new(|| GeneratedContent {
            text: "generated".to_string(),
            source_map: None,
        })));
        assert_eq!(m.text_content().unwrap(), "generated");
        // Cached as text now
        let inner_is_text = matches!(
            m.inner.read().data,
            Some(ModuleData::Text(_))
        );
        assert!(inner_is_text);
    }

    #[test]
    fn test_no_data_reads_as_empty() {
        let m = make("/src/a.js");
        m.set_no_data(true);
        assert_eq!(m.text_content().unwrap(), "");
        assert_eq!(m.size(), 0);
    }

    #[test]
    fn test_log_index_expansion() {
        let m = make("/src/a.js");
        m.set_content("let a = 1;\nlet b = oops;\n".into(), None);
        m.add_log(LogEntry::error("test", "oops is undefined").at_index(19, 23));
        let log = &m.logs()[0];
        assert_eq!(log.line, Some(1));
        assert_eq!(log.column, Some(8));
        assert!(log.code_frame.as_ref().unwrap().contains("let b = oops;"));
    }

    #[test]
    fn test_subfile_log_rebase() {
        let parent = make("/src/page.html");
        parent.set_content("<html>\n<style>\nbody { color: bad; }\n</style>\n</html>".into(), None);
        let child = make("/src/page.html#0.css");
        child.set_content("\nbody { color: bad; }\n".into(), None);
        child.mark_subfile(&parent, 14);

        child.add_log(LogEntry::error("css", "bad color").at_index(15, 18));
        let log = &child.logs()[0];
        let original = log.original_location.as_ref().unwrap();
        assert_eq!(original.file, PathBuf::from("/src/page.html"));
        // Offset 15 in the sub-file is offset 29 in the parent: line 2.
        assert_eq!(original.line, Some(2));
        assert_eq!(log.file_name, Some(PathBuf::from("/src/page.html")));
    }

    #[test]
    fn test_clone_for_emit_is_detached() {
        let m = make("/src/a.css");
        m.set_content("body{}".into(), None);
        m.add_dependency(Dependency::new("./b.css", DependencyKind::Import));
        m.add_log(LogEntry::warning("t", "w"));

        let generated = m.clone_for_emit();
        assert_eq!(generated.text_content().unwrap(), "body{}");
        assert!(generated.dependencies().is_empty());
        assert!(!generated.has_logs());
        assert_eq!(generated.state(), ModuleState::Emitting);

        generated.set_content("body{color:red}".into(), None);
        assert_eq!(m.text_content().unwrap(), "body{}");
    }

    #[test]
    fn test_content_digests() {
        let m = make("/src/a.txt");
        m.set_content("abc".into(), None);
        assert_eq!(m.md5(), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(m.sha1(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(m.size(), 3);
    }
}
