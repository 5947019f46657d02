//! The bundler contract: per-extension implementations that discover
//! references during load and rewrite them during emit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::builder::Builder;
use crate::core::module::{Dependency, Module};
use crate::utils::Result;

/// Reserved query parameter: skip resolution for this reference entirely.
pub const NO_CHECK_QUERY: &str = "noCheckQuery";
/// Reserved query parameter: force inlining of the resolved target.
pub const INLINE_QUERY: &str = "inlineQuery";

/// How module data should be populated from disk before parse/process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    #[default]
    Text,
    Binary,
    None,
}

/// Outcome of resolving one dependency URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Absolute path of the target module.
    Resolved(PathBuf),
    /// Not ours to resolve (protocol, host-qualified, configured external);
    /// leave the reference untouched, silently.
    Ignore,
    /// Looked like a local file but nothing matched; the driver logs it.
    NotFound,
}

#[async_trait]
pub trait Bundler: Send + Sync {
    /// Preferred read mode for modules handled by this bundler.
    fn read_mode(&self) -> ReadMode {
        ReadMode::Text
    }

    /// Scan content, record dependencies and replacement ranges.
    async fn parse(&self, _module: &Arc<Module>, _builder: &Arc<Builder>) -> Result<()> {
        Ok(())
    }

    /// Resolve one recorded dependency to an absolute path.
    fn resolve(
        &self,
        _dep: &Dependency,
        _module: &Arc<Module>,
        _builder: &Arc<Builder>,
    ) -> Resolution {
        Resolution::Ignore
    }

    /// Invoked once after every reachable module is loaded; may create
    /// synthetic modules.
    async fn bundle(&self, _entries: &[Arc<Module>], _builder: &Arc<Builder>) -> Result<()> {
        Ok(())
    }

    /// Produce the final content for the emit-phase clone, evaluating the
    /// replacements recorded during parse.
    async fn generate(
        &self,
        _module: &Arc<Module>,
        _generated: &Arc<Module>,
        _builder: &Arc<Builder>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Extension-keyed bundler lookup.
#[derive(Default)]
pub struct BundlerRegistry {
    bundlers: HashMap<String, Arc<dyn Bundler>>,
}

impl BundlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ext: &str, bundler: Arc<dyn Bundler>) {
        self.bundlers
            .insert(ext.trim_start_matches('.').to_lowercase(), bundler);
    }

    pub fn unregister(&mut self, ext: &str) {
        self.bundlers.remove(&ext.trim_start_matches('.').to_lowercase());
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn Bundler>> {
        self.bundlers.get(&ext.to_lowercase()).cloned()
    }

    pub fn all(&self) -> Vec<(String, Arc<dyn Bundler>)> {
        let mut entries: Vec<_> = self
            .bundlers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// True for references no bundler should try to resolve as local files:
/// protocols, host-qualified URLs, and root-absolute paths.
pub fn is_external_url(url: &str) -> bool {
    if url.starts_with("//") || url.starts_with('/') {
        return true;
    }
    if url.starts_with("data:") {
        return true;
    }
    // A scheme like `http:`, `mailto:`, `file:` before any slash.
    if let Some(colon) = url.find(':') {
        let scheme = &url[..colon];
        if !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
            && !url[..colon].contains('/')
        {
            return true;
        }
    }
    false
}

/// Strip reserved query parameters from the dependency, recording their
/// effects. Must run before `Bundler::resolve`.
pub fn apply_reserved_queries(dep: &mut Dependency) {
    let mut changed = false;
    dep.query.retain(|(key, _)| match key.as_str() {
        NO_CHECK_QUERY => {
            dep.no_check = true;
            changed = true;
            false
        }
        INLINE_QUERY => {
            dep.inline = true;
            changed = true;
            false
        }
        _ => true,
    });
    if changed {
        dep.search = dep
            .query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::DependencyKind;

    #[test]
    fn test_is_external_url() {
        assert!(is_external_url("http://example.com/a.js"));
        assert!(is_external_url("//cdn.example.com/a.js"));
        assert!(is_external_url("/root-absolute.css"));
        assert!(is_external_url("data:image/png;base64,AAAA"));
        assert!(is_external_url("mailto:x@example.com"));
        assert!(!is_external_url("./relative.css"));
        assert!(!is_external_url("img/logo.png"));
    }

    #[test]
    fn test_reserved_queries_stripped_and_recorded() {
        let mut dep = Dependency::new("a.png?inlineQuery&keep=1", DependencyKind::Url);
        apply_reserved_queries(&mut dep);
        assert!(dep.inline);
        assert!(!dep.no_check);
        assert_eq!(dep.search, "keep=1");

        let mut dep = Dependency::new("b.css?noCheckQuery", DependencyKind::Url);
        apply_reserved_queries(&mut dep);
        assert!(dep.no_check);
        assert_eq!(dep.search, "");
        assert_eq!(dep.url_suffix(), "");
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        struct Nop;
        #[async_trait]
        impl Bundler for Nop {}

        let mut registry = BundlerRegistry::new();
        registry.register(".CSS", Arc::new(Nop));
        assert!(registry.get("css").is_some());
        assert!(registry.get("CSS").is_some());
        assert!(registry.get("js").is_none());
    }
}
