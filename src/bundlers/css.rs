//! CSS bundler: discovers `@import` and `url(...)` references and rewrites
//! them to output-relative URLs (or data URIs) at emit.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::builder::Builder;
use crate::core::bundler::{is_external_url, Bundler, ReadMode, Resolution};
use crate::core::module::{Dependency, DependencyKind, Module};
use crate::utils::text::{splice, Splice};
use crate::utils::Result;

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"@import\s+(?:url\(\s*)?["']([^"']+)["']"#).unwrap());
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*(?:"([^"]+)"|'([^']+)'|([^"')\s]+))\s*\)"#).unwrap());

pub struct CssBundler;

impl CssBundler {
    /// Resolve a reference relative to the module's source directory.
    fn resolve_relative(module: &Arc<Module>, pathname: &str) -> Resolution {
        if pathname.is_empty() {
            return Resolution::Ignore;
        }
        let dir = match module.original_path().parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let candidate = dir.join(pathname);
        if candidate.is_file() {
            Resolution::Resolved(candidate)
        } else {
            Resolution::NotFound
        }
    }
}

#[async_trait]
impl Bundler for CssBundler {
    fn read_mode(&self) -> ReadMode {
        ReadMode::Text
    }

    async fn parse(&self, module: &Arc<Module>, _builder: &Arc<Builder>) -> Result<()> {
        let Some(content) = module.text_content() else {
            return Ok(());
        };

        // `@import` first; `url(...)` matches inside them are skipped.
        let mut import_spans: Vec<(usize, usize)> = Vec::new();
        for caps in IMPORT_RE.captures_iter(&content) {
            let whole = caps.get(0).unwrap();
            let url = caps.get(1).unwrap();
            import_spans.push((whole.start(), whole.end()));

            let dep = Dependency::new(url.as_str(), DependencyKind::Import)
                .at(url.start(), url.end());
            let index = module.add_dependency(dep);
            module.add_replacement(url.start(), url.end(), index);
        }

        for caps in URL_RE.captures_iter(&content) {
            let whole = caps.get(0).unwrap();
            if import_spans
                .iter()
                .any(|(start, end)| whole.start() >= *start && whole.start() < *end)
            {
                continue;
            }
            let url = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .unwrap();
            let dep =
                Dependency::new(url.as_str(), DependencyKind::Url).at(url.start(), url.end());
            let index = module.add_dependency(dep);
            module.add_replacement(url.start(), url.end(), index);
        }
        Ok(())
    }

    fn resolve(
        &self,
        dep: &Dependency,
        module: &Arc<Module>,
        _builder: &Arc<Builder>,
    ) -> Resolution {
        if is_external_url(&dep.url) {
            return Resolution::Ignore;
        }
        Self::resolve_relative(module, &dep.pathname)
    }

    async fn generate(
        &self,
        module: &Arc<Module>,
        generated: &Arc<Module>,
        builder: &Arc<Builder>,
    ) -> Result<()> {
        let Some(content) = generated.text_content() else {
            return Ok(());
        };
        let deps = module.dependencies();
        let mut edits = Vec::new();
        for replacement in module.replacements() {
            let Some(dep) = deps.get(replacement.dep) else {
                continue;
            };
            if let Some(url) = builder.dependency_url(generated, dep) {
                edits.push(Splice {
                    start: replacement.start,
                    end: replacement.end,
                    text: url,
                });
            }
        }
        if !edits.is_empty() {
            generated.set_content(splice(&content, edits), None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_regex_forms() {
        let css = r#"@import "a.css"; @import url("b.css"); @import url( 'c.css' );"#;
        let urls: Vec<_> = IMPORT_RE
            .captures_iter(css)
            .map(|c| c.get(1).unwrap().as_str().to_string())
            .collect();
        assert_eq!(urls, vec!["a.css", "b.css", "c.css"]);
    }

    #[test]
    fn test_url_regex_forms() {
        let css = r#"a { background: url(img/a.png); } b { cursor: url("b.cur"); } c { mask: url('c.svg'); }"#;
        let urls: Vec<_> = URL_RE
            .captures_iter(css)
            .map(|c| {
                c.get(1)
                    .or_else(|| c.get(2))
                    .or_else(|| c.get(3))
                    .unwrap()
                    .as_str()
                    .to_string()
            })
            .collect();
        assert_eq!(urls, vec!["img/a.png", "b.cur", "c.svg"]);
    }

    #[test]
    fn test_url_inside_import_not_double_counted() {
        let css = r#"@import url("shared.css"); body { background: url(bg.png); }"#;
        let import_count = IMPORT_RE.captures_iter(css).count();
        assert_eq!(import_count, 1);
        // Full parse is covered by the integration tests; here we only check
        // the span overlap logic's inputs line up.
        let whole = IMPORT_RE.captures(css).unwrap().get(0).unwrap();
        let url_match = URL_RE.captures(css).unwrap().get(0).unwrap();
        assert!(url_match.start() >= whole.start() && url_match.start() < whole.end());
    }
}
