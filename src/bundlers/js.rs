//! JavaScript bundler: discovers static and dynamic `import`, `export from`
//! and `require` references. Real JS parsing belongs to compiler
//! collaborators; this scanner only needs the reference graph.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::builder::Builder;
use crate::core::bundler::{is_external_url, Bundler, ReadMode, Resolution};
use crate::core::module::{Dependency, DependencyKind, Module};
use crate::utils::text::{splice, Splice};
use crate::utils::Result;

static STATIC_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*import\s+(?:[\w$*{},\s]+?\s+from\s+)?["']([^"']+)["']"#).unwrap()
});
static EXPORT_FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*export\s+(?:\*|\{[^}]*\})\s+from\s+["']([^"']+)["']"#).unwrap()
});
static DYNAMIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"import\(\s*["']([^"']+)["']\s*\)"#).unwrap());
static REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\(\s*["']([^"']+)["']\s*\)"#).unwrap());

/// Resolution probe order for extensionless specifiers.
const PROBE_EXTENSIONS: &[&str] = &["js", "mjs", "json"];

pub struct JsBundler;

impl JsBundler {
    fn probe(dir: &Path, specifier: &str) -> Option<PathBuf> {
        let exact = dir.join(specifier);
        if exact.is_file() {
            return Some(exact);
        }
        for ext in PROBE_EXTENSIONS {
            let with_ext = dir.join(format!("{}.{}", specifier, ext));
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        let index = dir.join(specifier).join("index.js");
        if index.is_file() {
            return Some(index);
        }
        None
    }
}

#[async_trait]
impl Bundler for JsBundler {
    fn read_mode(&self) -> ReadMode {
        ReadMode::Text
    }

    async fn parse(&self, module: &Arc<Module>, _builder: &Arc<Builder>) -> Result<()> {
        let Some(content) = module.text_content() else {
            return Ok(());
        };

        let mut seen_spans: Vec<(usize, usize)> = Vec::new();
        let mut record = |url: regex::Match<'_>, dynamic: bool| {
            if seen_spans
                .iter()
                .any(|(start, _)| *start == url.start())
            {
                return;
            }
            seen_spans.push((url.start(), url.end()));
            let mut dep = Dependency::new(url.as_str(), DependencyKind::Import)
                .at(url.start(), url.end());
            if dynamic {
                dep = dep.dynamic();
            }
            let index = module.add_dependency(dep);
            module.add_replacement(url.start(), url.end(), index);
        };

        for caps in STATIC_IMPORT_RE.captures_iter(&content) {
            record(caps.get(1).unwrap(), false);
        }
        for caps in EXPORT_FROM_RE.captures_iter(&content) {
            record(caps.get(1).unwrap(), false);
        }
        for caps in DYNAMIC_IMPORT_RE.captures_iter(&content) {
            record(caps.get(1).unwrap(), true);
        }
        for caps in REQUIRE_RE.captures_iter(&content) {
            record(caps.get(1).unwrap(), false);
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
        // Bare specifiers belong to package resolvers, not the file graph.
        if !dep.pathname.starts_with("./") && !dep.pathname.starts_with("../") {
            return Resolution::Ignore;
        }
        let dir = match module.original_path().parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        match Self::probe(&dir, &dep.pathname) {
            Some(path) => Resolution::Resolved(path),
            None => Resolution::NotFound,
        }
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
            if let Some(mut url) = builder.dependency_url(generated, dep) {
                // Module specifiers need an explicit relative prefix.
                if !url.starts_with('.') && !url.starts_with('/') && !url.starts_with("data:") {
                    url = format!("./{}", url);
                }
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
    fn test_static_import_forms() {
        let js = "import './a';\nimport x from \"./b.js\";\nimport { y, z } from './c';\nimport * as ns from './d';\n";
        let urls: Vec<_> = STATIC_IMPORT_RE
            .captures_iter(js)
            .map(|c| c.get(1).unwrap().as_str().to_string())
            .collect();
        assert_eq!(urls, vec!["./a", "./b.js", "./c", "./d"]);
    }

    #[test]
    fn test_export_from() {
        let js = "export * from './x';\nexport { a } from './y';\n";
        let urls: Vec<_> = EXPORT_FROM_RE
            .captures_iter(js)
            .map(|c| c.get(1).unwrap().as_str().to_string())
            .collect();
        assert_eq!(urls, vec!["./x", "./y"]);
    }

    #[test]
    fn test_dynamic_import_and_require() {
        let js = "const a = await import('./lazy');\nconst b = require('./legacy');\n";
        assert_eq!(
            DYNAMIC_IMPORT_RE
                .captures(js)
                .unwrap()
                .get(1)
                .unwrap()
                .as_str(),
            "./lazy"
        );
        assert_eq!(
            REQUIRE_RE.captures(js).unwrap().get(1).unwrap().as_str(),
            "./legacy"
        );
    }

    #[test]
    fn test_bare_specifiers_are_not_imports_of_files() {
        let js = "import React from 'react';\n";
        let caps = STATIC_IMPORT_RE.captures(js).unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "react");
        // resolve() turns these into Resolution::Ignore; verified in
        // integration tests.
    }
}
