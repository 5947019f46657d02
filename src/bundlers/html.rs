//! HTML bundler: discovers `src`/`href` references and server-side
//! includes, and splits inline `<style>`/`<script>` blocks into sub-file
//! modules so they run through the regular pipeline.

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

static SRC_HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:src|href)\s*=\s*["']([^"']+)["']"#).unwrap());
static INCLUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<!--#include\s+file\s*=\s*["']([^"']+)["']\s*-->"#).unwrap());
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>(.*?)</style>").unwrap());
static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script([^>]*)>(.*?)</script>").unwrap());

pub struct HtmlBundler;

impl HtmlBundler {
    fn add_subfile_dependency(
        module: &Arc<Module>,
        builder: &Arc<Builder>,
        start: usize,
        end: usize,
        content: &str,
        ext: &str,
    ) {
        let subfile = builder.create_subfile(module, start, content.to_string(), ext);
        let mut dep = Dependency::new(
            &subfile.original_path().display().to_string(),
            DependencyKind::Include,
        )
        .at(start, end);
        dep.inline = true;
        dep.resolved_path = Some(subfile.original_path().to_path_buf());
        dep.resolved_file = Some(subfile);
        let index = module.add_dependency(dep);
        module.add_replacement(start, end, index);
    }
}

#[async_trait]
impl Bundler for HtmlBundler {
    fn read_mode(&self) -> ReadMode {
        ReadMode::Text
    }

    async fn parse(&self, module: &Arc<Module>, builder: &Arc<Builder>) -> Result<()> {
        let Some(content) = module.text_content() else {
            return Ok(());
        };

        for caps in INCLUDE_RE.captures_iter(&content) {
            let whole = caps.get(0).unwrap();
            let url = caps.get(1).unwrap();
            let mut dep = Dependency::new(url.as_str(), DependencyKind::Include)
                .at(whole.start(), whole.end());
            dep.inline = true;
            let index = module.add_dependency(dep);
            module.add_replacement(whole.start(), whole.end(), index);
        }

        for caps in STYLE_RE.captures_iter(&content) {
            let inner = caps.get(1).unwrap();
            if inner.as_str().trim().is_empty() {
                continue;
            }
            Self::add_subfile_dependency(
                module,
                builder,
                inner.start(),
                inner.end(),
                inner.as_str(),
                "css",
            );
        }

        for caps in SCRIPT_RE.captures_iter(&content) {
            let attrs = caps.get(1).unwrap().as_str();
            let inner = caps.get(2).unwrap();
            // `<script src=...>` is covered by the attribute scan below.
            if attrs.to_ascii_lowercase().contains("src") {
                continue;
            }
            if inner.as_str().trim().is_empty() {
                continue;
            }
            Self::add_subfile_dependency(
                module,
                builder,
                inner.start(),
                inner.end(),
                inner.as_str(),
                "js",
            );
        }

        for caps in SRC_HREF_RE.captures_iter(&content) {
            let url = caps.get(1).unwrap();
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
        if dep.pathname.is_empty() {
            return Resolution::Ignore;
        }
        let dir = match module.original_path().parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let candidate = dir.join(&dep.pathname);
        if candidate.is_file() {
            Resolution::Resolved(candidate)
        } else {
            Resolution::NotFound
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
            match dep.kind {
                DependencyKind::Include => {
                    // Spliced content: sub-file blocks and SSI includes.
                    let Some(child) = &dep.resolved_file else {
                        continue;
                    };
                    let child_out = child.generated().unwrap_or_else(|| child.clone());
                    if let Some(text) = child_out.text_content() {
                        edits.push(Splice {
                            start: replacement.start,
                            end: replacement.end,
                            text,
                        });
                    }
                }
                _ => {
                    if let Some(url) = builder.dependency_url(generated, dep) {
                        edits.push(Splice {
                            start: replacement.start,
                            end: replacement.end,
                            text: url,
                        });
                    }
                }
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
    fn test_src_href_scan() {
        let html = r#"<img src="img/logo.png"><link rel="stylesheet" href='main.css'>"#;
        let urls: Vec<_> = SRC_HREF_RE
            .captures_iter(html)
            .map(|c| c.get(1).unwrap().as_str().to_string())
            .collect();
        assert_eq!(urls, vec!["img/logo.png", "main.css"]);
    }

    #[test]
    fn test_include_scan() {
        let html = r#"<body><!--#include file="header.html" --></body>"#;
        let caps = INCLUDE_RE.captures(html).unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "header.html");
    }

    #[test]
    fn test_style_block_inner_span() {
        let html = "<style>\nbody{}\n</style>";
        let caps = STYLE_RE.captures(html).unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "\nbody{}\n");
        assert_eq!(caps.get(1).unwrap().start(), 7);
    }

    #[test]
    fn test_script_with_src_is_not_a_subfile() {
        let html = r#"<script src="app.js"></script><script>let x = 1;</script>"#;
        let blocks: Vec<_> = SCRIPT_RE
            .captures_iter(html)
            .filter(|c| !c.get(1).unwrap().as_str().to_ascii_lowercase().contains("src"))
            .map(|c| c.get(2).unwrap().as_str().to_string())
            .collect();
        assert_eq!(blocks, vec!["let x = 1;"]);
    }
}
