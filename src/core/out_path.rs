//! `outPath` templates for processor rules, external-module rules and
//! source-map placement.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(path|dir|name|ext|hash|md5|sha1|random|date|buildhash|version)(?::([^>]+))?>")
        .unwrap()
});

/// Everything a template expansion may ask for. Digest accessors are
/// closures so content hashing only happens when a template uses them.
pub struct TemplateContext<'a> {
    /// Module path relative to the root directory, `/`-separated.
    pub path: &'a str,
    pub hash: &'a str,
    pub build_hash: &'a str,
    pub version: &'a str,
    pub md5: &'a dyn Fn() -> String,
    pub sha1: &'a dyn Fn() -> String,
}

/// Expand `template` against the context. Unknown variables are left as-is
/// by the scanner regex (they simply never match).
pub fn expand(template: &str, cx: &TemplateContext<'_>) -> String {
    VARIABLE
        .replace_all(template, |caps: &Captures<'_>| {
            let arg = caps.get(2).map(|m| m.as_str());
            match &caps[1] {
                "path" => cx.path.to_string(),
                "dir" => dir_of(cx.path),
                "name" => name_of(cx.path),
                "ext" => ext_of(cx.path),
                "hash" => truncate(cx.hash, arg),
                "md5" => truncate(&(cx.md5)(), arg),
                "sha1" => truncate(&(cx.sha1)(), arg),
                "random" => truncate(&uuid::Uuid::new_v4().simple().to_string(), arg),
                "date" => chrono::Local::now()
                    .format(arg.unwrap_or("%Y%m%d"))
                    .to_string(),
                "buildhash" => truncate(cx.build_hash, arg),
                "version" => cx.version.to_string(),
                _ => String::new(),
            }
        })
        .into_owned()
}

fn truncate(value: &str, len: Option<&str>) -> String {
    match len.and_then(|l| l.parse::<usize>().ok()) {
        Some(n) if n < value.len() => value[..n].to_string(),
        _ => value.to_string(),
    }
}

/// Directory part of a `/`-separated relative path, empty at the top level.
fn dir_of(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// File stem without the final extension.
fn name_of(path: &str) -> String {
    let file = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };
    match file.rfind('.') {
        Some(idx) if idx > 0 => file[..idx].to_string(),
        _ => file.to_string(),
    }
}

/// Final extension including the dot, empty when absent.
fn ext_of(path: &str) -> String {
    let file = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };
    match file.rfind('.') {
        Some(idx) if idx > 0 => file[idx..].to_string(),
        _ => String::new(),
    }
}

/// `/`-separated path of `path` relative to `base`; the path itself when it
/// is not under `base`.
pub fn root_relative(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let s = relative.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Resolve an expanded template against the output directory.
pub fn resolve_in(out_dir: &Path, expanded: &str) -> PathBuf {
    let p = Path::new(expanded);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        out_dir.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cx<'a>(path: &'a str, md5: &'a dyn Fn() -> String, sha1: &'a dyn Fn() -> String) -> TemplateContext<'a> {
        TemplateContext {
            path,
            hash: "deadbeefcafe",
            build_hash: "0123456789abcdef",
            version: "0.1.0",
            md5,
            sha1,
        }
    }

    #[test]
    fn test_path_parts() {
        let md5 = || "ffffffff".to_string();
        let sha1 = || "eeeeeeee".to_string();
        let cx = cx("assets/img/logo.png", &md5, &sha1);
        assert_eq!(expand("<path>", &cx), "assets/img/logo.png");
        assert_eq!(expand("<dir>/<name><ext>", &cx), "assets/img/logo.png");
        assert_eq!(expand("<name>", &cx), "logo");
        assert_eq!(expand("<ext>", &cx), ".png");
    }

    #[test]
    fn test_hash_truncation() {
        let md5 = || "0011223344".to_string();
        let sha1 = || "5566778899".to_string();
        let cx = cx("a.js", &md5, &sha1);
        assert_eq!(expand("<hash:4>", &cx), "dead");
        assert_eq!(expand("<md5:6>", &cx), "001122");
        assert_eq!(expand("<sha1>", &cx), "5566778899");
        assert_eq!(expand("<buildhash:8>", &cx), "01234567");
    }

    #[test]
    fn test_mixed_template() {
        let md5 = || "aabbcc".to_string();
        let sha1 = || "x".to_string();
        let cx = cx("css/site.css", &md5, &sha1);
        assert_eq!(
            expand("<dir>/<name>.<md5:4><ext>", &cx),
            "css/site.aabb.css"
        );
    }

    #[test]
    fn test_random_respects_length() {
        let md5 = || String::new();
        let sha1 = || String::new();
        let cx = cx("a.js", &md5, &sha1);
        let one = expand("<random:8>", &cx);
        let two = expand("<random:8>", &cx);
        assert_eq!(one.len(), 8);
        assert_ne!(one, two);
    }

    #[test]
    fn test_top_level_dir_is_empty() {
        let md5 = || String::new();
        let sha1 = || String::new();
        let cx = cx("index.html", &md5, &sha1);
        assert_eq!(expand("<dir>", &cx), "");
        assert_eq!(expand("<name>", &cx), "index");
    }

    #[test]
    fn test_root_relative() {
        assert_eq!(
            root_relative(Path::new("/src/a/b.js"), Path::new("/src")),
            "a/b.js"
        );
        assert_eq!(
            root_relative(Path::new("/elsewhere/c.js"), Path::new("/src")),
            "/elsewhere/c.js"
        );
    }
}
