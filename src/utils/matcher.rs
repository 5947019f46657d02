use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::utils::Result;

/// A single path predicate: glob pattern, regex, or arbitrary function.
#[derive(Clone)]
pub enum Matcher {
    Glob(glob::Pattern),
    Regex(regex::Regex),
    Func(Arc<dyn Fn(&Path) -> bool + Send + Sync>),
}

impl Matcher {
    pub fn glob(pattern: &str) -> Result<Self> {
        Ok(Matcher::Glob(glob::Pattern::new(pattern)?))
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(Matcher::Regex(regex::Regex::new(pattern)?))
    }

    pub fn func(f: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        Matcher::Func(Arc::new(f))
    }

    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Matcher::Glob(pattern) => pattern.matches(&normalize(path)),
            Matcher::Regex(regex) => regex.is_match(&normalize(path)),
            Matcher::Func(f) => f(path),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Glob(p) => write!(f, "Glob({})", p.as_str()),
            Matcher::Regex(r) => write!(f, "Regex({})", r.as_str()),
            Matcher::Func(_) => write!(f, "Func(..)"),
        }
    }
}

/// Matchers are evaluated against `/`-separated paths on every platform.
fn normalize(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// ANDed include matchers plus exclusions, the shape taken by the
/// `match`/`exclude`/`filter` options.
#[derive(Debug, Clone, Default)]
pub struct MatcherSet {
    pub include: Vec<Matcher>,
    pub exclude: Vec<Matcher>,
}

impl MatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, matcher: Matcher) -> Self {
        self.include.push(matcher);
        self
    }

    pub fn exclude(mut self, matcher: Matcher) -> Self {
        self.exclude.push(matcher);
        self
    }

    /// True when the path passes every include matcher and no exclude matcher.
    /// An empty include list accepts everything.
    pub fn matches(&self, path: &Path) -> bool {
        if self.exclude.iter().any(|m| m.matches(path)) {
            return false;
        }
        self.include.iter().all(|m| m.matches(path))
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// Paths never worth watching or scanning: VCS metadata, editor droppings,
/// OS scratch files, build output caches.
pub fn default_ignored() -> MatcherSet {
    MatcherSet::new()
        .exclude(Matcher::func(|p| {
            p.components().any(|c| {
                matches!(
                    c.as_os_str().to_str(),
                    Some(".git") | Some(".svn") | Some(".hg") | Some("node_modules")
                )
            })
        }))
        .exclude(Matcher::func(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name == ".DS_Store"
                || name == "Thumbs.db"
                || name.ends_with('~')
                || name.ends_with(".swp")
                || name.ends_with(".tmp")
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_glob_matches_across_separators() {
        let m = Matcher::glob("*.js").unwrap();
        assert!(m.matches(Path::new("src/app.js")));
        assert!(m.matches(Path::new("app.js")));
        assert!(!m.matches(Path::new("src/app.css")));
    }

    #[test]
    fn test_regex_matcher() {
        let m = Matcher::regex(r"\.s[ac]ss$").unwrap();
        assert!(m.matches(Path::new("styles/main.scss")));
        assert!(!m.matches(Path::new("styles/main.css")));
    }

    #[test]
    fn test_matcher_set_and_semantics() {
        let set = MatcherSet::new()
            .include(Matcher::glob("src/*").unwrap())
            .include(Matcher::glob("*.ts").unwrap())
            .exclude(Matcher::glob("*.d.ts").unwrap());

        assert!(set.matches(Path::new("src/index.ts")));
        assert!(!set.matches(Path::new("lib/index.ts")));
        assert!(!set.matches(Path::new("src/index.d.ts")));
    }

    #[test]
    fn test_empty_set_accepts_everything() {
        assert!(MatcherSet::new().matches(Path::new("anything/at/all")));
    }

    #[test]
    fn test_default_ignored() {
        let ignored = default_ignored();
        assert!(!ignored.matches(Path::new("project/.git/HEAD")));
        assert!(!ignored.matches(Path::new("project/node_modules/x/index.js")));
        assert!(!ignored.matches(Path::new("src/app.js.swp")));
        assert!(ignored.matches(PathBuf::from("src/app.js").as_path()));
    }
}
