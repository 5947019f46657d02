//! External-module policy: where a module pulled in from outside the entry
//! set lands in the output tree, or whether it is inlined as a data URI.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::core::module::Module;
use crate::core::out_path::{expand, TemplateContext};
use crate::utils::mime::mime_matches;
use crate::utils::MatcherSet;

/// One ordered extraction rule.
pub struct ExternalRule {
    /// Matched against the module's final path.
    pub matcher: MatcherSet,
    /// MIME-type glob such as `image/*`; `None` matches any type.
    pub mime: Option<String>,
    /// Modules smaller than this fall through to the next rule.
    pub min_size: u64,
    /// Output-path template for extracted modules.
    pub out_path: String,
}

impl ExternalRule {
    pub fn matches(&self, module: &Arc<Module>) -> bool {
        if !self.matcher.matches(&module.path()) {
            return false;
        }
        if let Some(mime) = &self.mime {
            if !mime_matches(&module.mime_type(), mime) {
                return false;
            }
        }
        module.size() >= self.min_size
    }
}

/// Decide the output location for an external module. Returns the
/// root-relative output path from the first matching rule, with `-2`, `-3`,
/// ... suffixes applied until `taken` reports the key free. `None` means no
/// rule matched and the module should be inlined at its call sites.
pub fn extraction_path(
    rules: &[ExternalRule],
    module: &Arc<Module>,
    hash: &str,
    build_hash: &str,
    version: &str,
    taken: impl Fn(&str) -> bool,
) -> Option<String> {
    let rule = rules.iter().find(|rule| rule.matches(module))?;

    let file_name = module
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let md5 = || module.md5();
    let sha1 = || module.sha1();
    let cx = TemplateContext {
        path: &file_name,
        hash,
        build_hash,
        version,
        md5: &md5,
        sha1: &sha1,
    };
    let candidate = expand(&rule.out_path, &cx);
    Some(deconflict(&candidate, taken))
}

/// Append `-2`, `-3`, ... before the extension until the key is free.
pub fn deconflict(candidate: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(candidate) {
        return candidate.to_string();
    }
    let (stem, ext) = match candidate.rfind('.') {
        Some(idx) if idx > candidate.rfind('/').map(|i| i + 1).unwrap_or(0) => {
            (&candidate[..idx], &candidate[idx..])
        }
        _ => (candidate, ""),
    };
    let mut n = 2;
    loop {
        let next = format!("{}-{}{}", stem, n, ext);
        if !taken(&next) {
            return next;
        }
        n += 1;
    }
}

/// `data:<mime>;base64,<payload>` for inlined modules.
pub fn encode_data_uri(mime: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mime::MimeRegistry;
    use crate::utils::Matcher;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn module_with(path: &str, content: &[u8]) -> Arc<Module> {
        let module = Arc::new(Module::new(
            PathBuf::from(path),
            1,
            "hash".into(),
            true,
            Arc::new(MimeRegistry::default()),
        ));
        module.set_data(crate::core::module::ModuleData::Binary(content.to_vec()));
        module
    }

    fn rule(mime: Option<&str>, min_size: u64) -> ExternalRule {
        ExternalRule {
            matcher: MatcherSet::new().include(Matcher::glob("*").unwrap()),
            mime: mime.map(String::from),
            min_size,
            out_path: "assets/<name><ext>".to_string(),
        }
    }

    #[test]
    fn test_small_module_falls_through() {
        let module = module_with("/lib/icon.png", &[0u8; 8]);
        let rules = vec![rule(Some("image/*"), 10_000)];
        let path = extraction_path(&rules, &module, "h", "b", "v", |_| false);
        assert!(path.is_none());
    }

    #[test]
    fn test_large_module_extracted() {
        let module = module_with("/lib/photo.png", &[0u8; 20_000]);
        let rules = vec![rule(Some("image/*"), 10_000)];
        let path = extraction_path(&rules, &module, "h", "b", "v", |_| false);
        assert_eq!(path.unwrap(), "assets/photo.png");
    }

    #[test]
    fn test_mime_glob_filters() {
        let module = module_with("/lib/app.wasm", &[0u8; 20_000]);
        let rules = vec![rule(Some("image/*"), 0)];
        assert!(extraction_path(&rules, &module, "h", "b", "v", |_| false).is_none());
    }

    #[test]
    fn test_deconflict_suffixes() {
        let mut taken = HashSet::new();
        taken.insert("assets/a.png".to_string());
        taken.insert("assets/a-2.png".to_string());
        let free = deconflict("assets/a.png", |k| taken.contains(k));
        assert_eq!(free, "assets/a-3.png");
    }

    #[test]
    fn test_deconflict_without_extension() {
        let result = deconflict("assets/LICENSE", |k| k == "assets/LICENSE");
        assert_eq!(result, "assets/LICENSE-2");
    }

    #[test]
    fn test_encode_data_uri() {
        assert_eq!(
            encode_data_uri("image/png", b"abc"),
            "data:image/png;base64,YWJj"
        );
    }
}
