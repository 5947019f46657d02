use std::collections::HashMap;

/// Extension (without dot, lowercase) to MIME type.
pub fn from_ext(ext: &str) -> &'static str {
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" | "cjs" => "text/javascript",
        "json" | "map" => "application/json",
        "txt" => "text/plain",
        "xml" => "text/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// MIME lookup honoring user overrides from the `mimeTypes` option.
#[derive(Debug, Clone, Default)]
pub struct MimeRegistry {
    overrides: HashMap<String, String>,
}

impl MimeRegistry {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn lookup(&self, ext: &str) -> String {
        let ext = ext.to_lowercase();
        if let Some(mime) = self.overrides.get(&ext) {
            return mime.clone();
        }
        from_ext(&ext).to_string()
    }
}

/// Match a MIME type against a glob like `image/*` or `text/css`.
pub fn mime_matches(mime: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == "*/*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return mime
            .split('/')
            .next()
            .map(|t| t.eq_ignore_ascii_case(prefix))
            .unwrap_or(false);
    }
    mime.eq_ignore_ascii_case(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ext() {
        assert_eq!(from_ext("css"), "text/css");
        assert_eq!(from_ext("png"), "image/png");
        assert_eq!(from_ext("nope"), "application/octet-stream");
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("data".to_string(), "application/x-data".to_string());
        let registry = MimeRegistry::new(overrides);
        assert_eq!(registry.lookup("data"), "application/x-data");
        assert_eq!(registry.lookup("CSS"), "text/css");
    }

    #[test]
    fn test_mime_glob() {
        assert!(mime_matches("image/png", "image/*"));
        assert!(mime_matches("image/png", "*"));
        assert!(mime_matches("text/css", "text/css"));
        assert!(!mime_matches("text/css", "image/*"));
    }
}
