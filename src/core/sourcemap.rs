//! Source-map plumbing: the in-memory map union, chain composition across
//! transforms, and the emit-time composer that attaches maps to output.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sourcemap::{SourceMap, SourceMapBuilder};

use crate::utils::{Result, TabaError};

/// A module's map in whichever form the last producer left it. Readers
/// normalize to a parsed [`SourceMap`].
pub enum SourceMapData {
    /// Raw JSON text, as read from disk or a compiler.
    Json(String),
    /// Parsed map.
    Map(SourceMap),
    /// A builder still being filled by a generator.
    Builder(SourceMapBuilder),
}

impl std::fmt::Debug for SourceMapData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMapData::Json(_) => write!(f, "SourceMapData::Json(..)"),
            SourceMapData::Map(_) => write!(f, "SourceMapData::Map(..)"),
            SourceMapData::Builder(_) => write!(f, "SourceMapData::Builder(..)"),
        }
    }
}

impl SourceMapData {
    /// Normalize in place to the parsed form and return a reference to it.
    pub fn normalize(&mut self) -> Result<&SourceMap> {
        match self {
            SourceMapData::Map(_) => {}
            SourceMapData::Json(json) => {
                let map = SourceMap::from_slice(json.as_bytes())
                    .map_err(|e| TabaError::parse(format!("Invalid source map: {}", e)))?;
                *self = SourceMapData::Map(map);
            }
            SourceMapData::Builder(_) => {
                let taken = std::mem::replace(self, SourceMapData::Json(String::new()));
                if let SourceMapData::Builder(builder) = taken {
                    *self = SourceMapData::Map(builder.into_sourcemap());
                }
            }
        }
        match self {
            SourceMapData::Map(map) => Ok(map),
            _ => unreachable!("normalized above"),
        }
    }

    /// Serialize the (normalized) map back to JSON.
    pub fn to_json(&mut self) -> Result<String> {
        let map = self.normalize()?;
        serialize(map)
    }

    /// Cheap structural copy through the JSON form.
    pub fn duplicate(&mut self) -> Result<SourceMapData> {
        Ok(SourceMapData::Json(self.to_json()?))
    }
}

pub fn serialize(map: &SourceMap) -> Result<String> {
    let mut buffer = Vec::new();
    map.to_writer(&mut buffer)
        .map_err(|e| TabaError::build(format!("Source map serialization error: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| TabaError::build(format!("Source map is not UTF-8: {}", e)))
}

/// Compose two maps from consecutive transforms: `newer` maps final output
/// positions to intermediate positions, `older` maps intermediate positions
/// to the original source. The result maps final output to the original.
pub fn compose(older: &SourceMap, newer: &SourceMap) -> SourceMap {
    let mut builder = SourceMapBuilder::new(newer.get_file());

    for token in newer.tokens() {
        let original = older.lookup_token(token.get_src_line(), token.get_src_col());
        match original {
            Some(orig) if orig.has_source() => {
                let source = orig.get_source().unwrap_or_default();
                let src_id = builder.add_source(source);
                if let Some(idx) = older.sources().position(|s| s == source) {
                    if let Some(contents) = older.get_source_contents(idx as u32) {
                        builder.set_source_contents(src_id, Some(contents));
                    }
                }
                let name = token.get_name().or_else(|| orig.get_name());
                let name_id = name.map(|n| builder.add_name(n));
                builder.add_raw(
                    token.get_dst_line(),
                    token.get_dst_col(),
                    orig.get_src_line(),
                    orig.get_src_col(),
                    Some(src_id),
                    name_id,
                    false,
                );
            }
            _ => {
                // No original position; keep the edge so dst columns stay anchored.
                builder.add_raw(
                    token.get_dst_line(),
                    token.get_dst_col(),
                    0,
                    0,
                    None,
                    None,
                    false,
                );
            }
        }
    }

    builder.into_sourcemap()
}

/// How `sources[i]` entries are rewritten when the map is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePathStyle {
    /// `file:///` absolute URLs.
    FileUrl,
    /// Relative to the project root directory.
    RelativeToRoot,
    /// Relative to the directory the map is written into.
    RelativeToMap,
}

/// User hook rewriting one `sources[i]` entry; wins over `source_style`.
pub type SourceRewriteHook = std::sync::Arc<dyn Fn(&str) -> String + Send + Sync>;
/// User hook supplying `sourcesContent[i]`; wins over reading from disk.
pub type SourceContentHook = std::sync::Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Emit-time composer configuration, resolved from the `sourceMap` option.
#[derive(Clone)]
pub struct ComposerOptions {
    pub inline: bool,
    /// Output-path template for the sibling map; `None` means `<path>.map`.
    pub out_path: Option<String>,
    pub source_style: SourcePathStyle,
    pub include_content: bool,
    pub rewrite_source: Option<SourceRewriteHook>,
    pub source_content: Option<SourceContentHook>,
}

impl std::fmt::Debug for ComposerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposerOptions")
            .field("inline", &self.inline)
            .field("out_path", &self.out_path)
            .field("source_style", &self.source_style)
            .field("include_content", &self.include_content)
            .finish()
    }
}

impl Default for ComposerOptions {
    fn default() -> Self {
        Self {
            inline: false,
            out_path: None,
            source_style: SourcePathStyle::RelativeToMap,
            include_content: false,
            rewrite_source: None,
            source_content: None,
        }
    }
}

/// Result of composing a map for one output module.
pub struct ComposedMap {
    /// The source-map URL comment to append to the content.
    pub url_comment: String,
    /// Sibling map file to write, absent in inline mode.
    pub sibling: Option<(PathBuf, String)>,
}

/// Rewrite sources, optionally fill contents, and produce either an inline
/// data URI comment or a sibling `.map` payload.
pub fn compose_for_output(
    data: &mut SourceMapData,
    module_out_path: &Path,
    root_dir: &Path,
    mime_type: &str,
    options: &ComposerOptions,
) -> Result<ComposedMap> {
    let map_path = if options.inline {
        module_out_path.to_path_buf()
    } else {
        match &options.out_path {
            Some(template) => PathBuf::from(template.replace("<path>", &module_out_path.to_string_lossy())),
            None => {
                let mut p = module_out_path.as_os_str().to_owned();
                p.push(".map");
                PathBuf::from(p)
            }
        }
    };
    let map_dir = map_path.parent().unwrap_or(Path::new("."));

    let map = data.normalize()?;
    let mut builder = SourceMapBuilder::new(None);
    for token in map.tokens() {
        let src_id = token.get_source().map(|source| {
            let rewritten = match &options.rewrite_source {
                Some(hook) => hook(source),
                None => rewrite_source(source, map_dir, root_dir, options.source_style),
            };
            let id = builder.add_source(&rewritten);
            if let Some(idx) = map.sources().position(|s| s == source) {
                let existing = map.get_source_contents(idx as u32);
                if let Some(contents) = existing {
                    builder.set_source_contents(id, Some(contents));
                } else if let Some(hook) = &options.source_content {
                    if let Some(contents) = hook(source) {
                        builder.set_source_contents(id, Some(&contents));
                    }
                } else if options.include_content {
                    if let Ok(contents) = std::fs::read_to_string(source) {
                        builder.set_source_contents(id, Some(&contents));
                    }
                }
            }
            id
        });
        let name_id = token.get_name().map(|n| builder.add_name(n));
        builder.add_raw(
            token.get_dst_line(),
            token.get_dst_col(),
            token.get_src_line(),
            token.get_src_col(),
            src_id,
            name_id,
            false,
        );
    }
    let rewritten = builder.into_sourcemap();
    let json = serialize(&rewritten)?;

    let url = if options.inline {
        format!(
            "data:application/json;charset=utf-8;base64,{}",
            BASE64.encode(json.as_bytes())
        )
    } else {
        relative_url(module_out_path.parent().unwrap_or(Path::new(".")), &map_path)
    };

    let url_comment = if mime_type == "text/css" {
        format!("\n/*# sourceMappingURL={} */", url)
    } else {
        format!("\n//# sourceMappingURL={}", url)
    };

    let sibling = if options.inline {
        None
    } else {
        Some((map_path, json))
    };

    Ok(ComposedMap {
        url_comment,
        sibling,
    })
}

fn rewrite_source(source: &str, map_dir: &Path, root_dir: &Path, style: SourcePathStyle) -> String {
    let path = Path::new(source);
    match style {
        SourcePathStyle::FileUrl => {
            let abs = if path.is_absolute() {
                path.to_path_buf()
            } else {
                root_dir.join(path)
            };
            format!("file:///{}", slashed(&abs).trim_start_matches('/'))
        }
        SourcePathStyle::RelativeToRoot => relative_url(root_dir, path),
        SourcePathStyle::RelativeToMap => relative_url(map_dir, path),
    }
}

/// Forward-slash relative path from `base` dir to `target`; falls back to the
/// target itself when no common prefix exists.
pub fn relative_url(base: &Path, target: &Path) -> String {
    let base: Vec<_> = base.components().collect();
    let target_components: Vec<_> = target.components().collect();
    if target.is_relative() {
        return slashed(target);
    }

    let mut common = 0;
    while common < base.len()
        && common < target_components.len()
        && base[common] == target_components[common]
    {
        common += 1;
    }
    if common == 0 {
        return slashed(target);
    }

    let mut parts: Vec<String> = Vec::new();
    for _ in common..base.len() {
        parts.push("..".to_string());
    }
    for component in &target_components[common..] {
        parts.push(component.as_os_str().to_string_lossy().into_owned());
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn slashed(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_map(source: &str) -> SourceMap {
        let mut builder = SourceMapBuilder::new(None);
        let src = builder.add_source(source);
        builder.add_raw(0, 0, 0, 0, Some(src), None, false);
        builder.add_raw(1, 4, 2, 8, Some(src), None, false);
        builder.into_sourcemap()
    }

    #[test]
    fn test_normalize_json() {
        let map = simple_map("a.ts");
        let json = serialize(&map).unwrap();
        let mut data = SourceMapData::Json(json);
        let normalized = data.normalize().unwrap();
        assert_eq!(normalized.get_source_count(), 1);
    }

    #[test]
    fn test_compose_chains_to_original_source() {
        // a.ts -> (compiler) intermediate -> (minifier) final
        let older = simple_map("a.ts");
        // Minifier: output 0:0 came from intermediate 1:4.
        let mut builder = SourceMapBuilder::new(None);
        let src = builder.add_source("a.ts.tmp");
        builder.add_raw(0, 0, 1, 4, Some(src), None, false);
        let newer = builder.into_sourcemap();

        let composed = compose(&older, &newer);
        let token = composed.lookup_token(0, 0).unwrap();
        assert_eq!(token.get_source(), Some("a.ts"));
        assert_eq!(token.get_src_line(), 2);
        assert_eq!(token.get_src_col(), 8);
    }

    #[test]
    fn test_relative_url() {
        assert_eq!(
            relative_url(Path::new("/out/css"), Path::new("/out/img/a.png")),
            "../img/a.png"
        );
        assert_eq!(
            relative_url(Path::new("/out"), Path::new("/out/a.js")),
            "a.js"
        );
    }

    #[test]
    fn test_compose_for_output_inline() {
        let map = simple_map("/src/a.ts");
        let mut data = SourceMapData::Map(map);
        let composed = compose_for_output(
            &mut data,
            Path::new("/out/a.js"),
            Path::new("/src"),
            "text/javascript",
            &ComposerOptions {
                inline: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(composed.url_comment.starts_with("\n//# sourceMappingURL=data:application/json"));
        assert!(composed.sibling.is_none());
    }

    #[test]
    fn test_compose_for_output_sibling_css_comment() {
        let map = simple_map("/src/a.less");
        let mut data = SourceMapData::Map(map);
        let composed = compose_for_output(
            &mut data,
            Path::new("/out/a.css"),
            Path::new("/src"),
            "text/css",
            &ComposerOptions::default(),
        )
        .unwrap();
        assert_eq!(composed.url_comment, "\n/*# sourceMappingURL=a.css.map */");
        let (path, json) = composed.sibling.unwrap();
        assert_eq!(path, Path::new("/out/a.css.map"));
        assert!(json.contains("\"mappings\""));
    }
}
