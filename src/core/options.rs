//! Build configuration: the programmatic `BuildOptions` record plus the
//! serde form read from `taba.config.json` and merged with CLI flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::core::bundler::ReadMode;
use crate::core::plugin::Plugin;
use crate::core::processor::Processor;
use crate::core::sourcemap::{ComposerOptions, SourcePathStyle};
use crate::utils::{Matcher, MatcherSet, Result, TabaError};

pub const CONFIG_FILE_NAME: &str = "taba.config.json";

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Bundling target; affects how bare specifiers are treated downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleTarget {
    #[default]
    Browser,
    Node,
    Electron,
}

/// One compiler/optimizer rule from the `compilers`/`optimizers` options.
#[derive(Clone, Default)]
pub struct ProcessorRule {
    pub matches: Vec<String>,
    pub excludes: Vec<String>,
    /// Named processor resolved through the plugin registry.
    pub use_name: Option<String>,
    /// Programmatic processor instance; wins over `use_name`.
    pub processor: Option<Arc<dyn Processor>>,
    pub options: serde_json::Value,
    pub out_path: Option<String>,
    pub read: ReadMode,
    pub break_after: bool,
    pub parallel: Option<bool>,
    pub name: Option<String>,
}

/// One `bundler.externalModules` rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalRuleConfig {
    #[serde(rename = "match")]
    pub matches: Option<OneOrMany>,
    pub exclude: Option<OneOrMany>,
    pub match_type: Option<String>,
    pub min_size: u64,
    pub out_path: String,
}

impl Default for ExternalRuleConfig {
    fn default() -> Self {
        Self {
            matches: None,
            exclude: None,
            match_type: None,
            min_size: 0,
            out_path: "<name><ext>".to_string(),
        }
    }
}

/// `sourceMap` option: off, defaults, or the detailed record.
#[derive(Debug, Clone, Default)]
pub enum SourceMapOption {
    #[default]
    Disabled,
    Enabled,
    Detailed(ComposerOptions),
}

impl SourceMapOption {
    pub fn enabled(&self) -> bool {
        !matches!(self, SourceMapOption::Disabled)
    }

    pub fn composer_options(&self) -> ComposerOptions {
        match self {
            SourceMapOption::Detailed(options) => options.clone(),
            _ => ComposerOptions::default(),
        }
    }
}

/// `watch` option payload.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce_ms: u64,
    pub ignored: MatcherSet,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce_ms: 128,
            ignored: crate::utils::default_ignored(),
        }
    }
}

/// `devServer` option payload.
#[derive(Debug, Clone)]
pub struct DevServerOptions {
    pub host: String,
    pub port: u16,
}

impl Default for DevServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8086,
        }
    }
}

/// The full configuration record consumed by the builder.
#[derive(Clone)]
pub struct BuildOptions {
    pub root_dir: PathBuf,
    pub out_dir: PathBuf,
    /// Entry inclusion: scanner descends everything under `root_dir` not
    /// excluded, then keeps paths passing `matches` and `filter`.
    pub matches: MatcherSet,
    pub filter: MatcherSet,
    pub compilers: Vec<ProcessorRule>,
    pub optimizers: Vec<ProcessorRule>,
    pub optimize: bool,
    pub source_map: SourceMapOption,
    pub clean: bool,
    pub bail: bool,
    pub watch: Option<WatchOptions>,
    pub dev_server: Option<DevServerOptions>,
    /// Permit writes outside `out_dir` and over source files.
    pub no_path_check: bool,
    /// Compute everything but leave the disk untouched.
    pub no_write: bool,
    /// Worker-pool size for parallel processors; 1 disables the pool.
    pub parallel: usize,
    pub encoding: String,
    pub mime_types: HashMap<String, String>,
    pub target: BundleTarget,
    pub external_modules: Vec<ExternalRuleConfig>,
    /// Extensions with bundling disabled via `bundler.bundlers: {ext: false}`.
    pub disabled_bundlers: Vec<String>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub install_command: Option<String>,
    pub install_dev_dependency: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            out_dir: PathBuf::from("dist"),
            matches: MatcherSet::new(),
            filter: MatcherSet::new(),
            compilers: Vec::new(),
            optimizers: Vec::new(),
            optimize: false,
            source_map: SourceMapOption::Disabled,
            clean: false,
            bail: false,
            watch: None,
            dev_server: None,
            no_path_check: false,
            no_write: false,
            parallel: 1,
            encoding: "utf-8".to_string(),
            mime_types: HashMap::new(),
            target: BundleTarget::Browser,
            external_modules: Vec::new(),
            disabled_bundlers: Vec::new(),
            plugins: Vec::new(),
            install_command: None,
            install_dev_dependency: false,
        }
    }
}

impl BuildOptions {
    /// Load `taba.config.json` from `root` when present, falling back to
    /// defaults rooted there.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE_NAME);
        let mut options = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: ConfigFile = serde_json::from_str(&content)
                .map_err(|e| TabaError::config(format!("{}: {}", config_path.display(), e)))?;
            file.into_options(root)?
        } else {
            BuildOptions::default()
        };
        if options.root_dir.is_relative() {
            options.root_dir = root.join(&options.root_dir);
        }
        if options.out_dir.is_relative() {
            options.out_dir = root.join(&options.out_dir);
        }
        Ok(options)
    }
}

// ---- serde file form ----

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

fn matcher_set(include: Option<OneOrMany>, exclude: Option<OneOrMany>) -> Result<MatcherSet> {
    let mut set = MatcherSet::new();
    for pattern in include.map(OneOrMany::into_vec).unwrap_or_default() {
        set = set.include(Matcher::glob(&pattern)?);
    }
    for pattern in exclude.map(OneOrMany::into_vec).unwrap_or_default() {
        set = set.exclude(Matcher::glob(&pattern)?);
    }
    Ok(set)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProcessorRuleFile {
    #[serde(rename = "match")]
    matches: Option<OneOrMany>,
    exclude: Option<OneOrMany>,
    #[serde(rename = "use")]
    use_name: Option<String>,
    options: serde_json::Value,
    out_path: Option<String>,
    read: Option<String>,
    #[serde(rename = "break")]
    break_after: bool,
    parallel: Option<bool>,
    name: Option<String>,
}

impl Default for ProcessorRuleFile {
    fn default() -> Self {
        Self {
            matches: None,
            exclude: None,
            use_name: None,
            options: serde_json::Value::Null,
            out_path: None,
            read: None,
            break_after: false,
            parallel: None,
            name: None,
        }
    }
}

impl ProcessorRuleFile {
    fn into_rule(self) -> Result<ProcessorRule> {
        let read = match self.read.as_deref() {
            None | Some("text") => ReadMode::Text,
            Some("binary") => ReadMode::Binary,
            Some("none") => ReadMode::None,
            Some(other) => {
                return Err(TabaError::config(format!("unknown read mode '{}'", other)))
            }
        };
        Ok(ProcessorRule {
            matches: self.matches.map(OneOrMany::into_vec).unwrap_or_default(),
            excludes: self.exclude.map(OneOrMany::into_vec).unwrap_or_default(),
            use_name: self.use_name,
            processor: None,
            options: self.options,
            out_path: self.out_path,
            read,
            break_after: self.break_after,
            parallel: self.parallel,
            name: self.name,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SourceMapFile {
    Flag(bool),
    Record {
        #[serde(default)]
        inline: bool,
        #[serde(default, rename = "outPath")]
        out_path: Option<String>,
        #[serde(default)]
        sources: Option<String>,
        #[serde(default, rename = "includeContent")]
        include_content: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WatchFile {
    Flag(bool),
    Record {
        #[serde(default)]
        debounce: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DevServerFile {
    Flag(bool),
    Port(u16),
    Host(String),
    Record {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BundlerFile {
    target: Option<BundleTarget>,
    external_modules: Vec<ExternalRuleConfig>,
    /// `{ "ext": false }` disables the builtin bundler for that extension.
    bundlers: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    root_dir: Option<String>,
    out_dir: Option<String>,
    #[serde(rename = "match")]
    matches: Option<OneOrMany>,
    exclude: Option<OneOrMany>,
    filter: Option<OneOrMany>,
    compilers: Vec<ProcessorRuleFile>,
    optimizers: Vec<ProcessorRuleFile>,
    optimize: Option<bool>,
    source_map: Option<SourceMapFile>,
    clean: Option<bool>,
    bail: Option<bool>,
    watch: Option<WatchFile>,
    dev_server: Option<DevServerFile>,
    no_path_check: Option<bool>,
    no_write: Option<bool>,
    parallel: Option<usize>,
    encoding: Option<String>,
    mime_types: HashMap<String, String>,
    bundler: BundlerFile,
    install_command: Option<String>,
    install_dev_dependency: Option<bool>,
}

impl ConfigFile {
    fn into_options(self, root: &Path) -> Result<BuildOptions> {
        let defaults = BuildOptions::default();

        let source_map = match self.source_map {
            None | Some(SourceMapFile::Flag(false)) => SourceMapOption::Disabled,
            Some(SourceMapFile::Flag(true)) => SourceMapOption::Enabled,
            Some(SourceMapFile::Record {
                inline,
                out_path,
                sources,
                include_content,
            }) => {
                let source_style = match sources.as_deref() {
                    Some("file-url") => SourcePathStyle::FileUrl,
                    Some("relative-to-root") => SourcePathStyle::RelativeToRoot,
                    None | Some("relative-to-map") => SourcePathStyle::RelativeToMap,
                    Some(other) => {
                        return Err(TabaError::config(format!(
                            "unknown sourceMap.sources style '{}'",
                            other
                        )))
                    }
                };
                SourceMapOption::Detailed(ComposerOptions {
                    inline,
                    out_path,
                    source_style,
                    include_content,
                    ..ComposerOptions::default()
                })
            }
        };

        let watch = match self.watch {
            None | Some(WatchFile::Flag(false)) => None,
            Some(WatchFile::Flag(true)) => Some(WatchOptions::default()),
            Some(WatchFile::Record { debounce }) => Some(WatchOptions {
                debounce_ms: debounce.unwrap_or(128),
                ..WatchOptions::default()
            }),
        };

        let dev_server = match self.dev_server {
            None | Some(DevServerFile::Flag(false)) => None,
            Some(DevServerFile::Flag(true)) => Some(DevServerOptions::default()),
            Some(DevServerFile::Port(port)) => Some(DevServerOptions {
                port,
                ..DevServerOptions::default()
            }),
            Some(DevServerFile::Host(host)) => {
                let mut options = DevServerOptions::default();
                match host.rsplit_once(':') {
                    Some((h, p)) => {
                        if !h.is_empty() {
                            options.host = h.to_string();
                        }
                        options.port = p.parse().map_err(|_| {
                            TabaError::config(format!("invalid devServer address '{}'", host))
                        })?;
                    }
                    None => options.host = host,
                }
                Some(options)
            }
            Some(DevServerFile::Record { host, port }) => {
                let mut options = DevServerOptions::default();
                if let Some(host) = host {
                    options.host = host;
                }
                if let Some(port) = port {
                    options.port = port;
                }
                Some(options)
            }
        };

        let disabled_bundlers = self
            .bundler
            .bundlers
            .iter()
            .filter(|(_, enabled)| !**enabled)
            .map(|(ext, _)| ext.clone())
            .collect();

        Ok(BuildOptions {
            root_dir: self
                .root_dir
                .map(|p| root.join(p))
                .unwrap_or_else(|| root.to_path_buf()),
            out_dir: self
                .out_dir
                .map(|p| root.join(p))
                .unwrap_or_else(|| root.join("dist")),
            matches: matcher_set(self.matches, self.exclude)?,
            filter: matcher_set(self.filter, None)?,
            compilers: self
                .compilers
                .into_iter()
                .map(ProcessorRuleFile::into_rule)
                .collect::<Result<_>>()?,
            optimizers: self
                .optimizers
                .into_iter()
                .map(ProcessorRuleFile::into_rule)
                .collect::<Result<_>>()?,
            optimize: self.optimize.unwrap_or(defaults.optimize),
            source_map,
            clean: self.clean.unwrap_or(defaults.clean),
            bail: self.bail.unwrap_or(defaults.bail),
            watch,
            dev_server,
            no_path_check: self.no_path_check.unwrap_or(false),
            no_write: self.no_write.unwrap_or(false),
            parallel: self.parallel.unwrap_or(1).max(1),
            encoding: self.encoding.unwrap_or(defaults.encoding),
            mime_types: self.mime_types,
            target: self.bundler.target.unwrap_or_default(),
            external_modules: self.bundler.external_modules,
            disabled_bundlers,
            plugins: Vec::new(),
            install_command: self.install_command,
            install_dev_dependency: self.install_dev_dependency.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BuildOptions::default();
        assert_eq!(options.out_dir, PathBuf::from("dist"));
        assert!(!options.clean);
        assert_eq!(options.parallel, 1);
    }

    #[test]
    fn test_config_file_parsing() {
        let json = r#"{
            "rootDir": "src",
            "outDir": "build",
            "match": "*.js",
            "exclude": ["*.test.js"],
            "optimize": true,
            "sourceMap": {"inline": true, "sources": "relative-to-root"},
            "devServer": 9000,
            "compilers": [
                {"match": "*.txt", "use": "text-replace", "options": {"search": "a", "replace": "b"}, "outPath": "<name>.out<ext>"}
            ],
            "bundler": {
                "target": "node",
                "externalModules": [{"matchType": "image/*", "minSize": 1024, "outPath": "assets/<name><ext>"}],
                "bundlers": {"html": false}
            }
        }"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        let options = file.into_options(Path::new("/project")).unwrap();

        assert_eq!(options.root_dir, PathBuf::from("/project/src"));
        assert_eq!(options.out_dir, PathBuf::from("/project/build"));
        assert!(options.optimize);
        assert!(options.source_map.enabled());
        assert!(options.source_map.composer_options().inline);
        assert_eq!(options.dev_server.unwrap().port, 9000);
        assert_eq!(options.compilers.len(), 1);
        assert_eq!(options.compilers[0].use_name.as_deref(), Some("text-replace"));
        assert_eq!(options.target, BundleTarget::Node);
        assert_eq!(options.external_modules.len(), 1);
        assert_eq!(options.external_modules[0].min_size, 1024);
        assert_eq!(options.disabled_bundlers, vec!["html".to_string()]);
    }

    #[test]
    fn test_dev_server_host_string() {
        let json = r#"{"devServer": "0.0.0.0:3000"}"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        let options = file.into_options(Path::new("/p")).unwrap();
        let server = options.dev_server.unwrap();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 3000);
    }

    #[test]
    fn test_watch_flag() {
        let json = r#"{"watch": true}"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        let options = file.into_options(Path::new("/p")).unwrap();
        assert_eq!(options.watch.unwrap().debounce_ms, 128);
    }

    #[test]
    fn test_bad_read_mode_rejected() {
        let rule = ProcessorRuleFile {
            read: Some("sideways".into()),
            ..Default::default()
        };
        assert!(rule.into_rule().is_err());
    }
}
