use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::core::builder::{BuildContext, Builder, Reporter};
use crate::core::options::{BuildOptions, SourceMapOption};
use crate::server::DevServer;
use crate::utils::mime::MimeRegistry;
use crate::utils::{Logger, Result};
use crate::watch::TabaWatcher;

#[derive(Parser)]
#[command(name = "taba")]
#[command(about = "taba - incremental asset build pipeline", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the source tree into the output directory
    Build {
        /// Project root (where taba.config.json lives)
        #[arg(short, long, default_value = ".")]
        root: String,
        /// Output directory (overrides config)
        #[arg(short, long)]
        out: Option<String>,
        /// Empty the output directory first
        #[arg(long)]
        clean: bool,
        /// Run the optimizer chain
        #[arg(long)]
        optimize: bool,
        /// Emit source maps
        #[arg(long)]
        source_maps: bool,
        /// Stop at the first error
        #[arg(long)]
        bail: bool,
        /// Compute outputs without touching the disk
        #[arg(long)]
        no_write: bool,
        /// Compute paths and maps only, skipping content I/O
        #[arg(long)]
        path_only: bool,
        /// Worker-pool size for parallel processors
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Build, then watch for changes and rebuild incrementally
    Watch {
        #[arg(short, long, default_value = ".")]
        root: String,
        #[arg(short, long)]
        out: Option<String>,
        /// Debounce delay in milliseconds
        #[arg(long)]
        debounce: Option<u64>,
        #[arg(long)]
        source_maps: bool,
    },
    /// Build, watch, and serve the output directory over HTTP
    Serve {
        #[arg(short, long, default_value = ".")]
        root: String,
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Print version and feature information
    Info,
}

pub struct CliHandler;

impl Default for CliHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CliHandler {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self) -> Result<()> {
        Logger::init();
        let cli = Cli::parse();

        match cli.command {
            Commands::Build {
                root,
                out,
                clean,
                optimize,
                source_maps,
                bail,
                no_write,
                path_only,
                parallel,
            } => {
                let mut options = load_options(&root)?;
                if let Some(out) = out {
                    options.out_dir = PathBuf::from(&root).join(out);
                }
                options.clean |= clean;
                options.optimize |= optimize;
                options.bail |= bail;
                options.no_write |= no_write;
                if source_maps && !options.source_map.enabled() {
                    options.source_map = SourceMapOption::Enabled;
                }
                if let Some(parallel) = parallel {
                    options.parallel = parallel.max(1);
                }

                let builder = make_builder(options)?;
                let context = if path_only {
                    builder.build_path_only().await?
                } else {
                    builder.build().await?
                };
                if context.error_count > 0 {
                    std::process::exit(1);
                }
                Ok(())
            }
            Commands::Watch {
                root,
                out,
                debounce,
                source_maps,
            } => {
                let mut options = load_options(&root)?;
                if let Some(out) = out {
                    options.out_dir = PathBuf::from(&root).join(out);
                }
                if source_maps && !options.source_map.enabled() {
                    options.source_map = SourceMapOption::Enabled;
                }
                let mut watch_options = options.watch.clone().unwrap_or_default();
                if let Some(debounce) = debounce {
                    watch_options.debounce_ms = debounce;
                }
                options.watch = Some(watch_options.clone());

                let builder = make_builder(options)?;
                run_initial_build(&builder).await;
                TabaWatcher::new(builder, watch_options).watch().await
            }
            Commands::Serve { root, port, host } => {
                let mut options = load_options(&root)?;
                let mut server_options = options.dev_server.clone().unwrap_or_default();
                if let Some(port) = port {
                    server_options.port = port;
                }
                if let Some(host) = host {
                    server_options.host = host;
                }
                options.dev_server = Some(server_options.clone());
                let watch_options = options.watch.clone().unwrap_or_default();

                let builder = make_builder(options)?;
                run_initial_build(&builder).await;

                let mime = Arc::new(MimeRegistry::new(
                    builder.options().mime_types.clone(),
                ));
                let server = Arc::new(DevServer::new(
                    builder.out_dir().to_path_buf(),
                    server_options,
                    mime,
                ));
                tokio::spawn(async move {
                    if let Err(err) = server.run().await {
                        Logger::error(&format!("dev server stopped: {}", err));
                    }
                });

                TabaWatcher::new(builder, watch_options).watch().await
            }
            Commands::Info => {
                Logger::info(&format!("taba {}", crate::core::options::version()));
                Logger::info("incremental asset build pipeline");
                Logger::info("");
                Logger::info("bundlers: css, html, js");
                Logger::info("processors: copy, text-replace (plus plugins)");
                Logger::info("config: taba.config.json in the project root");
                Ok(())
            }
        }
    }
}

fn load_options(root: &str) -> Result<BuildOptions> {
    let root_path = PathBuf::from(root)
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(root));
    let options = BuildOptions::load(&root_path)?;
    if root_path.join(crate::core::options::CONFIG_FILE_NAME).exists() {
        Logger::info(&format!(
            "loaded configuration from {}",
            crate::core::options::CONFIG_FILE_NAME
        ));
    }
    Ok(options)
}

fn make_builder(options: BuildOptions) -> Result<Arc<Builder>> {
    let install_command = options.install_command.clone();
    let builder = Builder::new(options)?;
    builder.set_reporter(Arc::new(ConsoleReporter));
    if let Some(template) = install_command {
        builder.set_install_hook(Arc::new(move |package: &str| {
            run_install_command(&template, package)
        }));
    }
    Ok(builder)
}

async fn run_initial_build(builder: &Arc<Builder>) {
    match builder.build().await {
        Ok(context) => {
            if context.error_count > 0 {
                Logger::warn("initial build finished with errors");
            }
        }
        Err(err) => Logger::error(&format!("initial build failed: {}", err)),
    }
}

/// Run the configured `installCommand` with `<package>` substituted.
/// Installation stays a CLI concern; the core only sees the hook.
fn run_install_command(template: &str, package: &str) -> bool {
    let command_line = template.replace("<package>", package);
    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else {
        return false;
    };
    Logger::info(&format!("installing missing processor: {}", command_line));
    match std::process::Command::new(program).args(parts).status() {
        Ok(status) => status.success(),
        Err(err) => {
            Logger::error(&format!("install failed: {}", err));
            false
        }
    }
}

/// Human build summary at buildEnd.
struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, context: &BuildContext) {
        if context.aborted {
            Logger::warn(&format!(
                "build aborted after {:.0?}",
                context.elapsed
            ));
            return;
        }
        let status = if context.error_count > 0 {
            "finished with errors"
        } else {
            "finished"
        };
        Logger::info(&format!(
            "{} build {} in {:.0?}: {} file(s), {} error(s), {} warning(s)",
            context.build_mode.as_str(),
            status,
            context.elapsed,
            context.files.len(),
            context.error_count,
            context.warning_count
        ));
    }
}
