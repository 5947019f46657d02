//! taba - an incremental front-end asset build pipeline.
//!
//! The build driver walks an arbitrary module graph (cycles included),
//! runs processor chains over each module, lets extension-keyed bundlers
//! discover and rewrite references, and mirrors the result into an output
//! tree. A watcher cascades invalidation through the reverse-dependency
//! index for incremental rebuilds, and a small dev server serves the output.

pub mod bundlers;
pub mod cli;
pub mod core;
pub mod server;
pub mod utils;
pub mod watch;

pub use crate::core::builder::{BuildContext, BuildMode, Builder, EmittedFile, Reporter};
pub use crate::core::bundler::{Bundler, ReadMode, Resolution};
pub use crate::core::module::{
    Dependency, DependencyKind, LogEntry, LogLevel, Module, ModuleData, ModuleState,
};
pub use crate::core::options::{BuildOptions, SourceMapOption};
pub use crate::core::plugin::Plugin;
pub use crate::core::processor::{ModuleDelta, Processor};
pub use crate::utils::{Result, TabaError};
