//! Plugin registration: a plugin gets one `apply` call against the builder
//! before the first build and wires itself up through the public surface
//! (event subscriptions, processor registry, bundler registry).

use std::sync::Arc;

use crate::core::builder::Builder;
use crate::utils::Result;

pub trait Plugin: Send + Sync {
    /// Unique name for diagnostics.
    fn name(&self) -> &str;

    /// Hook into the builder. Called once, before the first build.
    fn apply(&self, builder: &Arc<Builder>) -> Result<()>;
}

#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    applied: parking_lot::Mutex<bool>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins,
            applied: parking_lot::Mutex::new(false),
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Apply every plugin exactly once.
    pub fn apply_all(&self, builder: &Arc<Builder>) -> Result<()> {
        let mut applied = self.applied.lock();
        if *applied {
            return Ok(());
        }
        for plugin in &self.plugins {
            plugin.apply(builder)?;
        }
        *applied = true;
        Ok(())
    }
}
