//! Plugin discovery.
//!
//! Turns the configured, ordered plugin path list into discovery results.
//! Duplicate paths collapse to their first occurrence; an absent or empty
//! configuration yields an empty result set rather than an error.

use crate::config::{EnvironmentReader, PLUGIN_PATHS_ENV};
use crate::plugin::file::{PluginFile, PluginFileState};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Outcome of examining one configured plugin path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDiscoveryResult {
    plugin_file: PluginFile,
    message: Option<String>,
}

impl PluginDiscoveryResult {
    /// Wrap a classified plugin file, deriving a diagnostic message for
    /// every non-valid state
    pub fn new(plugin_file: PluginFile) -> Self {
        let message = rejection_message(&plugin_file);
        Self {
            plugin_file,
            message,
        }
    }

    /// The classified plugin file
    pub fn plugin_file(&self) -> &PluginFile {
        &self.plugin_file
    }

    /// Human-readable reason this entry is not usable, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Replace the diagnostic message, marking the entry unusable
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn rejection_message(plugin_file: &PluginFile) -> Option<String> {
    let path = plugin_file.path().display();

    match plugin_file.state() {
        PluginFileState::Valid => None,
        PluginFileState::InvalidEmbeddedSignature => Some(format!(
            "the plugin at {path} does not pass the platform trust policy"
        )),
        PluginFileState::InvalidFilePath => {
            Some(format!("the plugin path {path} is not a valid file path"))
        }
        PluginFileState::NotFound => Some(format!("a plugin was not found at {path}")),
    }
}

/// Source of plugin discovery results
#[async_trait]
pub trait PluginDiscovery: Send + Sync + std::fmt::Debug {
    /// Produce one result per distinct configured path, in input order
    async fn discover(&self) -> Vec<PluginDiscoveryResult>;
}

/// [`PluginDiscovery`] over the configured plugin path list
#[derive(Debug)]
pub struct PathPluginDiscoverer {
    reader: Arc<dyn EnvironmentReader>,
}

impl PathPluginDiscoverer {
    /// Create a discoverer reading the path list through `reader`
    pub fn new(reader: Arc<dyn EnvironmentReader>) -> Self {
        Self { reader }
    }

    fn configured_paths(&self) -> Vec<PathBuf> {
        let Some(raw) = self.reader.get(PLUGIN_PATHS_ENV) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        std::env::split_paths(&raw)
            .filter(|path| !path.as_os_str().is_empty())
            .filter(|path| seen.insert(path.clone()))
            .collect()
    }
}

#[async_trait]
impl PluginDiscovery for PathPluginDiscoverer {
    async fn discover(&self) -> Vec<PluginDiscoveryResult> {
        let paths = self.configured_paths();
        debug!(count = paths.len(), "discovering credential plugins");

        paths
            .into_iter()
            .map(|path| PluginDiscoveryResult::new(PluginFile::classify(path)))
            .collect()
    }
}
