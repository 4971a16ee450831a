//! Credential plugin discovery, lifecycle, and negotiation.
//!
//! Plugins are external executables found on configured paths, spawned on
//! demand, and driven over a duplex stdio channel. The submodules follow
//! the plugin's life: [`file`] classifies candidate paths, [`discovery`]
//! enumerates them, [`connection`] speaks the wire protocol, [`factory`]
//! owns the spawned processes, and [`manager`] orchestrates the whole set.

use std::path::PathBuf;
use thiserror::Error;

pub mod connection;
pub mod discovery;
pub mod factory;
pub mod file;
pub mod manager;

pub use connection::{ConnectionOptions, PluginConnection, StdioConnection};
pub use discovery::{PathPluginDiscoverer, PluginDiscovery, PluginDiscoveryResult};
pub use factory::{Plugin, PluginFactory, PluginLauncher, StdioPluginLauncher};
pub use file::{PluginFile, PluginFileState};
pub use manager::{PluginFactoryBuilder, PluginManager};

/// Plugin lifecycle error types
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin executable could not be started
    #[error("failed to start plugin {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The spawned process exposed no usable standard streams
    #[error("plugin {path} has no usable standard streams")]
    Stdio { path: PathBuf },

    /// Version negotiation with the plugin failed
    #[error("plugin {path} handshake failed: {reason}")]
    Handshake { path: PathBuf, reason: String },

    /// The factory was disposed and can no longer create plugins
    #[error("plugin factory has been disposed")]
    FactoryDisposed,

    /// Transport failure on an established connection
    #[error("connection error: {0}")]
    Connection(#[from] connection::ConnectionError),
}
