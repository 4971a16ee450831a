//! Plugin process factory.
//!
//! Spawns and caches one running plugin per path. Concurrent callers for
//! the same path share a single in-flight creation, so at most one process
//! ever exists per distinct path. Cached plugins with no in-flight requests
//! are evicted after the configured idle timeout and re-created on the next
//! request.

use crate::plugin::connection::{ConnectionOptions, PluginConnection, StdioConnection};
use crate::plugin::PluginError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Arguments passed to every spawned plugin executable
pub const PLUGIN_LAUNCH_ARGS: &[&str] = &["-plugin"];

/// A running plugin: identity plus its live connection.
///
/// The factory exclusively owns the process; everything else holds
/// non-owning `Arc` references to this handle.
pub struct Plugin {
    id: String,
    path: PathBuf,
    connection: Arc<dyn PluginConnection>,
    process: Option<Mutex<Child>>,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("connection", &self.connection)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl Plugin {
    /// Create a plugin handle over an existing connection, without a child
    /// process. Used by launchers that do not spawn (tests, in-process
    /// doubles).
    pub fn new(path: impl Into<PathBuf>, connection: Arc<dyn PluginConnection>) -> Self {
        let path = path.into();
        Self {
            id: plugin_id(&path),
            path,
            connection,
            process: None,
            started_at: Utc::now(),
        }
    }

    /// Create a plugin handle that owns a spawned child process
    pub fn with_process(
        path: impl Into<PathBuf>,
        connection: Arc<dyn PluginConnection>,
        child: Child,
    ) -> Self {
        let path = path.into();
        Self {
            id: plugin_id(&path),
            path,
            connection,
            process: Some(Mutex::new(child)),
            started_at: Utc::now(),
        }
    }

    /// Stable identifier embedding the executable name
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path this plugin was spawned from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When this plugin instance was started
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The live connection to the plugin process
    pub fn connection(&self) -> Arc<dyn PluginConnection> {
        Arc::clone(&self.connection)
    }

    /// Close the connection and reap the child process
    pub(crate) async fn shutdown(&self) {
        self.connection.close().await;

        if let Some(process) = &self.process {
            let mut child = process.lock().await;
            if let Err(error) = child.start_kill() {
                debug!(plugin = %self.id, %error, "plugin process already exited");
            }
            if let Err(error) = child.wait().await {
                warn!(plugin = %self.id, %error, "failed to reap plugin process");
            }
        }
    }
}

fn plugin_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("plugin");
    format!("{stem}-{}", Uuid::new_v4().simple())
}

/// Spawns one plugin process and establishes its handshaked connection
#[async_trait]
pub trait PluginLauncher: Send + Sync + fmt::Debug {
    /// Launch the executable at `path` and complete the handshake
    async fn launch(
        &self,
        path: &Path,
        args: &[String],
        options: &ConnectionOptions,
    ) -> Result<Plugin, PluginError>;
}

/// [`PluginLauncher`] that spawns real processes over their stdio
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioPluginLauncher;

#[async_trait]
impl PluginLauncher for StdioPluginLauncher {
    async fn launch(
        &self,
        path: &Path,
        args: &[String],
        options: &ConnectionOptions,
    ) -> Result<Plugin, PluginError> {
        info!(path = %path.display(), "starting credential plugin");

        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PluginError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| PluginError::Stdio {
            path: path.to_path_buf(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PluginError::Stdio {
            path: path.to_path_buf(),
        })?;

        let connection = StdioConnection::new(stdout, stdin, options.clone());

        match connection.handshake().await {
            Ok(version) => {
                debug!(path = %path.display(), %version, "plugin handshake complete");
                Ok(Plugin::with_process(path, connection, child))
            }
            Err(error) => {
                connection.close().await;
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(PluginError::Handshake {
                    path: path.to_path_buf(),
                    reason: error.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct PathSlot {
    plugin: Option<Arc<Plugin>>,
}

type SlotMap = HashMap<PathBuf, Arc<Mutex<PathSlot>>>;

/// Spawning cache with single-flight creation and idle eviction
pub struct PluginFactory {
    launcher: Arc<dyn PluginLauncher>,
    idle_timeout: Duration,
    slots: Arc<Mutex<SlotMap>>,
    disposed: Arc<AtomicBool>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("idle_timeout", &self.idle_timeout)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl PluginFactory {
    /// Create a factory that evicts plugins idle for `idle_timeout`
    pub fn new(launcher: Arc<dyn PluginLauncher>, idle_timeout: Duration) -> Arc<Self> {
        let slots: Arc<Mutex<SlotMap>> = Arc::new(Mutex::new(HashMap::new()));
        let disposed = Arc::new(AtomicBool::new(false));

        let factory = Arc::new(Self {
            launcher,
            idle_timeout,
            slots: Arc::clone(&slots),
            disposed: Arc::clone(&disposed),
            sweeper: StdMutex::new(None),
        });

        let handle = tokio::spawn(sweep_loop(slots, disposed, idle_timeout));
        *factory.sweeper.lock().expect("sweeper lock poisoned") = Some(handle);

        factory
    }

    /// Get the cached plugin for `path`, or spawn it.
    ///
    /// Concurrent calls for the same path share one in-flight creation. A
    /// cached plugin whose connection has died is replaced transparently.
    pub async fn get_or_create(
        &self,
        path: &Path,
        args: &[String],
        options: &ConnectionOptions,
    ) -> Result<Arc<Plugin>, PluginError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PluginError::FactoryDisposed);
        }

        let key = normalize_path(path);
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        // Per-path lock: one creation at a time, shared by concurrent callers.
        let mut slot = slot.lock().await;

        if let Some(plugin) = &slot.plugin {
            if plugin.connection().is_alive() {
                return Ok(Arc::clone(plugin));
            }
            debug!(path = %key.display(), "cached plugin connection is dead, respawning");
            plugin.shutdown().await;
            slot.plugin = None;
        }

        let plugin = Arc::new(self.launcher.launch(&key, args, options).await?);
        slot.plugin = Some(Arc::clone(&plugin));
        Ok(plugin)
    }

    /// Dispose and drop the cached plugin for `path`, if any
    pub async fn evict(&self, path: &Path) {
        let key = normalize_path(path);
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(&key).cloned()
        };

        if let Some(slot) = slot {
            let mut slot = slot.lock().await;
            if let Some(plugin) = slot.plugin.take() {
                info!(path = %key.display(), "evicting plugin");
                plugin.shutdown().await;
            }
        }
    }

    /// Dispose every cached plugin and stop the idle sweeper
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let slots: Vec<_> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };

        futures::future::join_all(slots.into_iter().map(|slot| async move {
            let mut slot = slot.lock().await;
            if let Some(plugin) = slot.plugin.take() {
                plugin.shutdown().await;
            }
        }))
        .await;

        debug!("plugin factory disposed");
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Periodically dispose cached plugins that have sat idle, with no
/// in-flight requests, beyond the idle timeout
async fn sweep_loop(slots: Arc<Mutex<SlotMap>>, disposed: Arc<AtomicBool>, idle_timeout: Duration) {
    let period = idle_timeout.min(Duration::from_secs(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if disposed.load(Ordering::SeqCst) {
            break;
        }

        let snapshot: Vec<_> = {
            let slots = slots.lock().await;
            slots
                .iter()
                .map(|(path, slot)| (path.clone(), Arc::clone(slot)))
                .collect()
        };

        for (path, slot) in snapshot {
            // Skip slots mid-creation rather than wait on them.
            let Ok(mut slot) = slot.try_lock() else {
                continue;
            };

            let evict = slot.plugin.as_ref().is_some_and(|plugin| {
                let connection = plugin.connection();
                !connection.is_alive()
                    || (connection.in_flight() == 0 && connection.idle_for() >= idle_timeout)
            });

            if evict {
                if let Some(plugin) = slot.plugin.take() {
                    info!(path = %path.display(), "evicting idle plugin");
                    plugin.shutdown().await;
                }
            }
        }
    }
}
