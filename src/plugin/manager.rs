//! Plugin manager.
//!
//! Process-wide orchestrator composing discovery and the factory: discovers
//! configured plugins, runs the initialization sequence against each valid
//! one, links plugin lifetimes to the host process, and caches capability
//! queries. Built as an explicit context object with a `reinitialize` entry
//! point so reconfiguration and test isolation never leak processes.

use crate::config::{EnvironmentReader, PluginSettings, SystemEnvironmentReader};
use crate::error::Result;
use crate::plugin::connection::{send_typed, ConnectionOptions};
use crate::plugin::discovery::{PathPluginDiscoverer, PluginDiscovery, PluginDiscoveryResult};
use crate::plugin::factory::{
    Plugin, PluginFactory, StdioPluginLauncher, PLUGIN_LAUNCH_ARGS,
};
use crate::protocol::{
    GetOperationClaimsRequest, GetOperationClaimsResponse, InitializeRequest, InitializeResponse,
    MessageMethod, MessageResponseCode, MonitorProcessExitRequest, MonitorProcessExitResponse,
    OperationClaim, SetCredentialsRequest, SetCredentialsResponse,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a factory for a given idle timeout, letting embedders and tests
/// substitute the launcher
pub type PluginFactoryBuilder = Box<dyn Fn(Duration) -> Arc<PluginFactory> + Send + Sync>;

/// Collaborators and caches replaced atomically on reinitialization
struct ManagerState {
    reader: Arc<dyn EnvironmentReader>,
    discoverer: Arc<dyn PluginDiscovery>,
    factory_builder: PluginFactoryBuilder,
    settings: Option<PluginSettings>,
    factory: Option<Arc<PluginFactory>>,
    discovery_memo: Option<Vec<PluginDiscoveryResult>>,
    claims: HashMap<PathBuf, Vec<OperationClaim>>,
    plugins: HashMap<PathBuf, Arc<Plugin>>,
}

/// Process-wide plugin orchestrator
pub struct PluginManager {
    state: RwLock<ManagerState>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager").finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create a manager over explicit collaborators
    pub fn new(
        reader: Arc<dyn EnvironmentReader>,
        discoverer: Arc<dyn PluginDiscovery>,
        factory_builder: PluginFactoryBuilder,
    ) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                reader,
                discoverer,
                factory_builder,
                settings: None,
                factory: None,
                discovery_memo: None,
                claims: HashMap::new(),
                plugins: HashMap::new(),
            }),
        }
    }

    /// Create a manager wired to the process environment and real process
    /// spawning
    pub fn from_environment() -> Self {
        let reader: Arc<dyn EnvironmentReader> = Arc::new(SystemEnvironmentReader);
        let discoverer = Arc::new(PathPluginDiscoverer::new(Arc::clone(&reader)));
        Self::new(reader, discoverer, Self::default_factory_builder())
    }

    /// Factory builder spawning real plugin processes
    pub fn default_factory_builder() -> PluginFactoryBuilder {
        Box::new(|idle_timeout| {
            PluginFactory::new(Arc::new(StdioPluginLauncher), idle_timeout)
        })
    }

    /// Discover configured plugins and bring every valid one to a ready,
    /// capability-queried state.
    ///
    /// Memoized: the first call does the work, later calls return the same
    /// results without re-discovery or re-handshake. Entries that fail
    /// validation, handshake, or the capability query are returned with a
    /// diagnostic message; one broken plugin never blocks the rest.
    pub async fn find_available_plugins(
        &self,
        token: CancellationToken,
    ) -> Vec<PluginDiscoveryResult> {
        {
            let state = self.state.read().await;
            if let Some(memo) = &state.discovery_memo {
                return memo.clone();
            }
        }

        let mut state = self.state.write().await;
        if let Some(memo) = &state.discovery_memo {
            return memo.clone();
        }

        let (settings, factory) = ensure_runtime(&mut state);
        let options = ConnectionOptions::from_settings(&settings);
        let discovered = state.discoverer.discover().await;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(discovered.len());

        for result in discovered {
            let path = result.plugin_file().path().to_path_buf();
            if !seen.insert(path.clone()) {
                continue;
            }

            if !result.plugin_file().is_valid() {
                debug!(
                    path = %path.display(),
                    state = %result.plugin_file().state(),
                    "skipping plugin"
                );
                results.push(result);
                continue;
            }

            match self
                .setup_plugin(&factory, &options, &settings, &path, &token)
                .await
            {
                Ok((plugin, claims)) => {
                    debug!(path = %path.display(), ?claims, "plugin ready");
                    state.claims.insert(path.clone(), claims);
                    state.plugins.insert(path, plugin);
                    results.push(result);
                }
                Err(message) => {
                    warn!(path = %path.display(), message = %message, "plugin is not usable");
                    results.push(result.with_message(message));
                }
            }
        }

        state.discovery_memo = Some(results.clone());
        results
    }

    /// Ready one plugin: spawn, initialize, link lifetimes, query claims
    async fn setup_plugin(
        &self,
        factory: &Arc<PluginFactory>,
        options: &ConnectionOptions,
        settings: &PluginSettings,
        path: &Path,
        token: &CancellationToken,
    ) -> std::result::Result<(Arc<Plugin>, Vec<OperationClaim>), String> {
        let plugin = factory
            .get_or_create(path, &launch_args(), options)
            .await
            .map_err(|error| format!("plugin at {} failed to start: {error}", path.display()))?;
        let connection = plugin.connection();

        let request = InitializeRequest {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_seconds: settings.request_timeout.as_secs(),
        };
        let response: InitializeResponse = send_typed(
            connection.as_ref(),
            MessageMethod::Initialize,
            &request,
            token.clone(),
        )
        .await
        .map_err(|error| {
            format!(
                "plugin at {} failed to initialize: {error}",
                path.display()
            )
        })?;
        if response.response_code != MessageResponseCode::Success {
            return Err(format!(
                "plugin at {} rejected initialization",
                path.display()
            ));
        }

        // Lifetime linkage is best-effort; idle eviction remains the backstop.
        let request = MonitorProcessExitRequest {
            process_id: std::process::id(),
        };
        match send_typed::<_, MonitorProcessExitResponse>(
            connection.as_ref(),
            MessageMethod::MonitorProcessExit,
            &request,
            token.clone(),
        )
        .await
        {
            Ok(response) if response.response_code == MessageResponseCode::Success => {}
            Ok(_) => {
                debug!(path = %path.display(), "plugin declined process-exit monitoring");
            }
            Err(error) => {
                debug!(
                    path = %path.display(),
                    %error,
                    "process-exit monitoring unavailable"
                );
            }
        }

        // Credential plugins are source-agnostic: claims are queried once
        // with no package source and cached for the plugin's lifetime.
        let request = GetOperationClaimsRequest {
            package_source_repository: None,
            service_index: None,
        };
        let response: GetOperationClaimsResponse = send_typed(
            connection.as_ref(),
            MessageMethod::GetOperationClaims,
            &request,
            token.clone(),
        )
        .await
        .map_err(|error| {
            format!(
                "plugin at {} failed the capability query: {error}",
                path.display()
            )
        })?;
        let claims = response.claims;

        if !claims.is_empty() {
            let request = SetCredentialsRequest {
                package_source_repository: None,
                username: None,
                password: None,
                proxy_username: None,
                proxy_password: None,
            };
            if let Err(error) = send_typed::<_, SetCredentialsResponse>(
                connection.as_ref(),
                MessageMethod::SetCredentials,
                &request,
                token.clone(),
            )
            .await
            {
                debug!(path = %path.display(), %error, "credential push not accepted");
            }
        }

        Ok((plugin, claims))
    }

    /// Cached operation claims for `path`, if the plugin reached the
    /// capability query
    pub async fn operation_claims(&self, path: &Path) -> Option<Vec<OperationClaim>> {
        self.state.read().await.claims.get(path).cloned()
    }

    /// Resolve a live plugin for `path` through the factory, respawning
    /// after eviction or a transport failure
    pub async fn get_plugin(&self, path: &Path) -> Result<Arc<Plugin>> {
        let (settings, factory) = {
            let mut state = self.state.write().await;
            ensure_runtime(&mut state)
        };
        let options = ConnectionOptions::from_settings(&settings);
        let plugin = factory
            .get_or_create(path, &launch_args(), &options)
            .await?;
        Ok(plugin)
    }

    /// Atomically dispose all plugins, drop every cache, and install new
    /// collaborators
    pub async fn reinitialize(
        &self,
        reader: Arc<dyn EnvironmentReader>,
        discoverer: Arc<dyn PluginDiscovery>,
        factory_builder: PluginFactoryBuilder,
    ) {
        let mut state = self.state.write().await;

        if let Some(factory) = state.factory.take() {
            factory.dispose().await;
        }

        state.reader = reader;
        state.discoverer = discoverer;
        state.factory_builder = factory_builder;
        state.settings = None;
        state.discovery_memo = None;
        state.claims.clear();
        state.plugins.clear();

        info!("plugin manager reinitialized");
    }

    /// Dispose every plugin and drop all cached state
    pub async fn dispose(&self) {
        let mut state = self.state.write().await;

        if let Some(factory) = state.factory.take() {
            factory.dispose().await;
        }

        state.settings = None;
        state.discovery_memo = None;
        state.claims.clear();
        state.plugins.clear();
    }
}

/// Resolve settings and build the factory on first use
fn ensure_runtime(state: &mut ManagerState) -> (PluginSettings, Arc<PluginFactory>) {
    let settings = match state.settings {
        Some(settings) => settings,
        None => {
            let settings = PluginSettings::from_reader(state.reader.as_ref());
            state.settings = Some(settings);
            settings
        }
    };

    let factory = match &state.factory {
        Some(factory) => Arc::clone(factory),
        None => {
            let factory = (state.factory_builder)(settings.idle_timeout);
            state.factory = Some(Arc::clone(&factory));
            factory
        }
    };

    (settings, factory)
}

fn launch_args() -> Vec<String> {
    PLUGIN_LAUNCH_ARGS.iter().map(|arg| arg.to_string()).collect()
}
