//! Builds credential providers from discovered plugins.

use crate::credentials::provider::PluginCredentialProvider;
use crate::plugin::manager::PluginManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fans discovery out into one credential provider per usable plugin
#[derive(Debug)]
pub struct CredentialProviderBuilder {
    manager: Arc<PluginManager>,
}

impl CredentialProviderBuilder {
    /// Create a builder over `manager`
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    /// Discover plugins and wrap every valid one as a credential provider.
    ///
    /// Non-valid discovery results are skipped with a debug log; only
    /// plugins whose file passed validation ever back a provider.
    pub async fn build_all(&self, token: CancellationToken) -> Vec<Arc<PluginCredentialProvider>> {
        let results = self.manager.find_available_plugins(token).await;
        let mut providers = Vec::with_capacity(results.len());

        for result in &results {
            if !result.plugin_file().is_valid() {
                debug!(
                    path = %result.plugin_file().path().display(),
                    message = result.message().unwrap_or_default(),
                    "not building a credential provider"
                );
                continue;
            }

            match PluginCredentialProvider::new(Arc::clone(&self.manager), result) {
                Ok(provider) => providers.push(Arc::new(provider)),
                Err(error) => {
                    debug!(%error, "skipping credential provider");
                }
            }
        }

        providers
    }
}
