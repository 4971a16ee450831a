//! Plugin-backed credential provider.
//!
//! Wraps exactly one discovered, valid plugin as a credential source. A
//! provider never lets a transport failure escape: every problem maps to a
//! `Failure` result so the caller can fall through to its next source.

use crate::credentials::{CredentialRequestType, Credentials, CredentialsResult};
use crate::error::{Error, Result};
use crate::plugin::connection::send_typed;
use crate::plugin::discovery::PluginDiscoveryResult;
use crate::plugin::manager::PluginManager;
use crate::protocol::{
    GetAuthenticationCredentialsRequest, GetAuthenticationCredentialsResponse, MessageMethod,
    MessageResponseCode, OperationClaim,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Credential source backed by one discovered plugin
#[derive(Debug)]
pub struct PluginCredentialProvider {
    manager: Arc<PluginManager>,
    path: PathBuf,
    id: String,
}

impl PluginCredentialProvider {
    /// Wrap `discovery_result` as a credential source.
    ///
    /// Only a result whose file state is valid may back a provider;
    /// anything else is a contract violation surfaced immediately.
    pub fn new(manager: Arc<PluginManager>, discovery_result: &PluginDiscoveryResult) -> Result<Self> {
        let plugin_file = discovery_result.plugin_file();
        if !plugin_file.is_valid() {
            return Err(Error::Contract(format!(
                "a credential provider requires a valid plugin file, but {} is {}",
                plugin_file.path().display(),
                plugin_file.state()
            )));
        }

        let path = plugin_file.path().to_path_buf();
        let id = format!("PluginCredentialProvider_{}", path.display());

        Ok(Self { manager, path, id })
    }

    /// Stable identifier embedding the plugin path, for diagnostics
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the plugin for credentials for `uri`.
    ///
    /// Returns `ProviderNotApplicable` without issuing any request when the
    /// plugin's cached claims exclude authentication. Transport failures
    /// come back as `Failure`, never as an error.
    #[allow(clippy::too_many_arguments)]
    pub async fn get(
        &self,
        uri: &str,
        proxy: Option<&str>,
        request_type: CredentialRequestType,
        message: Option<&str>,
        is_retry: bool,
        non_interactive: bool,
        token: CancellationToken,
    ) -> CredentialsResult {
        debug!(
            provider = %self.id,
            %uri,
            ?request_type,
            is_retry,
            context = message.unwrap_or_default(),
            "requesting credentials"
        );

        let claims = match self.resolve_claims(&token).await {
            Ok(claims) => claims,
            Err(result) => return result,
        };

        if !claims.contains(&OperationClaim::Authentication) {
            debug!(provider = %self.id, "plugin does not claim authentication support");
            return CredentialsResult::not_applicable();
        }

        let plugin = match self.manager.get_plugin(&self.path).await {
            Ok(plugin) => plugin,
            Err(error) => {
                warn!(provider = %self.id, %error, "plugin is unavailable");
                return CredentialsResult::failure(format!(
                    "plugin at {} is unavailable: {error}",
                    self.path.display()
                ));
            }
        };

        let request = GetAuthenticationCredentialsRequest {
            uri: uri.to_string(),
            is_proxy_request: proxy.is_some(),
            is_retry,
            non_interactive,
        };

        let connection = plugin.connection();
        match send_typed::<_, GetAuthenticationCredentialsResponse>(
            connection.as_ref(),
            MessageMethod::GetAuthenticationCredentials,
            &request,
            token,
        )
        .await
        {
            Ok(response) if response.response_code == MessageResponseCode::Success => {
                if response.username.is_none() && response.password.is_none() {
                    return CredentialsResult::failure(format!(
                        "plugin at {} answered success without credentials",
                        self.path.display()
                    ));
                }
                CredentialsResult::success(Credentials {
                    username: response.username,
                    password: response.password,
                })
            }
            Ok(response) => CredentialsResult::failure(response.message.unwrap_or_else(|| {
                format!(
                    "plugin at {} declined the credential request",
                    self.path.display()
                )
            })),
            Err(error) => {
                warn!(provider = %self.id, %error, "credential request failed");
                CredentialsResult::failure(format!(
                    "plugin at {} failed the credential request: {error}",
                    self.path.display()
                ))
            }
        }
    }

    /// Fetch the plugin's cached claims, running discovery on first use
    async fn resolve_claims(
        &self,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<OperationClaim>, CredentialsResult> {
        if let Some(claims) = self.manager.operation_claims(&self.path).await {
            return Ok(claims);
        }

        self.manager.find_available_plugins(token.clone()).await;

        match self.manager.operation_claims(&self.path).await {
            Some(claims) => Ok(claims),
            None => Err(CredentialsResult::failure(format!(
                "plugin at {} is not usable",
                self.path.display()
            ))),
        }
    }
}
