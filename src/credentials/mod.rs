//! Credential acquisition through discovered plugins.
//!
//! Adapts a discovered, valid plugin into a generic credential source
//! consumed by the broader authentication pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod builder;
pub mod provider;

pub use builder::CredentialProviderBuilder;
pub use provider::PluginCredentialProvider;

/// Why credentials are being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialRequestType {
    /// The feed answered 401
    Unauthorized,
    /// The feed answered 403
    Forbidden,
    /// A proxy requires authentication
    Proxy,
}

/// A username/secret pair returned by a plugin
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Outcome classification of one credential request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsResultStatus {
    /// The plugin produced credentials
    Success,
    /// The plugin does not handle this kind of request
    ProviderNotApplicable,
    /// The plugin failed or declined; the caller may try its next source
    Failure,
}

/// Result handed back to the authentication pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsResult {
    pub status: CredentialsResultStatus,
    pub credentials: Option<Credentials>,
    pub message: Option<String>,
}

impl CredentialsResult {
    /// Successful acquisition
    pub fn success(credentials: Credentials) -> Self {
        Self {
            status: CredentialsResultStatus::Success,
            credentials: Some(credentials),
            message: None,
        }
    }

    /// The provider does not apply to this request
    pub fn not_applicable() -> Self {
        Self {
            status: CredentialsResultStatus::ProviderNotApplicable,
            credentials: None,
            message: None,
        }
    }

    /// The provider failed; `message` explains why
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: CredentialsResultStatus::Failure,
            credentials: None,
            message: Some(message.into()),
        }
    }
}
