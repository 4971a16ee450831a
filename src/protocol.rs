//! FCP message model.
//!
//! Defines the envelope and typed payloads exchanged with a credential
//! plugin over its standard streams. Messages are newline-delimited JSON;
//! every request carries the protocol version negotiated during the
//! handshake.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version offered by this client.
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Oldest protocol version this client still accepts.
pub const MINIMUM_PROTOCOL_VERSION: &str = "1.0.0";

/// Message envelope for all plugin traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Correlates a response with its request
    pub request_id: String,
    /// Request, response, or fault
    pub kind: MessageKind,
    /// Logical method this message belongs to
    pub method: MessageMethod,
    /// Protocol version the sender is speaking
    pub protocol_version: String,
    /// Method-specific payload
    pub payload: Option<serde_json::Value>,
}

impl Message {
    /// Create a request message with a fresh request id
    pub fn request(
        method: MessageMethod,
        protocol_version: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            kind: MessageKind::Request,
            method,
            protocol_version: protocol_version.into(),
            payload,
        }
    }

    /// Create a response correlated with an existing request
    pub fn response(
        request_id: impl Into<String>,
        method: MessageMethod,
        protocol_version: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            kind: MessageKind::Response,
            method,
            protocol_version: protocol_version.into(),
            payload,
        }
    }

    /// Create a fault correlated with an existing request
    pub fn fault(
        request_id: impl Into<String>,
        method: MessageMethod,
        protocol_version: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let payload = serde_json::to_value(Fault {
            message: message.into(),
        })
        .ok();

        Self {
            request_id: request_id.into(),
            kind: MessageKind::Fault,
            method,
            protocol_version: protocol_version.into(),
            payload,
        }
    }
}

/// Kinds of messages in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
    Fault,
}

/// Logical methods a connection can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageMethod {
    /// Protocol version negotiation, first exchange on every connection
    Handshake,
    /// Client introduction and timeout advertisement
    Initialize,
    /// Links the plugin's lifetime to the host process
    MonitorProcessExit,
    /// Queries the capabilities a plugin advertises
    GetOperationClaims,
    /// Pushes already-known credentials down to the plugin
    SetCredentials,
    /// Asks the plugin for feed credentials
    GetAuthenticationCredentials,
    /// Orderly shutdown notification
    Close,
}

/// Outcome code carried by most responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageResponseCode {
    Success,
    Error,
    NotFound,
}

/// Capability a plugin advertises supporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationClaim {
    /// The plugin can answer credential requests
    Authentication,
    /// The plugin can download packages itself
    DownloadPackage,
}

/// Fault payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub message: String,
}

/// Handshake request offering a version range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: String,
    pub minimum_protocol_version: String,
}

/// Handshake response carrying the version the plugin picked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub response_code: MessageResponseCode,
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub client_version: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub response_code: MessageResponseCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorProcessExitRequest {
    pub process_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorProcessExitResponse {
    pub response_code: MessageResponseCode,
}

/// Claims query; credential plugins are source-agnostic so the repository
/// is `None` for them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOperationClaimsRequest {
    pub package_source_repository: Option<String>,
    pub service_index: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOperationClaimsResponse {
    pub claims: Vec<OperationClaim>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCredentialsRequest {
    pub package_source_repository: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCredentialsResponse {
    pub response_code: MessageResponseCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAuthenticationCredentialsRequest {
    pub uri: String,
    pub is_proxy_request: bool,
    pub is_retry: bool,
    pub non_interactive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAuthenticationCredentialsResponse {
    pub response_code: MessageResponseCode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub message: Option<String>,
    pub authentication_types: Option<Vec<String>>,
}

/// Parse a `major.minor.patch` version string
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Check that `candidate` falls inside the `[minimum, maximum]` version range
pub fn version_in_range(candidate: &str, minimum: &str, maximum: &str) -> bool {
    match (
        parse_version(candidate),
        parse_version(minimum),
        parse_version(maximum),
    ) {
        (Some(c), Some(min), Some(max)) => min <= c && c <= max,
        _ => false,
    }
}
