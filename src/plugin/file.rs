//! Plugin file validation.
//!
//! Classifies a candidate plugin path into a trust/usability state. No
//! outcome is an error; callers branch on the returned state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Trust/usability state of a candidate plugin path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginFileState {
    /// The file exists and passes the platform trust policy
    Valid,
    /// The file exists but fails the platform trust policy
    InvalidEmbeddedSignature,
    /// The path itself is malformed
    InvalidFilePath,
    /// No file exists at the path
    NotFound,
}

impl std::fmt::Display for PluginFileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Valid => "valid",
            Self::InvalidEmbeddedSignature => "invalid embedded signature",
            Self::InvalidFilePath => "invalid file path",
            Self::NotFound => "not found",
        };
        write!(f, "{text}")
    }
}

/// A candidate plugin path together with its classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFile {
    path: PathBuf,
    state: PluginFileState,
}

impl PluginFile {
    /// Create a plugin file with an already-known state
    pub fn new(path: impl Into<PathBuf>, state: PluginFileState) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }

    /// Classify `path` by existence, executability, and platform trust policy
    pub fn classify(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = classify_path(&path);

        debug!(path = %path.display(), ?state, "classified plugin path");

        Self { path, state }
    }

    /// The candidate path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The classification outcome
    pub fn state(&self) -> PluginFileState {
        self.state
    }

    /// Whether the file may be spawned as a plugin
    pub fn is_valid(&self) -> bool {
        self.state == PluginFileState::Valid
    }
}

fn classify_path(path: &Path) -> PluginFileState {
    if path.as_os_str().is_empty() || !path.is_absolute() {
        return PluginFileState::InvalidFilePath;
    }

    match path.metadata() {
        Ok(metadata) if metadata.is_file() => {
            if passes_trust_policy(path, &metadata) {
                PluginFileState::Valid
            } else {
                PluginFileState::InvalidEmbeddedSignature
            }
        }
        Ok(_) => PluginFileState::InvalidFilePath,
        Err(_) => PluginFileState::NotFound,
    }
}

/// The platform trust policy: an execute permission bit on unix, an
/// embedded-signature policy elsewhere.
#[cfg(unix)]
fn passes_trust_policy(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn passes_trust_policy(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    // Embedded-signature verification is delegated to the platform; accept
    // recognized executable extensions here.
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("exe") | Some("bat") | Some("cmd")
    )
}
