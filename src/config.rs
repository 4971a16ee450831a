//! Plugin host configuration.
//!
//! All configuration reaches this crate as name/value pairs through an
//! [`EnvironmentReader`], so tests and embedders can substitute their own
//! source. Invalid or absent values fall back to documented defaults.

use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Environment variable listing plugin executable paths, separated with the
/// platform's path-list delimiter.
pub const PLUGIN_PATHS_ENV: &str = "FCP_PLUGIN_PATHS";

/// Per-request timeout override, in seconds.
pub const REQUEST_TIMEOUT_ENV: &str = "FCP_PLUGIN_REQUEST_TIMEOUT_IN_SECONDS";

/// Handshake timeout override, in seconds.
pub const HANDSHAKE_TIMEOUT_ENV: &str = "FCP_PLUGIN_HANDSHAKE_TIMEOUT_IN_SECONDS";

/// Idle eviction timeout override, in seconds.
pub const IDLE_TIMEOUT_ENV: &str = "FCP_PLUGIN_IDLE_TIMEOUT_IN_SECONDS";

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default idle eviction timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Smallest accepted timeout
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Read access to the host environment's name/value configuration
pub trait EnvironmentReader: Send + Sync + fmt::Debug {
    /// Return the raw value for `name`, or `None` when unset or empty
    fn get(&self, name: &str) -> Option<String>;
}

/// [`EnvironmentReader`] backed by the process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironmentReader;

impl EnvironmentReader for SystemEnvironmentReader {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }
}

/// Timeouts governing plugin connections, resolved from the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginSettings {
    /// Timeout for each request/response round trip
    pub request_timeout: Duration,
    /// Timeout for the initial version handshake
    pub handshake_timeout: Duration,
    /// Inactivity duration after which a cached plugin is released
    pub idle_timeout: Duration,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl PluginSettings {
    /// Resolve settings through `reader`, falling back to defaults for
    /// absent or unparseable values
    pub fn from_reader(reader: &dyn EnvironmentReader) -> Self {
        Self {
            request_timeout: timeout_from(reader, REQUEST_TIMEOUT_ENV, DEFAULT_REQUEST_TIMEOUT),
            handshake_timeout: timeout_from(
                reader,
                HANDSHAKE_TIMEOUT_ENV,
                DEFAULT_HANDSHAKE_TIMEOUT,
            ),
            idle_timeout: timeout_from(reader, IDLE_TIMEOUT_ENV, DEFAULT_IDLE_TIMEOUT),
        }
    }
}

fn timeout_from(reader: &dyn EnvironmentReader, name: &str, default: Duration) -> Duration {
    let Some(raw) = reader.get(name) else {
        return default;
    };

    match raw.trim().parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds).clamp(MIN_TIMEOUT, MAX_TIMEOUT),
        Err(_) => {
            debug!(
                variable = name,
                value = %raw,
                "ignoring unparseable timeout value, using default"
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct MapReader(HashMap<&'static str, &'static str>);

    impl EnvironmentReader for MapReader {
        fn get(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|value| value.to_string())
        }
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let settings = PluginSettings::from_reader(&MapReader::default());

        assert_eq!(settings, PluginSettings::default());
        assert_eq!(settings.request_timeout, Duration::from_secs(300));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(15));
        assert_eq!(settings.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_values_parsed_from_reader() {
        let reader = MapReader(HashMap::from([
            (REQUEST_TIMEOUT_ENV, "30"),
            (HANDSHAKE_TIMEOUT_ENV, "5"),
            (IDLE_TIMEOUT_ENV, "120"),
        ]));

        let settings = PluginSettings::from_reader(&reader);

        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let reader = MapReader(HashMap::from([
            (REQUEST_TIMEOUT_ENV, "RequestTimeout"),
            (HANDSHAKE_TIMEOUT_ENV, "-3"),
            (IDLE_TIMEOUT_ENV, "12.5"),
        ]));

        let settings = PluginSettings::from_reader(&reader);

        assert_eq!(settings, PluginSettings::default());
    }

    #[test]
    fn test_values_clamped_to_bounds() {
        let reader = MapReader(HashMap::from([
            (REQUEST_TIMEOUT_ENV, "0"),
            (IDLE_TIMEOUT_ENV, "999999999"),
        ]));

        let settings = PluginSettings::from_reader(&reader);

        assert_eq!(settings.request_timeout, MIN_TIMEOUT);
        assert_eq!(settings.idle_timeout, MAX_TIMEOUT);
    }

    #[test]
    fn test_system_reader_filters_empty_values() {
        std::env::set_var("FCP_TEST_EMPTY_VALUE", "");
        let reader = SystemEnvironmentReader;

        assert_eq!(reader.get("FCP_TEST_EMPTY_VALUE"), None);
        assert_eq!(reader.get("FCP_TEST_DEFINITELY_UNSET"), None);
    }
}
