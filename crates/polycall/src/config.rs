//! Runtime configuration.
//!
//! Configuration comes from an optional JSON file (pointed at by the
//! `CONFIGURATION_PATH` environment variable or passed explicitly) overlaid
//! with the loader-related environment variables. Everything is optional;
//! an empty configuration is fully functional.

use std::{fmt, path::PathBuf};

use indexmap::IndexMap;

/// Environment variable naming the directory loader plugins are resolved
/// from. Consumed by embedders hosting dynamic backends; recorded here so
/// the whole environment surface lives in one place.
pub const ENV_LIBRARY_PATH: &str = "LOADER_LIBRARY_PATH";

/// Environment variable with the default script search path for
/// `load_from_file`.
pub const ENV_SCRIPT_PATH: &str = "LOADER_SCRIPT_PATH";

/// Environment variable pointing at the JSON configuration file.
pub const ENV_CONFIGURATION_PATH: &str = "CONFIGURATION_PATH";

/// Deserialized runtime configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Directory loader plugins are resolved from.
    pub library_path: Option<PathBuf>,
    /// Search paths consulted when `load_from_file` receives a relative
    /// path. Loaders append their own execution paths to these.
    pub script_paths: Vec<PathBuf>,
    /// Name of the serial format used by `inspect` consumers; defaults to
    /// `"json"` when unset.
    pub default_serial: Option<String>,
    /// Free-form per-loader options keyed by tag, handed to the backend's
    /// `initialize`.
    pub loaders: IndexMap<String, serde_json::Value>,
}

/// Failures reading or parsing the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "cannot read configuration: {msg}"),
            Self::Parse(msg) => write!(f, "cannot parse configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Configuration {
    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Reads and parses the JSON configuration file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json(&text)
    }

    /// Builds a configuration from the environment: the file named by
    /// `CONFIGURATION_PATH` (when set and readable) overlaid with
    /// `LOADER_LIBRARY_PATH` and `LOADER_SCRIPT_PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = std::env::var_os(ENV_CONFIGURATION_PATH)
            .map(PathBuf::from)
            .and_then(|path| Self::from_file(&path).ok())
            .unwrap_or_default();
        if let Some(library) = std::env::var_os(ENV_LIBRARY_PATH) {
            config.library_path = Some(PathBuf::from(library));
        }
        if let Some(scripts) = std::env::var_os(ENV_SCRIPT_PATH) {
            for path in std::env::split_paths(&scripts) {
                if !config.script_paths.contains(&path) {
                    config.script_paths.push(path);
                }
            }
        }
        config
    }

    /// The backend options recorded for `tag`, if any.
    #[must_use]
    pub fn loader_options(&self, tag: &str) -> Option<&serde_json::Value> {
        self.loaders.get(tag)
    }

    /// The effective default serial format name.
    #[must_use]
    pub fn serial_name(&self) -> &str {
        self.default_serial.as_deref().unwrap_or("json")
    }
}
