//! Engine Configuration
//!
//! Host-level settings shared by every project: the process-group launcher
//! template, default thread count and the project layout names.
//!
//! # Resolution Priority
//!
//! The configuration file is resolved in the following order:
//! 1. The `PROTORUN_CONFIG` environment variable
//! 2. `protorun.yaml` next to the executable
//! 3. `protorun.yaml` in the current working directory
//!
//! A missing file yields the defaults.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV_VAR: &str = "PROTORUN_CONFIG";

/// File name searched next to the executable and in the CWD.
pub const CONFIG_FILE_NAME: &str = "protorun.yaml";

/// Launcher used for process-group execution when none is configured.
pub const DEFAULT_LAUNCHER: &str = "mpirun -np {nodes} {command}";

/// Lazily-resolved path to the engine configuration file.
pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            debug!("Using config from {}: {}", CONFIG_ENV_VAR, path);
            return PathBuf::from(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let prod_path = exe_dir.join(CONFIG_FILE_NAME);
            if prod_path.exists() {
                debug!("Using config next to executable: {}", prod_path.display());
                return prod_path;
            }
        }
    }

    PathBuf::from(CONFIG_FILE_NAME)
});

/// Settings read from `protorun.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Launcher template with `{nodes}` and `{command}` placeholders.
    pub launcher: String,

    /// Thread count used when a protocol declares none.
    pub default_threads: usize,

    /// Object store file name inside a project.
    pub database_name: String,

    pub runs_folder: String,

    pub logs_folder: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            launcher: DEFAULT_LAUNCHER.to_string(),
            default_threads: 1,
            database_name: "project.sqlite".to_string(),
            runs_folder: "Runs".to_string(),
            logs_folder: "Logs".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Loads the configuration from [`CONFIG_PATH`], falling back to defaults.
    pub fn load_default() -> Self {
        let path = &*CONFIG_PATH;
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                info!("Loaded config: {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Clamps a requested thread count to `1..=available CPUs`.
    pub fn cap_threads(&self, requested: usize) -> usize {
        let requested = if requested == 0 {
            self.default_threads
        } else {
            requested
        };
        requested.clamp(1, num_cpus::get().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.launcher, DEFAULT_LAUNCHER);
        assert_eq!(config.database_name, "project.sqlite");
        assert_eq!(config.runs_folder, "Runs");
        assert_eq!(config.logs_folder, "Logs");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("launcher: \"srun -n {nodes} {command}\"\n").unwrap();
        assert_eq!(config.launcher, "srun -n {nodes} {command}");
        assert_eq!(config.runs_folder, "Runs");
    }

    #[test]
    fn test_empty_yaml() {
        assert_eq!(EngineConfig::from_yaml("  \n").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "default_threads: 2").unwrap();
        writeln!(file, "database_name: objects.sqlite").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.default_threads, 2);
        assert_eq!(config.database_name, "objects.sqlite");
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load("/nonexistent/protorun.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = EngineConfig::from_yaml("default_threads: [not, a, number]");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_cap_threads() {
        let config = EngineConfig::default();
        assert_eq!(config.cap_threads(0), 1);
        assert_eq!(config.cap_threads(1), 1);
        assert!(config.cap_threads(10_000) <= num_cpus::get());
    }
}
