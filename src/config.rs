// =============================================================================
// CONFIGURATION - Load diagnostic settings from config.toml
// =============================================================================
//
// The window and context are fixed. Only diagnostics can be tuned here:
// validation layers, logging, and what to do when a shader fails to build.
// A missing file means defaults; a broken file means defaults plus a warning.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
    /// File the settings came from; `None` means built-in defaults
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "buffer_free.log".to_string(),
        }
    }
}

/// Shader build settings
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ShaderConfig {
    pub on_failure: ShaderFailurePolicy,
}

/// What the frame loop does when compiling or linking the shaders fails
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShaderFailurePolicy {
    /// Stop with the compiler diagnostics
    #[default]
    Abort,
    /// Log the diagnostics and keep presenting cleared frames
    Warn,
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    ///
    /// Runs before the logger exists, so problems go straight to stderr.
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            eprintln!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    ///
    /// Doesn't log; see `log_source` for reporting once logging is up.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    /// Report where the settings came from
    pub fn log_source(&self) {
        match &self.source {
            Some(path) => log::info!("Loaded configuration from {:?}", path),
            None => log::info!("No config file loaded, using defaults"),
        }
        log::debug!("Config: {:?}", self);
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the log level as a `log` filter
    pub fn get_log_level(&self) -> LevelFilter {
        match self.debug.log_level.to_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            // The logger is not up yet when this runs, so this can't be a log::warn!
            other => {
                eprintln!("Unknown log level '{}', defaulting to info", other);
                LevelFilter::Info
            }
        }
    }

    /// Validation layers are only ever requested in debug builds
    pub fn wants_validation(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.debug.validation_layers);
        assert!(!config.debug.log_to_file);
        assert_eq!(config.get_log_level(), LevelFilter::Info);
        assert_eq!(config.shaders.on_failure, ShaderFailurePolicy::Abort);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [debug]
            log_level = "DEBUG"

            [shaders]
            on_failure = "warn"
            "#,
        )
        .unwrap();

        assert_eq!(config.get_log_level(), LevelFilter::Debug);
        assert_eq!(config.debug.log_file, "buffer_free.log");
        assert_eq!(config.shaders.on_failure, ShaderFailurePolicy::Warn);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(Config::parse("[shaders]\non_failure = \"ignore\"").is_err());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config::parse("[debug]\nlog_level = \"loud\"").unwrap();
        assert_eq!(config.get_log_level(), LevelFilter::Info);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.shaders.on_failure, ShaderFailurePolicy::Abort);
        assert_eq!(config.source, None);
    }

    #[test]
    fn loaded_file_is_remembered_for_logging_later() {
        let path = std::env::temp_dir().join(format!(
            "buffer_free_config_{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[shaders]\non_failure = \"warn\"\n").unwrap();

        let config = Config::load_from_path(&path);
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.shaders.on_failure, ShaderFailurePolicy::Warn);
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
    }
}
