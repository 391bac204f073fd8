//! Configuration system for MeshTrek
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of correlation and output settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtrekConfig {
    /// General settings
    pub general: GeneralSettings,

    /// Correlation settings
    pub correlation: CorrelationSettings,

    /// Output settings
    pub output: OutputSettings,

    /// Topology settings
    pub topology: TopologySettings,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// How non-entry log files are searched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Load and index every file once per run
    #[default]
    Indexed,
    /// Re-read every other file for each unresolved prefix
    Rescan,
}

impl std::str::FromStr for ScanMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "indexed" => Ok(ScanMode::Indexed),
            "rescan" => Ok(ScanMode::Rescan),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid scan mode: {}. Must be one of: [\"indexed\", \"rescan\"]",
                other
            ))),
        }
    }
}

/// Correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Extension of fragment log files (without the dot)
    pub log_extension: String,

    /// Accepted hop counts per request (empty = any)
    pub required_span_lengths: Vec<usize>,

    /// Fraction of entry-file requests dropped at each end (warm-up/cool-down)
    pub trim_fraction: f64,

    /// How the other log files are searched
    pub scan_mode: ScanMode,

    /// Abort on the first malformed line instead of skipping it
    pub strict_parse: bool,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            log_extension: "log".to_string(),
            required_span_lengths: Vec::new(),
            trim_fraction: 0.0,
            scan_mode: ScanMode::Indexed,
            strict_parse: false,
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Directory receiving span and metadata chunks
    pub dir: String,

    /// Requests per output chunk
    pub batch_size: usize,

    /// Requests per chunk when re-chunking an existing span set
    pub rechunk_size: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: ".".to_string(),
            batch_size: 50,
            rechunk_size: 500,
        }
    }
}

/// Topology settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySettings {
    /// Path to a layered service topology (JSON)
    pub path: Option<String>,
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. MESHTREK_CONFIG environment variable
    /// 3. ~/.config/meshtrek/config.toml
    /// 4. /etc/meshtrek/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<MeshtrekConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            MeshtrekConfig::default()
        };

        self.apply_env_overrides(&mut config);
        Self::validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("MESHTREK_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("MESHTREK_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("meshtrek").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/meshtrek/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<MeshtrekConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshtrekConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut MeshtrekConfig) {
        if let Ok(val) = std::env::var("MESHTREK_LOG_LEVEL") {
            config.general.log_level = val;
        }

        if let Ok(val) = std::env::var("MESHTREK_OUTPUT_DIR") {
            config.output.dir = val;
        }
        if let Ok(val) = std::env::var("MESHTREK_BATCH_SIZE") {
            match val.parse() {
                Ok(size) => config.output.batch_size = size,
                Err(_) => warn!("Ignoring MESHTREK_BATCH_SIZE={}: not a number", val),
            }
        }

        if let Ok(val) = std::env::var("MESHTREK_TOPOLOGY") {
            config.topology.path = Some(val);
        }

        if let Ok(val) = std::env::var("MESHTREK_SPAN_LENGTHS") {
            match parse_span_lengths(&val) {
                Some(lengths) => config.correlation.required_span_lengths = lengths,
                None => warn!("Ignoring MESHTREK_SPAN_LENGTHS={}: expected e.g. \"3,6\"", val),
            }
        }
        if let Ok(val) = std::env::var("MESHTREK_SCAN_MODE") {
            match val.parse() {
                Ok(mode) => config.correlation.scan_mode = mode,
                Err(e) => warn!("Ignoring MESHTREK_SCAN_MODE: {}", e),
            }
        }
    }

    /// Validate configuration
    pub fn validate(config: &MeshtrekConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.general.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.general.log_level, valid_levels
            )));
        }

        if config.output.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "Output batch size cannot be 0".to_string(),
            ));
        }
        if config.output.rechunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "Re-chunk size cannot be 0".to_string(),
            ));
        }

        let trim = config.correlation.trim_fraction;
        if !(0.0..0.5).contains(&trim) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid trim fraction: {}. Must be in [0, 0.5)",
                trim
            )));
        }

        if config.correlation.log_extension.is_empty() {
            return Err(ConfigError::ValidationError(
                "Log extension cannot be empty".to_string(),
            ));
        }

        if config.correlation.required_span_lengths.contains(&0) {
            return Err(ConfigError::ValidationError(
                "Required span lengths must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &MeshtrekConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("meshtrek").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a comma-separated list of hop counts, e.g. `"3,6"`.
pub fn parse_span_lengths(value: &str) -> Option<Vec<usize>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
