//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MBOXPRUNE_CONFIG` (environment variable)
//! 2. `~/.config/mboxprune/config.toml` (Linux/macOS)
//!    `%APPDATA%\mboxprune\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Archive scanning.
    pub scan: ScanConfig,
    /// Open-session behavior.
    pub session: SessionConfig,
    /// Export and in-place rewrite.
    pub write: WriteConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// How header values are cached in the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    /// Parse `Subject`, `From`, `To` and `Date` during the scan and keep them in memory.
    #[default]
    Eager,
    /// Keep only byte ranges; re-read a message's header block when it is needed.
    Lazy,
}

/// Scanner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Read buffer size in bytes (default: 1 MiB).
    pub read_buffer_size: usize,
    /// Maximum number of header bytes examined per message (default: 64 KiB).
    pub max_header_bytes: usize,
    /// Eager or lazy header parsing.
    pub header_mode: HeaderMode,
    /// Only accept a `From ` line as a boundary at the start of the file or
    /// after a blank line.
    pub strict_boundaries: bool,
}

/// Session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of lazily loaded header sets kept in the LRU cache.
    pub header_cache_size: usize,
}

/// Writer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Copy buffer size in bytes (default: 1 MiB).
    pub buffer_size: usize,
    /// fsync output before reporting success (and before the rename of an
    /// in-place rewrite).
    pub sync: bool,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024 * 1024, // 1 MiB
            max_header_bytes: 64 * 1024,   // 64 KiB
            header_mode: HeaderMode::Eager,
            strict_boundaries: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            header_cache_size: 1024,
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024, // 1 MiB
            sync: true,
        }
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MBOXPRUNE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mboxprune").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mboxprune")
}
