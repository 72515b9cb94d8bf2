//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Stream destination configuration
///
/// The stream key is a secret; it is combined with the base URL to form the
/// full publish destination and must never appear in logs.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamConfig {
    /// Stream key (secret)
    #[serde(default)]
    pub key: String,
    /// Destination base URL (e.g. rtmp://host/live)
    #[serde(default)]
    pub url: String,
}

impl StreamConfig {
    /// Full publish destination: base URL joined with the stream key
    pub fn destination(&self) -> String {
        format!("{}/{}", self.url, self.key)
    }
}

/// Media library configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Directory holding the media items
    #[serde(default = "default_library_dir")]
    pub dir: PathBuf,
    /// Number of items in the catalog; ids are [0, catalog_size)
    #[serde(default)]
    pub catalog_size: u32,
    /// Recently-played capacity; must be smaller than catalog_size
    #[serde(default)]
    pub rotation_capacity: u32,
    /// File name pattern; "{index}" is replaced with the content id
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
}

fn default_library_dir() -> PathBuf {
    PathBuf::from("videos")
}

fn default_file_pattern() -> String {
    "{index}.mp4".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            dir: default_library_dir(),
            catalog_size: 0,
            rotation_capacity: 0,
            file_pattern: default_file_pattern(),
        }
    }
}

/// Supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Consecutive failed start attempts before halting (default 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before a restart attempt is retried, in seconds (default 10)
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Health check interval, in seconds (default 30)
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_secs() -> u64 {
    10
}

fn default_health_check_secs() -> u64 {
    30
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            health_check_secs: default_health_check_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LOOPCAST_STREAM_KEY -> stream.key
    /// - LOOPCAST_STREAM_URL -> stream.url
    /// - LOOPCAST_LIBRARY_DIR -> library.dir
    /// - LOOPCAST_CATALOG_SIZE -> library.catalog_size
    /// - LOOPCAST_ROTATION_CAPACITY -> library.rotation_capacity
    /// - LOOPCAST_MAX_ATTEMPTS -> supervisor.max_attempts
    /// - LOOPCAST_BACKOFF_SECS -> supervisor.backoff_secs
    /// - LOOPCAST_HEALTH_CHECK_SECS -> supervisor.health_check_secs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LOOPCAST_STREAM_KEY") {
            if !val.is_empty() {
                self.stream.key = val;
            }
        }

        if let Ok(val) = env::var("LOOPCAST_STREAM_URL") {
            if !val.is_empty() {
                self.stream.url = val;
            }
        }

        if let Ok(val) = env::var("LOOPCAST_LIBRARY_DIR") {
            if !val.is_empty() {
                self.library.dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("LOOPCAST_CATALOG_SIZE") {
            if let Ok(size) = val.parse::<u32>() {
                self.library.catalog_size = size;
            }
        }

        if let Ok(val) = env::var("LOOPCAST_ROTATION_CAPACITY") {
            if let Ok(capacity) = val.parse::<u32>() {
                self.library.rotation_capacity = capacity;
            }
        }

        if let Ok(val) = env::var("LOOPCAST_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.supervisor.max_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("LOOPCAST_BACKOFF_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervisor.backoff_secs = secs;
            }
        }

        if let Ok(val) = env::var("LOOPCAST_HEALTH_CHECK_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervisor.health_check_secs = secs;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
