use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening side of the camera link.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bytes requested per read. The embedded sender does not care; larger
    /// values mean fewer read calls.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Abort a receive after this many seconds without data. 0 waits forever.
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gain")]
    pub gain: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub mode: CaptureModeKind,
    #[serde(default = "default_shots")]
    pub shots: u32,
    #[serde(default)]
    pub sensitivity: Sensitivity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Settings for the camera emulator.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_sender_target")]
    pub target: String,
    #[serde(default = "default_sender_source")]
    pub source: String,
    #[serde(default = "default_sender_interval")]
    pub interval_secs: f64,
    #[serde(default = "default_sender_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureModeKind {
    #[default]
    Manual,
    Continuous,
}

/// How eagerly continuous capture keeps frames.
///
/// A higher sensitivity maps to a *higher* duplicate threshold, so fewer
/// frames are discarded as repeats of the last kept one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    #[default]
    Low,
    Medium,
    High,
}

impl Sensitivity {
    pub fn threshold(self) -> f64 {
        match self {
            Sensitivity::Low => 0.90,
            Sensitivity::Medium => 0.95,
            Sensitivity::High => 0.975,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            chunk_size: default_chunk_size(),
            idle_timeout_secs: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            extension: default_extension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gain: default_gain(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureModeKind::default(),
            shots: default_shots(),
            sensitivity: Sensitivity::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            target: default_sender_target(),
            source: default_sender_source(),
            interval_secs: default_sender_interval(),
            chunk_size: default_sender_chunk_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Most shots a single manual session may request.
pub const MAX_SHOTS: u32 = 10;

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.chunk_size == 0 {
            return Err(ConfigError::Invalid("receiver.chunk_size must be > 0".into()));
        }
        if self.sender.chunk_size == 0 {
            return Err(ConfigError::Invalid("sender.chunk_size must be > 0".into()));
        }
        validate_shots(self.capture.shots)?;
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "storage.jpeg_quality must be in 1..=100, got {}",
                self.storage.jpeg_quality
            )));
        }
        if self.storage.extension.is_empty() || self.storage.extension.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "storage.extension must be a bare extension like \"jpg\", got {:?}",
                self.storage.extension
            )));
        }
        if self.balance.gain.is_nan() || self.balance.gain <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "balance.gain must be positive, got {}",
                self.balance.gain
            )));
        }
        if !self.sender.interval_secs.is_finite() || self.sender.interval_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sender.interval_secs must be a finite number >= 0, got {}",
                self.sender.interval_secs
            )));
        }
        Ok(())
    }
}

pub fn validate_shots(shots: u32) -> Result<(), ConfigError> {
    if (1..=MAX_SHOTS).contains(&shots) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "shots must be in 1..={MAX_SHOTS}, got {shots}"
        )))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    80
}
fn default_chunk_size() -> usize {
    64
}
fn default_storage_dir() -> String {
    "img".into()
}
fn default_extension() -> String {
    "jpg".into()
}
fn default_jpeg_quality() -> u8 {
    95
}
fn default_true() -> bool {
    true
}
fn default_gain() -> f64 {
    1.1
}
fn default_shots() -> u32 {
    1
}
fn default_api_port() -> u16 {
    8080
}
fn default_sender_target() -> String {
    "127.0.0.1:80".into()
}
fn default_sender_source() -> String {
    "frames".into()
}
fn default_sender_interval() -> f64 {
    5.0
}
fn default_sender_chunk_size() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".into()
}
