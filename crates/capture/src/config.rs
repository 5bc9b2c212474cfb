//! Capture configuration management

use crate::usb::{ErrorPolicy, TargetIdentity};
use anyhow::{Context, Result, anyhow};
use protocol::{Marker, MarkerCheck};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Black Magic Probe USB vendor ID (OpenMoko)
pub const DEFAULT_VENDOR_ID: u16 = 0x1d50;
/// Black Magic Probe product ID
pub const DEFAULT_PRODUCT_ID: u16 = 0x6018;
/// Trace capture interface number
pub const DEFAULT_INTERFACE: u8 = 5;
/// Trace capture bulk IN endpoint
pub const DEFAULT_ENDPOINT: u8 = 0x85;
/// Largest single bulk read
pub const DEFAULT_MAX_TRANSFER_LEN: usize = 128;
/// Upper bound accepted for `max_transfer_len`
pub const MAX_TRANSFER_LEN_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub decoder: DecoderSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which device to capture from and how to talk to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB vendor ID, hex string (e.g. "0x1d50")
    #[serde(default = "DeviceSettings::default_vendor_id", with = "hex_id")]
    pub vendor_id: u16,
    /// USB product ID, hex string (e.g. "0x6018")
    #[serde(default = "DeviceSettings::default_product_id", with = "hex_id")]
    pub product_id: u16,
    /// Interface carrying the trace endpoint
    #[serde(default = "DeviceSettings::default_interface")]
    pub interface: u8,
    /// Bulk IN endpoint address, hex string (e.g. "0x85")
    #[serde(default = "DeviceSettings::default_endpoint", with = "hex_id")]
    pub endpoint: u8,
    /// Read buffer size in bytes
    #[serde(default = "DeviceSettings::default_max_transfer_len")]
    pub max_transfer_len: usize,
    /// Detach an active kernel driver from the interface before claiming it
    #[serde(default = "DeviceSettings::default_detach_kernel_driver")]
    pub detach_kernel_driver: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            interface: Self::default_interface(),
            endpoint: Self::default_endpoint(),
            max_transfer_len: Self::default_max_transfer_len(),
            detach_kernel_driver: Self::default_detach_kernel_driver(),
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> u16 {
        DEFAULT_VENDOR_ID
    }

    fn default_product_id() -> u16 {
        DEFAULT_PRODUCT_ID
    }

    fn default_interface() -> u8 {
        DEFAULT_INTERFACE
    }

    fn default_endpoint() -> u8 {
        DEFAULT_ENDPOINT
    }

    fn default_max_transfer_len() -> usize {
        DEFAULT_MAX_TRANSFER_LEN
    }

    fn default_detach_kernel_driver() -> bool {
        true
    }
}

/// Frame decoding options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecoderSettings {
    /// Frame marker bytes
    #[serde(default)]
    pub marker: Marker,
    /// "either" accepts a frame when one marker byte matches, "both" needs an
    /// exact marker
    #[serde(default)]
    pub marker_check: MarkerCheck,
}

/// Retry and read behaviour of the capture loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Wait between discovery attempts and after losing the device
    #[serde(default = "SessionSettings::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Bulk read timeout; 0 blocks until data arrives.
    ///
    /// A non-zero value lets Ctrl+C interrupt an idle read, but libusb drops
    /// any partially received data when a read times out.
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Consecutive failed reads tolerated before pausing for one retry interval
    #[serde(default = "SessionSettings::default_max_consecutive_transfer_errors")]
    pub max_consecutive_transfer_errors: u32,
    /// Exit when the probe is present but cannot be opened or claimed
    #[serde(default = "SessionSettings::default_exit_on_open_error")]
    pub exit_on_open_error: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: Self::default_retry_interval_ms(),
            read_timeout_ms: 0,
            max_consecutive_transfer_errors: Self::default_max_consecutive_transfer_errors(),
            exit_on_open_error: Self::default_exit_on_open_error(),
        }
    }
}

impl SessionSettings {
    fn default_retry_interval_ms() -> u64 {
        1000
    }

    fn default_max_consecutive_transfer_errors() -> u32 {
        16
    }

    fn default_exit_on_open_error() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Serde helpers for USB IDs written as hex strings
mod hex_id {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Copy + Into<u32>,
    {
        let width = 2 + 2 * std::mem::size_of::<T>();
        let value: u32 = (*value).into();
        serializer.serialize_str(&format!("{:#0width$x}", value, width = width))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<u32>,
    {
        let s = String::deserialize(deserializer)?;
        let value = super::parse_hex(&s).map_err(D::Error::custom)?;
        T::try_from(value).map_err(|_| D::Error::custom(format!("'{}' is out of range", s)))
    }
}

/// Parse a hex number with or without a `0x` prefix
pub fn parse_hex(s: &str) -> std::result::Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    if digits.is_empty() {
        return Err(format!("'{}' is not a valid hex number", s));
    }

    u32::from_str_radix(digits, 16).map_err(|_| format!("'{}' is not a valid hex number", s))
}

impl CaptureConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path the first existing file among
    /// [`candidate_paths`](Self::candidate_paths) is used.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CaptureConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a user-supplied path, expanding `~`
    pub fn load_from(path: &str) -> Result<Self> {
        let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
        Self::load(Some(path_buf))
    }

    /// Load the first configuration file found in the standard locations,
    /// or return defaults if there is none
    ///
    /// A file that exists but cannot be read, parsed or validated is an error.
    pub fn load_or_default() -> Result<Self> {
        Self::load_first_or_default(Self::candidate_paths())
    }

    /// Same as [`load_or_default`](Self::load_or_default) over an explicit
    /// list of locations, tried in order
    pub fn load_first_or_default<I>(candidates: I) -> Result<Self>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        match candidates.into_iter().find(|p| p.exists()) {
            Some(path) => Self::load(Some(path)),
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Standard configuration file locations, in lookup order
    pub fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/bmp-traceswo/config.toml"),
        ]
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("bmp-traceswo").join("config.toml")
        } else {
            PathBuf::from(".config/bmp-traceswo/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.device.endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "Endpoint {:#04x} is not an IN endpoint (bit 7 must be set)",
                self.device.endpoint
            ));
        }

        if self.device.max_transfer_len == 0
            || self.device.max_transfer_len > MAX_TRANSFER_LEN_LIMIT
        {
            return Err(anyhow!(
                "max_transfer_len must be between 1 and {}",
                MAX_TRANSFER_LEN_LIMIT
            ));
        }

        if self.session.retry_interval_ms == 0 {
            return Err(anyhow!("retry_interval_ms must be greater than 0"));
        }

        if self.session.max_consecutive_transfer_errors == 0 {
            return Err(anyhow!("max_consecutive_transfer_errors must be at least 1"));
        }

        Ok(())
    }

    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(self.device.vendor_id, self.device.product_id)
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy {
            exit_on_open_error: self.session.exit_on_open_error,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.session.retry_interval_ms)
    }

    /// Bulk read timeout; zero means wait forever
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.session.read_timeout_ms)
    }
}
