//! Driver configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. `config/xpad.toml` (or the file passed to [`XpadConfig::load_from`])
//! 3. Environment variables prefixed with `XPAD_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use xpad_daq::config::XpadConfig;
//!
//! let config = XpadConfig::load()?;
//! println!("Detector: {}:{}", config.detector.host, config.detector.port);
//! # Ok::<(), xpad_daq::error::XpadError>(())
//! ```

use crate::engine::{CorrectionFlags, TransferMode};
use crate::error::{XpadError, XpadResult};
use crate::frame::PixelDepth;
use crate::logging::OutputFormat;
use crate::protocol::DEFAULT_PORT;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/xpad.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XpadConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Server connection
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Acquisition defaults
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name shown in log output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `compact` or `json`.
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Detector server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// XPAD server host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// XPAD server TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Modules to enable; 0 keeps the server's current mask.
    #[serde(default)]
    pub module_mask: u32,
    /// Connect timeout; 0 waits for the OS.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Acquisition defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// 16 or 32.
    #[serde(default)]
    pub pixel_depth: PixelDepth,
    /// `direct` or `file`.
    #[serde(default)]
    pub image_transfer: TransferMode,
    /// Directory the server writes frame files to.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Frame-file poll interval in milliseconds.
    #[serde(default = "default_file_poll_interval")]
    pub file_poll_interval_ms: u64,
    /// Server file format code.
    #[serde(default = "default_file_format")]
    pub file_format: u16,
    /// Apply geometrical correction.
    #[serde(default = "default_true")]
    pub geometrical_correction: bool,
    /// Apply flat-field correction.
    #[serde(default)]
    pub flat_field_correction: bool,
}

// Default value functions
fn default_name() -> String {
    "xpad-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_output_path() -> PathBuf {
    PathBuf::from(crate::engine::job::DEFAULT_OUTPUT_PATH)
}

fn default_file_poll_interval() -> u64 {
    10
}

fn default_file_format() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            module_mask: 0,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pixel_depth: PixelDepth::default(),
            image_transfer: TransferMode::default(),
            output_path: default_output_path(),
            file_poll_interval_ms: default_file_poll_interval(),
            file_format: default_file_format(),
            geometrical_correction: true,
            flat_field_correction: false,
        }
    }
}

impl DetectorConfig {
    /// `None` disables the handshake timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

impl AcquisitionConfig {
    /// Correction flags for `SetExposureParameters`.
    pub fn corrections(&self) -> CorrectionFlags {
        CorrectionFlags {
            geometrical: self.geometrical_correction,
            flat_field: self.flat_field_correction,
        }
    }

    /// Poll interval, at least 1 ms.
    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms.max(1))
    }
}

impl XpadConfig {
    /// Load configuration from `config/xpad.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `XPAD_`.
    /// Example: `XPAD_DETECTOR__HOST=xpad-server`
    pub fn load() -> XpadResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> XpadResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate().map_err(XpadError::Configuration)?;
        Ok(config)
    }

    /// The layered provider, exposed so callers can merge their own overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("XPAD_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.detector.host.trim().is_empty() {
            return Err("detector.host must not be empty".to_string());
        }

        if self.detector.port == 0 {
            return Err("detector.port must be non-zero".to_string());
        }

        if self.acquisition.image_transfer == TransferMode::File
            && self.acquisition.output_path.as_os_str().is_empty()
        {
            return Err("acquisition.output_path is required for file transfer".to_string());
        }

        Ok(())
    }

    /// Render as TOML, for writing a starting configuration file.
    pub fn to_toml_string(&self) -> XpadResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| XpadError::Configuration(format!("cannot serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = XpadConfig::default();
        assert_eq!(config.detector.port, 3456);
        assert_eq!(config.acquisition.pixel_depth, PixelDepth::Bits16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "xpad.toml",
                r#"
                [application]
                log_level = "debug"

                [detector]
                host = "xpad-server"
                module_mask = 3

                [acquisition]
                pixel_depth = 32
                image_transfer = "file"
                "#,
            )?;
            jail.set_env("XPAD_DETECTOR__PORT", "4000");

            let config = XpadConfig::load_from("xpad.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.detector.host, "xpad-server");
            assert_eq!(config.detector.port, 4000);
            assert_eq!(config.detector.module_mask, 3);
            assert_eq!(config.acquisition.pixel_depth, PixelDepth::Bits32);
            assert_eq!(config.acquisition.image_transfer, TransferMode::File);
            assert!(config.acquisition.geometrical_correction);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = XpadConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config, XpadConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values() {
        let mut config = XpadConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        figment::Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "[acquisition]\npixel_depth = 24\n")?;
            assert!(XpadConfig::load_from("bad.toml").is_err());
            Ok(())
        });
    }

    #[test]
    fn test_toml_rendering_reloads() {
        let rendered = XpadConfig::default().to_toml_string().unwrap();
        let parsed: XpadConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, XpadConfig::default());
    }
}
