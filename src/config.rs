//! Driver configuration file
//!
//! Lives at `<config dir>/hidpad/config.toml` unless a path is given on the
//! command line. Missing keys take their defaults, so a file holding only
//! `peripheral_address` is complete.

use crate::bluetooth::driver::DEFAULT_CONNECT_DEBOUNCE_MS;
use crate::bluetooth::session::{SessionSettings, DEFAULT_PIN_CODE};
use crate::bluetooth::{PeripheralAddress, DEFAULT_CHANNEL_MTU, PSM_HID_CONTROL, PSM_HID_INTERRUPT};
use crate::gamepad::smoothing::DEFAULT_HYSTERESIS_BAND;
use crate::gamepad::AxisFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "hidpad";
const CONFIG_FILE: &str = "config.toml";

/// Address of the iPega PG-9021 the driver was first written against
pub const DEFAULT_PERIPHERAL_ADDRESS: PeripheralAddress =
    PeripheralAddress::new([0x00, 0x90, 0xE1, 0xD1, 0x9D, 0x96]);

/// BCM pin of the connect push button
pub const DEFAULT_CONNECT_BUTTON_PIN: u8 = 17;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SmoothingSettings {
    pub enabled: bool,
    /// Samples closer than this to center snap back to it while at rest
    pub hysteresis_band: i32,
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hysteresis_band: DEFAULT_HYSTERESIS_BAND,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    pub level: String,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub pretty: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_thread_ids: true,
            with_file: true,
            pretty: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    pub peripheral_address: PeripheralAddress,
    pub pin_code: String,
    pub channel_mtu: u16,
    pub fallback_control_psm: Option<u16>,
    pub fallback_interrupt_psm: Option<u16>,
    pub connect_debounce_ms: i64,
    /// GPIO pin of the connect button; no button when unset
    pub connect_button_pin: Option<u8>,
    /// Recorded session to replay instead of waiting for a live stack
    pub capture: Option<PathBuf>,
    pub smoothing: SmoothingSettings,
    pub logging: LogSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            peripheral_address: DEFAULT_PERIPHERAL_ADDRESS,
            pin_code: DEFAULT_PIN_CODE.to_string(),
            channel_mtu: DEFAULT_CHANNEL_MTU,
            fallback_control_psm: Some(PSM_HID_CONTROL),
            fallback_interrupt_psm: Some(PSM_HID_INTERRUPT),
            connect_debounce_ms: DEFAULT_CONNECT_DEBOUNCE_MS,
            connect_button_pin: Some(DEFAULT_CONNECT_BUTTON_PIN),
            capture: None,
            smoothing: SmoothingSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl DriverConfig {
    /// `<config dir>/hidpad/config.toml`, falling back to the working directory
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {:?}", path);
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Configuration written to {:?}", path);
        Ok(())
    }

    /// Write a default file at `path` unless one exists
    pub async fn ensure_default(path: &Path) -> Result<(), ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            info!("Creating default configuration at {:?}", path);
            Self::default().save(path).await?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_mtu == 0 {
            return Err(ConfigError::Invalid("channel_mtu must be positive".to_string()));
        }
        if self.connect_debounce_ms < 0 {
            return Err(ConfigError::Invalid(
                "connect_debounce_ms must not be negative".to_string(),
            ));
        }
        if self.smoothing.hysteresis_band < 0 {
            return Err(ConfigError::Invalid(
                "smoothing.hysteresis_band must not be negative".to_string(),
            ));
        }
        if self.pin_code.is_empty() || self.pin_code.len() > 16 {
            return Err(ConfigError::Invalid(
                "pin_code must be 1 to 16 characters".to_string(),
            ));
        }
        Ok(())
    }

    pub fn axis_filter(&self) -> AxisFilter {
        AxisFilter::new(self.smoothing.enabled, self.smoothing.hysteresis_band)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            address: self.peripheral_address,
            pin_code: self.pin_code.clone(),
            channel_mtu: self.channel_mtu,
            fallback_control_psm: self.fallback_control_psm,
            fallback_interrupt_psm: self.fallback_interrupt_psm,
            axis_filter: self.axis_filter(),
        }
    }

    pub fn connect_debounce(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.connect_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("hidpad-test-{}-{}", std::process::id(), name));
        path.push(CONFIG_FILE);
        path
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = DriverConfig::from_toml_str(
            r#"
            peripheral_address = "E4:17:D8:3B:0A:F1"

            [smoothing]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.peripheral_address.to_string(), "E4:17:D8:3B:0A:F1");
        assert_eq!(config.pin_code, "0000");
        assert_eq!(config.channel_mtu, 48);
        assert_eq!(config.fallback_control_psm, Some(0x0011));
        assert!(!config.smoothing.enabled);
        assert_eq!(config.smoothing.hysteresis_band, 10);
        assert!(!config.axis_filter().is_enabled());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            DriverConfig::from_toml_str("channel_mtu = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            DriverConfig::from_toml_str("peripheral_address = \"not-an-address\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            DriverConfig::from_toml_str("pin_code = \"\""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_session_settings_follow_config() {
        let config = DriverConfig {
            fallback_interrupt_psm: None,
            channel_mtu: 672,
            ..DriverConfig::default()
        };
        let settings = config.session_settings();
        assert_eq!(settings.address, DEFAULT_PERIPHERAL_ADDRESS);
        assert_eq!(settings.channel_mtu, 672);
        assert_eq!(settings.fallback_interrupt_psm, None);
        assert_eq!(config.connect_debounce().num_milliseconds(), 700);
    }

    #[tokio::test]
    async fn test_ensure_default_writes_loadable_file() {
        let path = scratch_path("default");
        let _ = tokio::fs::remove_file(&path).await;

        DriverConfig::ensure_default(&path).await.unwrap();
        let loaded = DriverConfig::load(&path).await.unwrap();
        assert_eq!(loaded, DriverConfig::default());

        // An existing file is left alone
        let custom = DriverConfig {
            pin_code: "1234".to_string(),
            ..DriverConfig::default()
        };
        custom.save(&path).await.unwrap();
        DriverConfig::ensure_default(&path).await.unwrap();
        assert_eq!(DriverConfig::load(&path).await.unwrap().pin_code, "1234");

        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir_all(parent).await;
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let path = scratch_path("missing");
        assert!(matches!(
            DriverConfig::load(&path).await,
            Err(ConfigError::Io { .. })
        ));
    }
}
