//! Host configuration
//!
//! Configuration is a plain TOML document. Every field has a default so an
//! empty document (or [`HostConfig::default`]) yields a working host:
//!
//! ```toml
//! id_max = 2
//! adv_set_max = 4
//! privacy = true
//! rpa_timeout_secs = 900
//! device_name = "sensor"
//! ```

use crate::error::{HciError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Largest buffer the controller can deliver in a single periodic report chain
pub const PER_ADV_SYNC_BUF_SIZE_MAX: usize = 1650;

/// Tunables for the host core
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum number of local identities
    pub id_max: usize,
    /// Maximum number of advertising sets
    pub adv_set_max: usize,
    /// Maximum number of periodic advertising sync objects
    pub per_adv_sync_max: usize,
    /// Reassembly buffer size for periodic advertising reports (0 disables reassembly)
    pub per_adv_sync_buf_size: usize,
    /// Maximum number of simultaneous connections
    pub max_connections: usize,
    /// Upper bound on a blocking command round trip, in milliseconds
    pub command_timeout_ms: u64,
    /// Resolvable private address rotation period, in seconds
    pub rpa_timeout_secs: u64,
    /// Advertise with resolvable private addresses instead of identity addresses
    pub privacy: bool,
    /// Use the BR/EDR part of the controller when it supports it
    pub bredr: bool,
    /// Query vendor extension commands during bring-up
    pub vendor_extensions: bool,
    /// Default device name, used when none was loaded from storage
    pub device_name: String,
    /// Largest frame accepted by the H4 stream decoder
    pub max_frame_len: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            id_max: 1,
            adv_set_max: 1,
            per_adv_sync_max: 1,
            per_adv_sync_buf_size: 0,
            max_connections: 1,
            command_timeout_ms: 10_000,
            rpa_timeout_secs: 900,
            privacy: false,
            bredr: false,
            vendor_extensions: false,
            device_name: "bluehci".to_string(),
            max_frame_len: 1024 + 4,
        }
    }
}

impl HostConfig {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: HostConfig =
            toml::from_str(text).map_err(|e| HciError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| HciError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Check that the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.id_max == 0 {
            return Err(HciError::Config("id_max must be at least 1".into()));
        }
        if self.adv_set_max == 0 || self.adv_set_max > 0xEF {
            return Err(HciError::Config(format!(
                "adv_set_max must be in 1..=239, got {}",
                self.adv_set_max
            )));
        }
        if self.per_adv_sync_buf_size > PER_ADV_SYNC_BUF_SIZE_MAX {
            return Err(HciError::Config(format!(
                "per_adv_sync_buf_size exceeds {}",
                PER_ADV_SYNC_BUF_SIZE_MAX
            )));
        }
        if self.command_timeout_ms == 0 {
            return Err(HciError::Config("command_timeout_ms must be non-zero".into()));
        }
        if !(1..=3600).contains(&self.rpa_timeout_secs) {
            return Err(HciError::Config(
                "rpa_timeout_secs must be in 1..=3600".into(),
            ));
        }
        if self.device_name.len() > 248 {
            return Err(HciError::Config("device_name longer than 248 bytes".into()));
        }
        if self.max_frame_len < 4 {
            return Err(HciError::Config("max_frame_len too small".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn rpa_timeout(&self) -> Duration {
        Duration::from_secs(self.rpa_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config.id_max, 1);
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert!(!config.privacy);
    }

    #[test]
    fn test_overrides_and_validation() {
        let config = HostConfig::from_toml_str(
            "adv_set_max = 4\nprivacy = true\nper_adv_sync_buf_size = 64\n",
        )
        .unwrap();
        assert_eq!(config.adv_set_max, 4);
        assert!(config.privacy);
        assert_eq!(config.per_adv_sync_buf_size, 64);

        assert!(matches!(
            HostConfig::from_toml_str("adv_set_max = 0"),
            Err(HciError::Config(_))
        ));
        assert!(matches!(
            HostConfig::from_toml_str("per_adv_sync_buf_size = 5000"),
            Err(HciError::Config(_))
        ));
        assert!(matches!(
            HostConfig::from_toml_str("id_max = \"two\""),
            Err(HciError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device_name = \"beacon\"\nmax_connections = 3").unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        assert_eq!(config.device_name, "beacon");
        assert_eq!(config.max_connections, 3);

        assert!(HostConfig::load("/nonexistent/bluehci.toml").is_err());
    }
}
