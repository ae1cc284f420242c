//! Stack configuration
//!
//! The controller buffer layout and the link policy knobs the engine needs at
//! runtime. Loaded from TOML; every field has a default so a partial file is
//! fine.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StackError};
use crate::gap::LinkRole;

/// Persistent configuration of one stack instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Classic ACL buffers reported by the controller.
    #[serde(default = "default_num_acl_bufs")]
    pub num_acl_bufs: u16,

    /// LE ACL buffers. Zero means LE shares the classic pool.
    #[serde(default)]
    pub num_ble_bufs: u16,

    #[serde(default = "default_acl_data_size")]
    pub acl_data_size: u16,

    #[serde(default = "default_ble_acl_data_size")]
    pub ble_acl_data_size: u16,

    #[serde(default = "default_high_pri_min_xmit_quota")]
    pub high_pri_min_xmit_quota: u16,

    /// Seconds a link without channels is kept before disconnecting.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u16,

    #[serde(default = "default_desired_link_role")]
    pub desired_link_role: LinkRole,

    #[serde(default = "default_true")]
    pub non_flushable_pbf: bool,

    #[serde(default = "default_true")]
    pub controller_supports_role_switch: bool,

    #[serde(default = "default_true")]
    pub controller_supports_hold_mode: bool,

    #[serde(default = "default_true")]
    pub controller_supports_sniff_mode: bool,

    #[serde(default)]
    pub controller_supports_park_mode: bool,

    #[serde(default)]
    pub controller_supports_encryption_pause: bool,

    #[serde(default = "default_true")]
    pub controller_supports_remote_ext_features: bool,
}

const fn default_max_links() -> usize {
    7
}

const fn default_max_channels() -> usize {
    32
}

const fn default_max_clients() -> usize {
    15
}

const fn default_num_acl_bufs() -> u16 {
    8
}

const fn default_acl_data_size() -> u16 {
    1021
}

const fn default_ble_acl_data_size() -> u16 {
    251
}

const fn default_high_pri_min_xmit_quota() -> u16 {
    5
}

const fn default_idle_timeout_secs() -> u16 {
    4
}

const fn default_desired_link_role() -> LinkRole {
    LinkRole::Slave
}

const fn default_true() -> bool {
    true
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_links: default_max_links(),
            max_channels: default_max_channels(),
            max_clients: default_max_clients(),
            num_acl_bufs: default_num_acl_bufs(),
            num_ble_bufs: 0,
            acl_data_size: default_acl_data_size(),
            ble_acl_data_size: default_ble_acl_data_size(),
            high_pri_min_xmit_quota: default_high_pri_min_xmit_quota(),
            idle_timeout_secs: default_idle_timeout_secs(),
            desired_link_role: default_desired_link_role(),
            non_flushable_pbf: true,
            controller_supports_role_switch: true,
            controller_supports_hold_mode: true,
            controller_supports_sniff_mode: true,
            controller_supports_park_mode: false,
            controller_supports_encryption_pause: false,
            controller_supports_remote_ext_features: true,
        }
    }
}

impl StackConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_links == 0 {
            return Err(StackError::InvalidConfig("max_links must be at least 1".into()));
        }
        if self.max_channels == 0 || self.max_channels > 0xFFBF {
            return Err(StackError::InvalidConfig(format!(
                "max_channels out of range: {}",
                self.max_channels
            )));
        }
        if self.max_clients == 0 {
            return Err(StackError::InvalidConfig("max_clients must be at least 1".into()));
        }
        if self.num_acl_bufs == 0 {
            return Err(StackError::InvalidConfig("num_acl_bufs must be at least 1".into()));
        }
        if self.acl_data_size == 0 || self.ble_acl_data_size == 0 {
            return Err(StackError::InvalidConfig("ACL data sizes must be non-zero".into()));
        }
        if self.high_pri_min_xmit_quota == 0 {
            return Err(StackError::InvalidConfig(
                "high_pri_min_xmit_quota must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn controller_info(&self) -> ControllerInfo {
        ControllerInfo::from(self)
    }
}

/// Runtime view of the controller, consulted by flow control and the ACL
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInfo {
    pub num_acl_bufs: u16,
    pub num_ble_bufs: u16,
    pub acl_data_size: u16,
    pub ble_acl_data_size: u16,
    pub high_pri_min_xmit_quota: u16,
    pub non_flushable_pbf: bool,
    pub supports_role_switch: bool,
    pub supports_hold_mode: bool,
    pub supports_sniff_mode: bool,
    pub supports_park_mode: bool,
    pub supports_encryption_pause: bool,
    pub supports_remote_ext_features: bool,
}

impl ControllerInfo {
    /// LE links draw from the classic pool when the controller has no
    /// dedicated LE buffers.
    pub fn ble_shares_acl_bufs(&self) -> bool {
        self.num_ble_bufs == 0
    }
}

impl From<&StackConfig> for ControllerInfo {
    fn from(config: &StackConfig) -> Self {
        Self {
            num_acl_bufs: config.num_acl_bufs,
            num_ble_bufs: config.num_ble_bufs,
            acl_data_size: config.acl_data_size,
            ble_acl_data_size: config.ble_acl_data_size,
            high_pri_min_xmit_quota: config.high_pri_min_xmit_quota,
            non_flushable_pbf: config.non_flushable_pbf,
            supports_role_switch: config.controller_supports_role_switch,
            supports_hold_mode: config.controller_supports_hold_mode,
            supports_sniff_mode: config.controller_supports_sniff_mode,
            supports_park_mode: config.controller_supports_park_mode,
            supports_encryption_pause: config.controller_supports_encryption_pause,
            supports_remote_ext_features: config.controller_supports_remote_ext_features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = StackConfig::from_toml_str("").unwrap();
        assert_eq!(config, StackConfig::default());
        assert_eq!(config.max_links, 7);
        assert_eq!(config.max_channels, 32);
        assert_eq!(config.idle_timeout_secs, 4);
        assert_eq!(config.desired_link_role, LinkRole::Slave);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = StackConfig::from_toml_str(
            "num_acl_bufs = 3\ndesired_link_role = \"master\"\n",
        )
        .unwrap();
        assert_eq!(config.num_acl_bufs, 3);
        assert_eq!(config.desired_link_role, LinkRole::Master);
        assert_eq!(config.acl_data_size, 1021);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack").join("config.toml");

        let mut config = StackConfig::default();
        config.num_ble_bufs = 4;
        config.controller_supports_encryption_pause = true;
        config.save(&path).unwrap();

        let loaded = StackConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = StackConfig::from_toml_str("num_acl_bufs = 0").unwrap_err();
        assert!(matches!(err, StackError::InvalidConfig(_)));

        let err = StackConfig::from_toml_str("max_links = 0").unwrap_err();
        assert!(matches!(err, StackError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = StackConfig::from_toml_str("max_links = [").unwrap_err();
        assert!(matches!(err, StackError::TomlParse(_)));
    }

    #[test]
    fn test_controller_info_sharing() {
        let info = StackConfig::default().controller_info();
        assert!(info.ble_shares_acl_bufs());
        assert_eq!(info.num_acl_bufs, 8);
    }
}
