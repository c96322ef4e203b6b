//! Agent configuration.
//!
//! Loaded from `~/.config/guestnet/config.json` (for root: `/root/.config/...`).
//! A missing file means defaults; a malformed file is reported and defaults are used.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::system::dhcp::DEFAULT_DHCP_CLIENT;
use crate::system::firewall::WIRESERVER_ADDRESS;
use crate::system::route::ROUTE_TABLE_PATH;

/// Persisted agent settings.
///
/// Every field has a serde default so that adding new fields later
/// doesn't break old config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address of the wireserver endpoint the firewall protects.
    #[serde(default = "default_wireserver")]
    pub wireserver_address: Ipv4Addr,

    #[serde(default = "default_true")]
    pub firewall_enabled: bool,

    /// Remove older copies of the firewall rules before re-appending them.
    #[serde(default)]
    pub firewall_purge_stale: bool,

    #[serde(default = "default_period")]
    pub firewall_period_secs: u64,

    #[serde(default = "default_iptables")]
    pub iptables_command: String,

    #[serde(default = "default_true")]
    pub dhcp_monitor_enabled: bool,

    /// Process name passed to `pidof`.
    #[serde(default = "default_dhcp_client")]
    pub dhcp_client_name: String,

    #[serde(default = "default_period")]
    pub dhcp_poll_period_secs: u64,

    #[serde(default = "default_route_table")]
    pub route_table_path: PathBuf,

    /// Upper bound for any single OS command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// How often the agent loop wakes up to check the schedules.
    #[serde(default = "default_tick")]
    pub tick_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_wireserver() -> Ipv4Addr {
    WIRESERVER_ADDRESS
}

fn default_period() -> u64 {
    30
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_dhcp_client() -> String {
    DEFAULT_DHCP_CLIENT.to_string()
}

fn default_route_table() -> PathBuf {
    PathBuf::from(ROUTE_TABLE_PATH)
}

fn default_command_timeout() -> u64 {
    30
}

fn default_tick() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wireserver_address: default_wireserver(),
            firewall_enabled: true,
            firewall_purge_stale: false,
            firewall_period_secs: default_period(),
            iptables_command: default_iptables(),
            dhcp_monitor_enabled: true,
            dhcp_client_name: default_dhcp_client(),
            dhcp_poll_period_secs: default_period(),
            route_table_path: default_route_table(),
            command_timeout_secs: default_command_timeout(),
            tick_interval_secs: default_tick(),
        }
    }
}

impl Config {
    /// Config file path: `~/.config/guestnet/config.json`.
    ///
    /// Returns `None` if the home/config directory can't be determined.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("guestnet").join("config.json"))
    }

    /// Load config from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from `path`, falling back to defaults on any error.
    pub fn load_from(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to `path`, creating parent directories if needed.
    pub fn save_to(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::GuestNetError::ParseError(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn firewall_period(&self) -> Duration {
        Duration::from_secs(self.firewall_period_secs)
    }

    pub fn dhcp_poll_period(&self) -> Duration {
        Duration::from_secs(self.dhcp_poll_period_secs)
    }

    /// At least one second; a zero timeout would fail every command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        // A zero interval would make tokio::time::interval panic.
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}
