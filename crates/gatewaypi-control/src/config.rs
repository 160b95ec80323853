//! Control Plane Configuration

use crate::entitlement::Plan;
use crate::error::{ControlError, Result};
use crate::forwards::Protocol;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Public address of the VPS, embedded in install artifacts
    pub vps_address: String,
    /// Installer script fetched by the gateway bootstrap command
    pub install_script_url: String,
    /// Private pool tunnel subnets are carved from (/24 each)
    pub tunnel_pool: Ipv4Network,
    /// Heartbeat age after which a gateway counts as disconnected
    pub stale_after_secs: u64,
    /// Liveness sweep interval
    pub liveness_interval_secs: u64,
    /// License refresh interval
    pub license_refresh_secs: u64,
    /// License cache file, none disables persistence
    pub license_cache_path: Option<PathBuf>,
    /// Timeout for billing provider and tunnel transport calls
    pub external_timeout_ms: u64,
    /// Ports that can never be forwarded
    pub reserved_ports: Vec<ReservedPort>,
    /// Entitlement provider selection
    pub backend: BackendConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            vps_address: "127.0.0.1".into(),
            install_script_url: "https://install.gatewaypi.com/install.sh".into(),
            tunnel_pool: Ipv4Network::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 16)
                .expect("static pool prefix is valid"),
            stale_after_secs: 120,
            liveness_interval_secs: 30,
            license_refresh_secs: 3600,
            license_cache_path: None,
            external_timeout_ms: 5000,
            reserved_ports: vec![ReservedPort {
                port: 51820,
                protocol: Protocol::Udp,
            }],
            backend: BackendConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Load from file
    pub fn load(path: &str) -> std::result::Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.tunnel_pool.prefix() > 24 {
            return Err(ControlError::Config(format!(
                "tunnel pool {} is smaller than a /24",
                self.tunnel_pool
            )));
        }
        if self.external_timeout_ms == 0 {
            return Err(ControlError::Config("external_timeout_ms must be > 0".into()));
        }
        if self.stale_after_secs == 0 || self.liveness_interval_secs == 0 {
            return Err(ControlError::Config("liveness intervals must be > 0".into()));
        }
        if self.vps_address.trim().is_empty() {
            return Err(ControlError::Config("vps_address is empty".into()));
        }
        Ok(())
    }

    /// Timeout applied to every external collaborator call
    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    /// Heartbeat staleness threshold
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// A (port, protocol) pair owned by the VPS itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPort {
    pub port: u16,
    pub protocol: Protocol,
}

/// Entitlement provider backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process provider with a fixed set of accounts
    Simulated {
        #[serde(default)]
        accounts: Vec<SimulatedAccount>,
    },
    /// Billing provider reached over HTTPS
    Live {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Simulated { accounts: Vec::new() }
    }
}

/// Account served by the simulated backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedAccount {
    pub customer: String,
    pub plan: Plan,
    #[serde(default = "default_valid_days")]
    pub valid_days: i64,
}

fn default_valid_days() -> i64 {
    365
}
