//! Fleet Status Aggregator

use crate::forwards::Protocol;
use crate::gateway::Gateway;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// VPS resource usage as reported by the metrics monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpsMetrics {
    pub uptime_secs: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_inbound: u64,
    pub network_outbound: u64,
    pub active_connections: u64,
}

/// Link state of a VPS interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

/// Network interface on the VPS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Option<IpAddr>,
    pub netmask: Option<IpAddr>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    pub status: LinkState,
    /// Link speed, none for virtual interfaces
    #[serde(default)]
    pub speed_mbps: Option<u32>,
}

/// Run state of a VPS service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
}

/// Service listening on the VPS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkService {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    pub status: ServiceState,
}

/// Connectivity of one gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub id: String,
    pub name: String,
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Fleet snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub vps: VpsMetrics,
    /// When the monitor last reported, none before the first report
    pub metrics_reported_at: Option<DateTime<Utc>>,
    pub control_plane_uptime_secs: u64,
    pub gateways: Vec<GatewayStatus>,
    pub connected_gateways: usize,
    pub total_gateways: usize,
    pub generated_at: DateTime<Utc>,
}

/// Latest VPS metrics, network inventory and control-plane uptime
pub struct StatusAggregator {
    latest: RwLock<Option<(VpsMetrics, DateTime<Utc>)>>,
    interfaces: RwLock<Vec<NetworkInterface>>,
    services: RwLock<Vec<NetworkService>>,
    started: Instant,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(None),
            interfaces: RwLock::new(Vec::new()),
            services: RwLock::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn update(&self, metrics: VpsMetrics) {
        *self.latest.write() = Some((metrics, Utc::now()));
    }

    /// Replace the reported interface list
    pub fn update_interfaces(&self, mut interfaces: Vec<NetworkInterface>) {
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        *self.interfaces.write() = interfaces;
    }

    /// Replace the reported service list
    pub fn update_services(&self, mut services: Vec<NetworkService>) {
        services.sort_by_key(|s| (s.port, s.protocol.to_string()));
        *self.services.write() = services;
    }

    /// Interfaces as last reported, by name
    pub fn interfaces(&self) -> Vec<NetworkInterface> {
        self.interfaces.read().clone()
    }

    /// Services as last reported, by port
    pub fn services(&self) -> Vec<NetworkService> {
        self.services.read().clone()
    }

    pub fn snapshot(&self, gateways: &[Gateway]) -> FleetStatus {
        let (vps, metrics_reported_at) = match self.latest.read().clone() {
            Some((metrics, at)) => (metrics, Some(at)),
            None => (VpsMetrics::default(), None),
        };

        let gateways: Vec<GatewayStatus> = gateways
            .iter()
            .map(|g| GatewayStatus {
                id: g.id.clone(),
                name: g.name.clone(),
                connected: g.connected,
                last_seen: g.last_seen,
            })
            .collect();

        FleetStatus {
            vps,
            metrics_reported_at,
            control_plane_uptime_secs: self.started.elapsed().as_secs(),
            connected_gateways: gateways.iter().filter(|g| g.connected).count(),
            total_gateways: gateways.len(),
            gateways,
            generated_at: Utc::now(),
        }
    }
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}
