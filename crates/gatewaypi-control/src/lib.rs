//! GatewayPi Control Plane
//!
//! License-gated management of a small gateway fleet sitting behind a VPS.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          CONTROL PLANE                           │
//! │                                                                  │
//! │   ┌──────────────────────────────────────────────────────────┐   │
//! │   │                   ENTITLEMENT STORE                      │   │
//! │   │   License | Quota | Features | Cache | Billing provider  │   │
//! │   └──────────────────────────┬───────────────────────────────┘   │
//! │                              │ mediates every mutation           │
//! │   ┌──────────────────────────▼───────────────────────────────┐   │
//! │   │                   GATEWAY REGISTRY                       │   │
//! │   │   Identity | Connectivity | Tunnel keys | /24 subnets    │   │
//! │   └───────┬──────────────────┬──────────────────┬────────────┘   │
//! │           │ cascade          │                  │                │
//! │   ┌───────▼──────┐   ┌───────▼──────┐   ┌───────▼──────────┐     │
//! │   │ ROUTE TABLE  │   │   DNS ZONE   │   │ PORT FORWARDS    │     │
//! │   └──────────────┘   └──────────────┘   └──────────────────┘     │
//! │                                                                  │
//! │   Telemetry ingest ──► heartbeats, counters, health, metrics     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each table owns its state behind one `RwLock`. Operations touching more
//! than one table lock in the order gateways, routes, dns, forwards.

pub mod config;
pub mod dns;
pub mod entitlement;
pub mod error;
pub mod forwards;
pub mod gateway;
pub mod monitor;
pub mod routes;
pub mod status;
pub mod subnet;
pub mod telemetry;
pub mod tunnel;

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{info, warn};

pub use config::ControlConfig;
pub use dns::{DnsRecord, DnsRecordSpec, DnsStats, DnsZone};
pub use entitlement::{
    EntitlementProvider, EntitlementStore, Feature, License, LicenseInfo, Plan, RefreshOutcome,
    ResourceKind,
};
pub use error::{ControlError, Result};
pub use forwards::{ForwardStatus, PortForward, PortForwardSpec, PortForwardTable, Protocol};
pub use gateway::{Gateway, GatewayRegistry, GatewaySpec};
pub use routes::{LoadBalancing, Route, RouteSpec, RouteTable, TargetLease};
pub use status::{
    FleetStatus, LinkState, NetworkInterface, NetworkService, ServiceState, StatusAggregator,
    VpsMetrics,
};
pub use telemetry::{TelemetryEvent, TelemetrySender};
pub use tunnel::{
    DiscoveredDevice, InstallArtifact, LoggingTransport, NetworkScan, PeerProvision,
    TunnelTransport,
};

/// What a gateway removal took with it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRemoval {
    pub gateway: Gateway,
    pub route_targets_removed: usize,
    pub routes_removed: Vec<String>,
    pub dns_records_removed: Vec<String>,
    pub port_forwards_removed: Vec<String>,
}

/// Main control plane
pub struct ControlPlane {
    config: ControlConfig,
    /// Entitlement store
    pub entitlements: EntitlementStore,
    /// Gateway registry
    pub gateways: GatewayRegistry,
    /// Route table
    pub routes: RouteTable,
    /// DNS zone
    pub dns: DnsZone,
    /// Port forward table
    pub forwards: PortForwardTable,
    /// Fleet status aggregator
    pub status: StatusAggregator,
    transport: Arc<dyn TunnelTransport>,
    /// Serializes install artifact issuance across the transport call
    issue_lock: tokio::sync::Mutex<()>,
}

impl ControlPlane {
    /// Build from configuration with the configured billing backend
    pub fn new(config: ControlConfig) -> Result<Self> {
        config.validate()?;
        let provider = entitlement::build_provider(&config.backend, config.external_timeout())?;
        Self::with_components(config, provider, Arc::new(LoggingTransport))
    }

    /// Build with explicit collaborators
    pub fn with_components(
        config: ControlConfig,
        provider: Arc<dyn EntitlementProvider>,
        transport: Arc<dyn TunnelTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = config
            .license_cache_path
            .as_ref()
            .map(|path| entitlement::LicenseCache::new(path.clone()));

        Ok(Self {
            entitlements: EntitlementStore::new(provider, cache, config.external_timeout()),
            gateways: GatewayRegistry::new(config.tunnel_pool)?,
            routes: RouteTable::new(),
            dns: DnsZone::new(),
            forwards: PortForwardTable::new(config.reserved_ports.clone()),
            status: StatusAggregator::new(),
            transport,
            issue_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Restore the cached license, if any
    pub fn init(&self) -> Option<License> {
        let restored = self.entitlements.restore();
        if restored.is_none() {
            info!("No cached license, mutations are denied until activation");
        }
        restored
    }

    // === License ===

    /// License with `gatewaysUsed` taken from the live registry
    pub fn license_info(&self) -> Option<LicenseInfo> {
        self.entitlements.license_info(self.gateways.count())
    }

    /// Validate `customer` with the billing provider
    pub async fn activate(&self, customer: &str) -> Result<LicenseInfo> {
        let customer = customer.trim();
        if customer.is_empty() {
            return Err(ControlError::InvalidInput("customer is required".into()));
        }
        self.entitlements.refresh(customer).await?;
        self.license_info()
            .ok_or_else(|| ControlError::LicenseInactive("no license activated".into()))
    }

    pub fn deactivate(&self) -> Result<()> {
        self.entitlements.deactivate()
    }

    pub async fn portal_link(&self) -> Result<Option<String>> {
        self.entitlements.customer_portal_link().await
    }

    // === Gateways ===

    pub fn register_gateway(&self, spec: GatewaySpec) -> Result<Gateway> {
        self.gateways.register(&self.entitlements, spec)
    }

    /// Issue an install artifact, rotating the tunnel key after the first issue.
    ///
    /// The new peer is handed to the tunnel transport before anything is
    /// committed; a transport failure leaves the previous key valid. Issues
    /// run one at a time, so the peer the transport saw last is always the
    /// committed one.
    pub async fn issue_install_artifact(&self, gateway_id: &str) -> Result<InstallArtifact> {
        self.entitlements.ensure_active()?;
        let _issuing = self.issue_lock.lock().await;

        let issue = self.gateways.prepare_key(gateway_id)?;
        let peer = PeerProvision {
            gateway_id: issue.gateway_id.clone(),
            public_key: issue.keys.public_key.clone(),
            tunnel_subnet: issue.tunnel_subnet,
            tunnel_address: issue.tunnel_address,
        };

        let provisioned = self
            .call_transport("provisioning", gateway_id, self.transport.provision_peer(&peer))
            .await;
        if let Err(e) = provisioned {
            self.gateways.abandon_key(issue);
            return Err(e);
        }

        if let Err(e) = self.gateways.commit_key(&issue) {
            if matches!(e, ControlError::NotFound(_)) {
                // Removed while the transport was busy
                self.revoke_peer(gateway_id).await;
            }
            return Err(e);
        }

        Ok(InstallArtifact::new(
            &issue.gateway_id,
            &self.config.vps_address,
            &self.config.install_script_url,
            &issue.keys.private_key,
            issue.tunnel_subnet,
            self.gateways.hub_address(),
        ))
    }

    /// Heartbeat from a gateway
    pub fn heartbeat(&self, gateway_id: &str, source_ip: IpAddr) -> Result<()> {
        self.gateways.mark_seen(gateway_id, source_ip, Utc::now())
    }

    /// Disconnect gateways past the staleness threshold
    pub fn sweep_stale(&self) -> Vec<String> {
        self.gateways.mark_stale(self.config.stale_after(), Utc::now())
    }

    /// Remove a gateway and everything bound to it
    pub async fn remove_gateway(&self, gateway_id: &str) -> Result<GatewayRemoval> {
        self.entitlements.ensure_active()?;

        let mut routes = routes::RoutePurge::default();
        let mut dns_records_removed = Vec::new();
        let mut port_forwards_removed = Vec::new();
        let gateway = self.gateways.remove_with(gateway_id, |gw| {
            routes = self.routes.purge_gateway(&gw.id);
            dns_records_removed = self.dns.purge_gateway(&gw.id);
            port_forwards_removed = self.forwards.purge_gateway(&gw.id);
        })?;

        self.revoke_peer(gateway_id).await;

        Ok(GatewayRemoval {
            gateway,
            route_targets_removed: routes.targets_removed,
            routes_removed: routes.routes_removed,
            dns_records_removed,
            port_forwards_removed,
        })
    }

    /// Run a transport request under the external timeout
    async fn call_transport<T, F>(&self, action: &str, gateway_id: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.external_timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("Tunnel transport failed {} {}: {}", action, gateway_id, e);
                Err(match e {
                    ControlError::ExternalUnavailable(_) => e,
                    other => ControlError::ExternalUnavailable(format!("tunnel transport: {}", other)),
                })
            }
            Err(_) => {
                warn!("Tunnel transport timed out {} {}", action, gateway_id);
                Err(ControlError::ExternalUnavailable("tunnel transport timed out".into()))
            }
        }
    }

    async fn revoke_peer(&self, gateway_id: &str) {
        let call = self.transport.revoke_peer(gateway_id);
        match tokio::time::timeout(self.config.external_timeout(), call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to revoke tunnel peer {}: {}", gateway_id, e),
            Err(_) => warn!("Tunnel transport timed out revoking {}", gateway_id),
        }
    }

    // === Routes ===

    pub fn add_route(&self, spec: RouteSpec) -> Result<Route> {
        let gateway_ids: Vec<String> = spec.gateway_ids().into_iter().map(String::from).collect();
        let refs: Vec<&str> = gateway_ids.iter().map(String::as_str).collect();
        self.gateways
            .with_existing(&refs, || self.routes.add_route(&self.entitlements, spec))
    }

    pub fn remove_route(&self, path: &str) -> Result<Route> {
        self.routes.remove_route(&self.entitlements, path)
    }

    pub fn set_route_enabled(&self, path: &str, enabled: bool) -> Result<Route> {
        self.routes.set_route_enabled(&self.entitlements, path, enabled)
    }

    // === DNS ===

    pub fn upsert_dns_record(&self, spec: DnsRecordSpec) -> Result<DnsRecord> {
        let gateway_id = spec.gateway_id.clone();
        let refs: Vec<&str> = gateway_id.as_deref().into_iter().collect();
        self.gateways
            .with_existing(&refs, || self.dns.upsert_record(&self.entitlements, spec))
    }

    pub fn remove_dns_record(&self, hostname: &str) -> Result<DnsRecord> {
        self.dns.remove_record(&self.entitlements, hostname)
    }

    // === Port forwards ===

    pub fn add_port_forward(&self, spec: PortForwardSpec) -> Result<PortForward> {
        let gateway_id = spec.gateway_id.clone();
        self.gateways.with_existing(&[gateway_id.as_str()], || {
            self.forwards.add_forward(&self.entitlements, spec)
        })
    }

    pub fn toggle_port_forward(&self, id: &str, enabled: bool) -> Result<PortForward> {
        self.forwards.toggle(&self.entitlements, id, enabled)
    }

    pub fn remove_port_forward(&self, id: &str) -> Result<PortForward> {
        self.forwards.remove(&self.entitlements, id)
    }

    // === Status ===

    pub fn fleet_snapshot(&self) -> FleetStatus {
        self.status.snapshot(&self.gateways.list())
    }

    // === Network ===

    /// Reported VPS interfaces; the tunnel interface is always listed
    pub fn network_interfaces(&self) -> Vec<NetworkInterface> {
        let mut interfaces = self.status.interfaces();
        if !interfaces.iter().any(|i| i.name == tunnel::TUNNEL_INTERFACE) {
            interfaces.push(NetworkInterface {
                name: tunnel::TUNNEL_INTERFACE.into(),
                ip: Some(IpAddr::V4(self.gateways.hub_address())),
                netmask: Some(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0))),
                gateway: None,
                status: LinkState::Unknown,
                speed_mbps: None,
            });
        }
        interfaces
    }

    pub fn network_services(&self) -> Vec<NetworkService> {
        self.status.services()
    }

    /// Discover devices on the LAN behind a connected gateway
    pub async fn scan_network(&self, gateway_id: &str) -> Result<NetworkScan> {
        self.entitlements.ensure_active()?;
        self.entitlements.ensure_feature(Feature::NetworkMonitoring)?;

        let gateway = self
            .gateways
            .get(gateway_id)
            .ok_or_else(|| ControlError::NotFound(format!("gateway {}", gateway_id)))?;
        if !gateway.connected {
            return Err(ControlError::ExternalUnavailable(format!(
                "gateway {} is not connected",
                gateway_id
            )));
        }

        let devices = self
            .call_transport("scanning", gateway_id, self.transport.scan_network(gateway_id))
            .await?;
        info!("Network scan via {} found {} devices", gateway_id, devices.len());
        Ok(NetworkScan::new(gateway_id, devices))
    }
}
