//! Telemetry ingestion
//!
//! Heartbeats, traffic counters, VPS metrics and network inventory, target
//! health and resolver outcomes reach the control plane as [`TelemetryEvent`]s on a bounded
//! channel. One ingest task applies them in arrival order. Telemetry is
//! never license-gated.

use crate::error::{ControlError, Result};
use crate::forwards::ForwardCounters;
use crate::status::{NetworkInterface, NetworkService, VpsMetrics};
use crate::ControlPlane;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event pushed by a monitoring collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Heartbeat {
        gateway_id: String,
        source_ip: IpAddr,
        at: DateTime<Utc>,
    },
    ForwardTraffic {
        forward_id: String,
        counters: ForwardCounters,
    },
    VpsMetrics(VpsMetrics),
    NetworkInterfaces {
        interfaces: Vec<NetworkInterface>,
    },
    NetworkServices {
        services: Vec<NetworkService>,
    },
    TargetHealth {
        path: String,
        url: String,
        healthy: bool,
    },
    DnsQuery {
        hit: bool,
        #[serde(default)]
        response_time_ms: Option<f64>,
    },
}

/// Cloneable handle for pushing telemetry
#[derive(Debug, Clone)]
pub struct TelemetrySender {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySender {
    /// Wait for room in the channel
    pub async fn send(&self, event: TelemetryEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ControlError::ExternalUnavailable("telemetry ingest stopped".into()))
    }

    /// Push without waiting; a full channel drops the event
    pub fn try_send(&self, event: TelemetryEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ControlError::ExternalUnavailable("telemetry channel full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ControlError::ExternalUnavailable("telemetry ingest stopped".into())
            }
        })
    }

    /// Whether the ingest task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded telemetry channel
pub fn channel(buffer: usize) -> (TelemetrySender, mpsc::Receiver<TelemetryEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (TelemetrySender { tx }, rx)
}

/// Apply one event
pub fn apply(plane: &ControlPlane, event: TelemetryEvent) -> Result<()> {
    match event {
        TelemetryEvent::Heartbeat {
            gateway_id,
            source_ip,
            at,
        } => plane.gateways.mark_seen(&gateway_id, source_ip, at),
        TelemetryEvent::ForwardTraffic {
            forward_id,
            counters,
        } => plane.forwards.record_traffic(&forward_id, counters),
        TelemetryEvent::VpsMetrics(metrics) => {
            plane.status.update(metrics);
            Ok(())
        }
        TelemetryEvent::TargetHealth { path, url, healthy } => {
            plane.routes.set_target_health(&path, &url, healthy)
        }
        TelemetryEvent::NetworkInterfaces { interfaces } => {
            plane.status.update_interfaces(interfaces);
            Ok(())
        }
        TelemetryEvent::NetworkServices { services } => {
            plane.status.update_services(services);
            Ok(())
        }
        TelemetryEvent::DnsQuery {
            hit,
            response_time_ms,
        } => {
            plane.dns.record_query(hit);
            if let Some(ms) = response_time_ms {
                match Duration::try_from_secs_f64(ms / 1000.0) {
                    Ok(elapsed) => plane.dns.record_response_time(elapsed),
                    Err(_) => debug!("Ignoring resolver latency {}", ms),
                }
            }
            Ok(())
        }
    }
}

/// Run the ingest loop until every sender is dropped
pub async fn run_ingest(plane: Arc<ControlPlane>, mut rx: mpsc::Receiver<TelemetryEvent>) {
    info!("Starting telemetry ingest");

    while let Some(event) = rx.recv().await {
        debug!("Telemetry: {:?}", event);
        if let Err(e) = apply(&plane, event) {
            // Events for entities removed meanwhile are expected
            warn!("Dropped telemetry event: {}", e);
        }
    }

    info!("Telemetry ingest stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::entitlement::tests::license;
    use crate::entitlement::{Plan, SimulatedBackend};
    use crate::gateway::GatewaySpec;
    use crate::tunnel::LoggingTransport;

    fn plane() -> Arc<ControlPlane> {
        let plane = ControlPlane::with_components(
            ControlConfig::default(),
            Arc::new(SimulatedBackend::from_accounts(&[])),
            Arc::new(LoggingTransport),
        )
        .unwrap();
        plane.entitlements.install(license(Plan::Starter));
        Arc::new(plane)
    }

    #[tokio::test]
    async fn test_ingest_applies_events_in_order() {
        let plane = plane();
        let gw = plane
            .register_gateway(GatewaySpec {
                name: "edge-1".into(),
                ..Default::default()
            })
            .unwrap();

        let (tx, rx) = channel(16);
        let task = tokio::spawn(run_ingest(plane.clone(), rx));

        tx.send(TelemetryEvent::Heartbeat {
            gateway_id: gw.id.clone(),
            source_ip: "203.0.113.9".parse().unwrap(),
            at: Utc::now(),
        })
        .await
        .unwrap();
        tx.send(TelemetryEvent::DnsQuery {
            hit: true,
            response_time_ms: Some(8.0),
        })
        .await
        .unwrap();
        tx.send(TelemetryEvent::DnsQuery {
            hit: false,
            response_time_ms: None,
        })
        .await
        .unwrap();
        // Unknown gateway is logged and skipped
        tx.send(TelemetryEvent::Heartbeat {
            gateway_id: "gw_missing".into(),
            source_ip: "203.0.113.9".parse().unwrap(),
            at: Utc::now(),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(plane.gateways.get(&gw.id).unwrap().connected);
        assert_eq!(plane.dns.stats().total_queries, 2);
        assert!((plane.dns.stats().avg_response_time_ms.unwrap() - 8.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_telemetry_flows_on_expired_license() {
        let plane = plane();
        let gw = plane
            .register_gateway(GatewaySpec {
                name: "edge-1".into(),
                ..Default::default()
            })
            .unwrap();
        let mut expired = license(Plan::Starter);
        expired.expires_at = Utc::now() - chrono::Duration::hours(1);
        plane.entitlements.install(expired);

        apply(
            &plane,
            TelemetryEvent::Heartbeat {
                gateway_id: gw.id.clone(),
                source_ip: "203.0.113.9".parse().unwrap(),
                at: Utc::now(),
            },
        )
        .unwrap();
        apply(
            &plane,
            TelemetryEvent::VpsMetrics(VpsMetrics {
                cpu_percent: 40.0,
                ..Default::default()
            }),
        )
        .unwrap();

        let snapshot = plane.fleet_snapshot();
        assert_eq!(snapshot.connected_gateways, 1);
        assert_eq!(snapshot.vps.cpu_percent, 40.0);
    }

    #[test]
    fn test_try_send_full_channel() {
        let query = || TelemetryEvent::DnsQuery {
            hit: true,
            response_time_ms: None,
        };
        let (tx, _rx) = channel(1);
        tx.try_send(query()).unwrap();
        assert!(matches!(
            tx.try_send(query()),
            Err(ControlError::ExternalUnavailable(_))
        ));
    }

    #[test]
    fn test_event_wire_form() {
        let event: TelemetryEvent =
            serde_json::from_str(r#"{"type": "dns_query", "hit": false}"#).unwrap();
        assert!(matches!(
            event,
            TelemetryEvent::DnsQuery {
                hit: false,
                response_time_ms: None
            }
        ));
    }

    #[test]
    fn test_inventory_events_update_status() {
        let plane = plane();
        let event: TelemetryEvent = serde_json::from_str(
            r#"{"type": "network_services", "services": [
                {"name": "SSH", "port": 22, "protocol": "TCP", "status": "running"},
                {"name": "WireGuard", "port": 51820, "protocol": "UDP", "status": "running"}
            ]}"#,
        )
        .unwrap();
        apply(&plane, event).unwrap();

        let event: TelemetryEvent = serde_json::from_str(
            r#"{"type": "network_interfaces", "interfaces": [
                {"name": "eth0", "ip": "192.168.1.100", "netmask": "255.255.255.0", "status": "up"}
            ]}"#,
        )
        .unwrap();
        apply(&plane, event).unwrap();

        assert_eq!(plane.network_services().len(), 2);
        assert_eq!(plane.network_interfaces().len(), 2);
    }
}
