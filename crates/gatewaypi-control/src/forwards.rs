//! Port Forward Table
//!
//! Public-port mappings into gateway LANs. At most one enabled forward may
//! claim a `(public port, protocol)` pair; disabled forwards keep their
//! mapping but never conflict.

use crate::config::ReservedPort;
use crate::entitlement::{EntitlementStore, ResourceKind};
use crate::error::{ControlError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info};

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Port forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub id: String,
    pub name: String,
    pub public_port: u16,
    pub private_ip: IpAddr,
    pub private_port: u16,
    pub protocol: Protocol,
    pub enabled: bool,
    pub gateway_id: String,
    pub created_at: DateTime<Utc>,
}

/// Add request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardSpec {
    pub name: String,
    pub public_port: u16,
    pub private_ip: IpAddr,
    pub private_port: u16,
    pub protocol: Protocol,
    pub gateway_id: String,
}

/// Live counters reported by the traffic monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardCounters {
    pub connections: u64,
    pub traffic_inbound: u64,
    pub traffic_outbound: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardState {
    Active,
    Inactive,
}

/// Forward status view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStatus {
    pub id: String,
    pub status: ForwardState,
    pub connections: u64,
    pub traffic_inbound: u64,
    pub traffic_outbound: u64,
}

struct ForwardEntry {
    forward: PortForward,
    counters: ForwardCounters,
}

fn forward_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("pf_{}", &raw[..12])
}

/// Port Forward Table
pub struct PortForwardTable {
    forwards: RwLock<HashMap<String, ForwardEntry>>,
    reserved: Vec<ReservedPort>,
}

impl PortForwardTable {
    pub fn new(reserved: Vec<ReservedPort>) -> Self {
        Self {
            forwards: RwLock::new(HashMap::new()),
            reserved,
        }
    }

    fn check_free(
        &self,
        forwards: &HashMap<String, ForwardEntry>,
        port: u16,
        protocol: Protocol,
        except: Option<&str>,
    ) -> Result<()> {
        let reserved = self
            .reserved
            .iter()
            .any(|r| r.port == port && r.protocol == protocol);
        let claimed = forwards.values().any(|e| {
            e.forward.enabled
                && e.forward.public_port == port
                && e.forward.protocol == protocol
                && Some(e.forward.id.as_str()) != except
        });

        if reserved || claimed {
            debug!("Port {}/{} refused (reserved: {})", port, protocol, reserved);
            return Err(ControlError::PortInUse { port, protocol });
        }
        Ok(())
    }

    /// Add an enabled forward
    pub fn add_forward(&self, entitlements: &EntitlementStore, spec: PortForwardSpec) -> Result<PortForward> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ControlError::InvalidInput("port forward name is required".into()));
        }
        if spec.public_port == 0 || spec.private_port == 0 {
            return Err(ControlError::InvalidInput("ports must be within 1-65535".into()));
        }

        let mut forwards = self.forwards.write();
        entitlements.ensure_allowed(ResourceKind::PortForward, forwards.len())?;
        self.check_free(&forwards, spec.public_port, spec.protocol, None)?;

        let forward = PortForward {
            id: forward_id(),
            name: name.to_string(),
            public_port: spec.public_port,
            private_ip: spec.private_ip,
            private_port: spec.private_port,
            protocol: spec.protocol,
            enabled: true,
            gateway_id: spec.gateway_id,
            created_at: Utc::now(),
        };

        info!(
            "Forward {} :{}/{} -> {}:{} via {}",
            forward.id,
            forward.public_port,
            forward.protocol,
            forward.private_ip,
            forward.private_port,
            forward.gateway_id
        );
        forwards.insert(
            forward.id.clone(),
            ForwardEntry {
                forward: forward.clone(),
                counters: ForwardCounters::default(),
            },
        );
        Ok(forward)
    }

    /// Enable or disable; enabling re-checks the port claim at this moment
    pub fn toggle(&self, entitlements: &EntitlementStore, id: &str, enabled: bool) -> Result<PortForward> {
        let mut forwards = self.forwards.write();
        entitlements.ensure_active()?;

        let (port, protocol, current) = match forwards.get(id) {
            Some(e) => (e.forward.public_port, e.forward.protocol, e.forward.enabled),
            None => return Err(not_found(id)),
        };
        if enabled && !current {
            self.check_free(&forwards, port, protocol, Some(id))?;
        }

        let entry = forwards.get_mut(id).ok_or_else(|| not_found(id))?;
        if current != enabled {
            entry.forward.enabled = enabled;
            if !enabled {
                entry.counters.connections = 0;
            }
            info!("Forward {} {}", id, if enabled { "enabled" } else { "disabled" });
        }
        Ok(entry.forward.clone())
    }

    pub fn remove(&self, entitlements: &EntitlementStore, id: &str) -> Result<PortForward> {
        let mut forwards = self.forwards.write();
        entitlements.ensure_active()?;
        let entry = forwards.remove(id).ok_or_else(|| not_found(id))?;
        info!("Removed forward {}", id);
        Ok(entry.forward)
    }

    pub fn status(&self, id: &str) -> Result<ForwardStatus> {
        let forwards = self.forwards.read();
        let entry = forwards.get(id).ok_or_else(|| not_found(id))?;
        Ok(ForwardStatus {
            id: entry.forward.id.clone(),
            status: if entry.forward.enabled {
                ForwardState::Active
            } else {
                ForwardState::Inactive
            },
            connections: entry.counters.connections,
            traffic_inbound: entry.counters.traffic_inbound,
            traffic_outbound: entry.counters.traffic_outbound,
        })
    }

    /// Replace the monitor counters of a forward
    pub fn record_traffic(&self, id: &str, counters: ForwardCounters) -> Result<()> {
        let mut forwards = self.forwards.write();
        let entry = forwards.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.counters = counters;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<PortForward> {
        self.forwards.read().get(id).map(|e| e.forward.clone())
    }

    /// All forwards, oldest first
    pub fn list(&self) -> Vec<PortForward> {
        let mut list: Vec<PortForward> = self
            .forwards
            .read()
            .values()
            .map(|e| e.forward.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Drop every forward bound to `gateway_id`; returns removed ids
    pub fn purge_gateway(&self, gateway_id: &str) -> Vec<String> {
        let mut forwards = self.forwards.write();
        let removed: Vec<String> = forwards
            .values()
            .filter(|e| e.forward.gateway_id == gateway_id)
            .map(|e| e.forward.id.clone())
            .collect();

        for id in &removed {
            forwards.remove(id);
        }
        if !removed.is_empty() {
            info!("Purged {} forwards of {}", removed.len(), gateway_id);
        }
        removed
    }
}

fn not_found(id: &str) -> ControlError {
    ControlError::NotFound(format!("port forward {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::tests::license;
    use crate::entitlement::{Plan, SimulatedBackend};
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> EntitlementStore {
        let store = EntitlementStore::new(
            Arc::new(SimulatedBackend::from_accounts(&[])),
            None,
            Duration::from_millis(100),
        );
        store.install(license(Plan::Starter));
        store
    }

    fn table() -> PortForwardTable {
        PortForwardTable::new(vec![ReservedPort {
            port: 51820,
            protocol: Protocol::Udp,
        }])
    }

    fn spec(port: u16, protocol: Protocol) -> PortForwardSpec {
        PortForwardSpec {
            name: "web".into(),
            public_port: port,
            private_ip: "192.168.1.10".parse().unwrap(),
            private_port: 80,
            protocol,
            gateway_id: "gw_1".into(),
        }
    }

    #[test]
    fn test_enabled_conflict_only() {
        let table = table();
        let entitlements = store();
        let first = table.add_forward(&entitlements, spec(8080, Protocol::Tcp)).unwrap();
        assert!(first.enabled);

        let err = table.add_forward(&entitlements, spec(8080, Protocol::Tcp)).unwrap_err();
        assert!(matches!(err, ControlError::PortInUse { port: 8080, protocol: Protocol::Tcp }));
        assert!(table.add_forward(&entitlements, spec(8080, Protocol::Udp)).is_ok());

        table.toggle(&entitlements, &first.id, false).unwrap();
        let second = table.add_forward(&entitlements, spec(8080, Protocol::Tcp)).unwrap();

        // Re-enabling the first now conflicts with the second
        assert!(matches!(
            table.toggle(&entitlements, &first.id, true),
            Err(ControlError::PortInUse { .. })
        ));
        assert!(table.toggle(&entitlements, &second.id, true).unwrap().enabled);
    }

    #[test]
    fn test_reserved_and_zero_ports() {
        let table = table();
        let entitlements = store();
        assert!(matches!(
            table.add_forward(&entitlements, spec(51820, Protocol::Udp)),
            Err(ControlError::PortInUse { .. })
        ));
        assert!(table.add_forward(&entitlements, spec(51820, Protocol::Tcp)).is_ok());
        assert!(matches!(
            table.add_forward(&entitlements, spec(0, Protocol::Tcp)),
            Err(ControlError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_status_and_counters() {
        let table = table();
        let entitlements = store();
        let forward = table.add_forward(&entitlements, spec(2222, Protocol::Tcp)).unwrap();

        table
            .record_traffic(
                &forward.id,
                ForwardCounters {
                    connections: 3,
                    traffic_inbound: 1024,
                    traffic_outbound: 4096,
                },
            )
            .unwrap();
        let status = table.status(&forward.id).unwrap();
        assert_eq!(status.status, ForwardState::Active);
        assert_eq!(status.traffic_outbound, 4096);

        table.toggle(&entitlements, &forward.id, false).unwrap();
        let status = table.status(&forward.id).unwrap();
        assert_eq!(status.status, ForwardState::Inactive);
        assert_eq!(status.connections, 0);
    }

    #[test]
    fn test_remove_and_purge() {
        let table = table();
        let entitlements = store();
        let forward = table.add_forward(&entitlements, spec(2222, Protocol::Tcp)).unwrap();
        let other = table.add_forward(&entitlements, spec(2223, Protocol::Tcp)).unwrap();

        table.remove(&entitlements, &other.id).unwrap();
        assert!(matches!(table.remove(&entitlements, &other.id), Err(ControlError::NotFound(_))));

        assert_eq!(table.purge_gateway("gw_1"), vec![forward.id.clone()]);
        assert!(matches!(table.status(&forward.id), Err(ControlError::NotFound(_))));
    }

    #[test]
    fn test_protocol_wire_form() {
        assert_eq!(serde_json::to_string(&Protocol::Tcp).unwrap(), "\"TCP\"");
        let parsed: Protocol = serde_json::from_str("\"UDP\"").unwrap();
        assert_eq!(parsed, Protocol::Udp);
    }
}
