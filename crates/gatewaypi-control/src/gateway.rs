//! Gateway Registry
//!
//! Identity, connectivity and tunnel provisioning state of every gateway in
//! the fleet. The registry is the anchor other tables reference; cascades
//! run while its write lock is held so nothing can re-attach to a gateway
//! that is being removed.

use crate::entitlement::{EntitlementStore, ResourceKind};
use crate::error::{ControlError, Result};
use crate::subnet::{first_host, SubnetAllocator};
use crate::tunnel::{generate_keypair, TunnelKeyPair};
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

/// Registered gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub location: String,
    pub description: String,
    pub connected: bool,
    pub ip: Option<IpAddr>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Public half of the currently valid tunnel key
    pub tunnel_public_key: String,
    pub tunnel_subnet: Ipv4Network,
    pub tunnel_address: Ipv4Addr,
}

/// Registration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
}

/// Key material picked for an install artifact, not yet committed
#[derive(Debug, Clone)]
pub struct KeyIssue {
    pub gateway_id: String,
    pub keys: TunnelKeyPair,
    pub tunnel_subnet: Ipv4Network,
    pub tunnel_address: Ipv4Addr,
    /// Key generated at registration, handed out for the first time
    pub initial: bool,
    /// Key revision the issue was prepared against
    pub revision: u64,
}

struct RegistryState {
    gateways: HashMap<String, Gateway>,
    /// Private keys generated at registration and not yet issued
    pending_keys: HashMap<String, TunnelKeyPair>,
    /// Bumped on every committed key change
    key_revisions: HashMap<String, u64>,
    subnets: SubnetAllocator,
}

/// Gateway Registry
pub struct GatewayRegistry {
    state: RwLock<RegistryState>,
    hub_address: Ipv4Addr,
}

fn gateway_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("gw_{}", &raw[..12])
}

impl GatewayRegistry {
    pub fn new(tunnel_pool: Ipv4Network) -> Result<Self> {
        let subnets = SubnetAllocator::new(tunnel_pool)?;
        let hub_address = first_host(subnets.hub_subnet());
        Ok(Self {
            state: RwLock::new(RegistryState {
                gateways: HashMap::new(),
                pending_keys: HashMap::new(),
                key_revisions: HashMap::new(),
                subnets,
            }),
            hub_address,
        })
    }

    /// Tunnel address of the VPS hub
    pub fn hub_address(&self) -> Ipv4Addr {
        self.hub_address
    }

    /// Register a gateway.
    ///
    /// The quota check and the insert share one write-lock scope, so
    /// concurrent registrations can never overshoot the plan limit.
    pub fn register(&self, entitlements: &EntitlementStore, spec: GatewaySpec) -> Result<Gateway> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ControlError::InvalidInput("gateway name is required".into()));
        }

        let mut state = self.state.write();
        entitlements.ensure_allowed(ResourceKind::Gateway, state.gateways.len())?;

        let tunnel_subnet = state.subnets.allocate()?;
        let keys = generate_keypair();
        let gateway = Gateway {
            id: gateway_id(),
            name: name.to_string(),
            location: spec.location.trim().to_string(),
            description: spec.description.trim().to_string(),
            connected: false,
            ip: None,
            last_seen: None,
            created_at: Utc::now(),
            tunnel_public_key: keys.public_key.clone(),
            tunnel_subnet,
            tunnel_address: first_host(tunnel_subnet),
        };

        info!(
            "Registered gateway {} ({}) on {}",
            gateway.id, gateway.name, gateway.tunnel_subnet
        );
        state.pending_keys.insert(gateway.id.clone(), keys);
        state.key_revisions.insert(gateway.id.clone(), 0);
        state.gateways.insert(gateway.id.clone(), gateway.clone());
        Ok(gateway)
    }

    /// Pick the key for the next install artifact.
    ///
    /// The first issue takes the key generated at registration out of the
    /// pending slot, so it is handed out at most once; every later issue
    /// generates a fresh pair. Nothing is valid until
    /// [`GatewayRegistry::commit_key`]; a failed issue goes back through
    /// [`GatewayRegistry::abandon_key`].
    pub fn prepare_key(&self, gateway_id: &str) -> Result<KeyIssue> {
        let mut state = self.state.write();
        let (tunnel_subnet, tunnel_address) = match state.gateways.get(gateway_id) {
            Some(gateway) => (gateway.tunnel_subnet, gateway.tunnel_address),
            None => return Err(not_found(gateway_id)),
        };

        let (keys, initial) = match state.pending_keys.remove(gateway_id) {
            Some(keys) => (keys, true),
            None => (generate_keypair(), false),
        };
        let revision = state.key_revisions.get(gateway_id).copied().unwrap_or_default();

        Ok(KeyIssue {
            gateway_id: gateway_id.to_string(),
            keys,
            tunnel_subnet,
            tunnel_address,
            initial,
            revision,
        })
    }

    /// Make `issue` the gateway's valid key, invalidating the previous one.
    ///
    /// Fails with `KeyConflict` when another issue committed since `issue`
    /// was prepared.
    pub fn commit_key(&self, issue: &KeyIssue) -> Result<()> {
        let mut state = self.state.write();
        let RegistryState {
            gateways,
            key_revisions,
            ..
        } = &mut *state;

        let gateway = gateways
            .get_mut(&issue.gateway_id)
            .ok_or_else(|| not_found(&issue.gateway_id))?;
        let revision = key_revisions.entry(issue.gateway_id.clone()).or_default();
        if *revision != issue.revision {
            warn!(
                "Tunnel key for {} changed while issuing (revision {} != {})",
                issue.gateway_id, revision, issue.revision
            );
            return Err(ControlError::KeyConflict(issue.gateway_id.clone()));
        }

        gateway.tunnel_public_key = issue.keys.public_key.clone();
        *revision += 1;

        if issue.initial {
            info!("Issued initial tunnel key for {}", issue.gateway_id);
        } else {
            info!("Rotated tunnel key for {}", issue.gateway_id);
        }
        Ok(())
    }

    /// Undo a prepared issue that will not be committed.
    ///
    /// An initial key goes back to the pending slot unless the gateway is
    /// gone or its key moved on in the meantime.
    pub fn abandon_key(&self, issue: KeyIssue) {
        if !issue.initial {
            return;
        }

        let mut state = self.state.write();
        let unchanged = state.gateways.contains_key(&issue.gateway_id)
            && state.key_revisions.get(&issue.gateway_id).copied().unwrap_or_default() == issue.revision;
        if unchanged {
            debug!("Returning initial tunnel key of {} to pending", issue.gateway_id);
            state.pending_keys.entry(issue.gateway_id).or_insert(issue.keys);
        }
    }

    /// Heartbeat received
    pub fn mark_seen(&self, gateway_id: &str, source_ip: IpAddr, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        let gateway = state
            .gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found(gateway_id))?;

        if !gateway.connected {
            info!("Gateway {} connected from {}", gateway_id, source_ip);
        }
        gateway.connected = true;
        gateway.ip = Some(source_ip);
        gateway.last_seen = Some(gateway.last_seen.map_or(at, |seen| seen.max(at)));
        Ok(())
    }

    /// Disconnect every gateway not seen within `threshold`; returns their ids
    pub fn mark_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - threshold;
        let mut state = self.state.write();
        let mut stale = Vec::new();

        for gateway in state.gateways.values_mut() {
            let expired = gateway.last_seen.map_or(true, |seen| seen < cutoff);
            if gateway.connected && expired {
                gateway.connected = false;
                stale.push(gateway.id.clone());
            }
        }

        for id in &stale {
            info!("Gateway {} went stale", id);
        }
        stale
    }

    /// Remove a gateway, running `cascade` before the write lock is released
    pub fn remove_with<F>(&self, gateway_id: &str, cascade: F) -> Result<Gateway>
    where
        F: FnOnce(&Gateway),
    {
        let mut state = self.state.write();
        let gateway = state
            .gateways
            .remove(gateway_id)
            .ok_or_else(|| not_found(gateway_id))?;

        state.pending_keys.remove(gateway_id);
        state.key_revisions.remove(gateway_id);
        state.subnets.release(gateway.tunnel_subnet);
        cascade(&gateway);

        info!("Removed gateway {} ({})", gateway.id, gateway.name);
        Ok(gateway)
    }

    /// Run `f` while every id in `gateway_ids` is guaranteed to exist
    pub fn with_existing<T, F>(&self, gateway_ids: &[&str], f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let state = self.state.read();
        for id in gateway_ids {
            if !state.gateways.contains_key(*id) {
                debug!("Reference to unknown gateway {}", id);
                return Err(not_found(id));
            }
        }
        f()
    }

    pub fn get(&self, gateway_id: &str) -> Option<Gateway> {
        self.state.read().gateways.get(gateway_id).cloned()
    }

    /// All gateways, oldest first
    pub fn list(&self) -> Vec<Gateway> {
        let mut gateways: Vec<Gateway> = self.state.read().gateways.values().cloned().collect();
        gateways.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        gateways
    }

    pub fn count(&self) -> usize {
        self.state.read().gateways.len()
    }
}

fn not_found(gateway_id: &str) -> ControlError {
    ControlError::NotFound(format!("gateway {}", gateway_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::tests::license;
    use crate::entitlement::{Plan, SimulatedBackend};
    use std::sync::Arc;
    use std::time::Duration;

    fn store(plan: Plan) -> EntitlementStore {
        let store = EntitlementStore::new(
            Arc::new(SimulatedBackend::from_accounts(&[])),
            None,
            Duration::from_millis(100),
        );
        store.install(license(plan));
        store
    }

    fn registry() -> GatewayRegistry {
        GatewayRegistry::new("10.0.0.0/16".parse().unwrap()).unwrap()
    }

    fn spec(name: &str) -> GatewaySpec {
        GatewaySpec {
            name: name.into(),
            location: "Lagos".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_initial_state() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();

        assert!(gateway.id.starts_with("gw_"));
        assert!(!gateway.connected);
        assert!(gateway.ip.is_none() && gateway.last_seen.is_none());
        assert_eq!(gateway.tunnel_subnet.to_string(), "10.0.1.0/24");
        assert_eq!(registry.hub_address(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_starter_quota() {
        let registry = registry();
        let entitlements = store(Plan::Starter);
        registry.register(&entitlements, spec("edge-1")).unwrap();

        let err = registry.register(&entitlements, spec("edge-2")).unwrap_err();
        assert!(matches!(err, ControlError::QuotaExceeded { limit: 1, .. }));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_enterprise_unbounded() {
        let registry = registry();
        let entitlements = store(Plan::Enterprise);
        for i in 0..60 {
            registry.register(&entitlements, spec(&format!("edge-{}", i))).unwrap();
        }
        assert_eq!(registry.count(), 60);
    }

    #[test]
    fn test_blank_name_rejected() {
        let err = registry().register(&store(Plan::Starter), spec("  ")).unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));
    }

    #[test]
    fn test_first_issue_hands_out_registration_key() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();

        let first = registry.prepare_key(&gateway.id).unwrap();
        assert!(first.initial);
        assert_eq!(first.keys.public_key, gateway.tunnel_public_key);
        registry.commit_key(&first).unwrap();

        let second = registry.prepare_key(&gateway.id).unwrap();
        assert!(!second.initial);
        assert_ne!(second.keys.private_key, first.keys.private_key);

        // Uncommitted rotation leaves the valid key alone
        assert_eq!(registry.get(&gateway.id).unwrap().tunnel_public_key, first.keys.public_key);
        registry.commit_key(&second).unwrap();
        assert_eq!(registry.get(&gateway.id).unwrap().tunnel_public_key, second.keys.public_key);
    }

    #[test]
    fn test_registration_key_is_taken_once() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();

        let first = registry.prepare_key(&gateway.id).unwrap();
        let second = registry.prepare_key(&gateway.id).unwrap();
        assert!(first.initial);
        assert!(!second.initial);
        assert_ne!(first.keys.private_key, second.keys.private_key);
    }

    #[test]
    fn test_stale_commit_rejected() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();

        let a = registry.prepare_key(&gateway.id).unwrap();
        let b = registry.prepare_key(&gateway.id).unwrap();
        registry.commit_key(&b).unwrap();

        let err = registry.commit_key(&a).unwrap_err();
        assert!(matches!(err, ControlError::KeyConflict(_)));
        assert_eq!(registry.get(&gateway.id).unwrap().tunnel_public_key, b.keys.public_key);
    }

    #[test]
    fn test_abandoned_initial_key_returns_to_pending() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();

        let first = registry.prepare_key(&gateway.id).unwrap();
        let private_key = first.keys.private_key.clone();
        registry.abandon_key(first);

        let retry = registry.prepare_key(&gateway.id).unwrap();
        assert!(retry.initial);
        assert_eq!(retry.keys.private_key, private_key);

        // Once another key is committed the old one stays consumed
        let rotation = registry.prepare_key(&gateway.id).unwrap();
        registry.commit_key(&rotation).unwrap();
        registry.abandon_key(retry);
        assert!(!registry.prepare_key(&gateway.id).unwrap().initial);
    }

    #[test]
    fn test_seen_then_stale() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();
        let now = Utc::now();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        registry.mark_seen(&gateway.id, ip, now - chrono::Duration::seconds(300)).unwrap();
        let seen = registry.get(&gateway.id).unwrap();
        assert!(seen.connected);
        assert_eq!(seen.ip, Some(ip));

        let stale = registry.mark_stale(chrono::Duration::seconds(120), now);
        assert_eq!(stale, vec![gateway.id.clone()]);
        assert!(!registry.get(&gateway.id).unwrap().connected);
        assert!(registry.mark_stale(chrono::Duration::seconds(120), now).is_empty());
    }

    #[test]
    fn test_mark_seen_unknown() {
        let err = registry()
            .mark_seen("gw_missing", "10.1.1.1".parse().unwrap(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[test]
    fn test_remove_releases_subnet_and_runs_cascade() {
        let registry = registry();
        let entitlements = store(Plan::Professional);
        let first = registry.register(&entitlements, spec("edge-1")).unwrap();

        let mut cascaded = None;
        registry
            .remove_with(&first.id, |gw| cascaded = Some(gw.id.clone()))
            .unwrap();
        assert_eq!(cascaded.as_deref(), Some(first.id.as_str()));
        assert!(matches!(registry.remove_with(&first.id, |_| {}), Err(ControlError::NotFound(_))));

        let second = registry.register(&entitlements, spec("edge-2")).unwrap();
        assert_eq!(second.tunnel_subnet, first.tunnel_subnet);
    }

    #[test]
    fn test_with_existing_checks_references() {
        let registry = registry();
        let gateway = registry.register(&store(Plan::Starter), spec("edge-1")).unwrap();

        assert_eq!(registry.with_existing(&[gateway.id.as_str()], || Ok(7)).unwrap(), 7);
        assert!(matches!(
            registry.with_existing(&["gw_missing"], || Ok(())),
            Err(ControlError::NotFound(_))
        ));
    }
}
