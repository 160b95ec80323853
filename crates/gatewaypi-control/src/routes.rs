//! Route Table
//!
//! Path-routing rules over weighted backend targets. Selection runs under the
//! read lock: the round-robin cursor and in-flight counters are atomics, so
//! concurrent requests never serialize on the table.

use crate::entitlement::{EntitlementStore, Feature, ResourceKind};
use crate::error::{ControlError, Result};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const HTTP_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Load-balancing policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
}

/// Backend target as requested
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub gateway_id: Option<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Route as requested
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub path: String,
    pub targets: Vec<TargetSpec>,
    /// Empty means any method
    #[serde(default)]
    pub methods: BTreeSet<String>,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RouteSpec {
    /// Gateways the route's targets are scoped to
    pub fn gateway_ids(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter_map(|t| t.gateway_id.as_deref())
            .collect()
    }
}

/// Target view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTarget {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub gateway_id: Option<String>,
    pub in_flight: usize,
}

/// Route view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub path: String,
    pub targets: Vec<RouteTarget>,
    pub methods: BTreeSet<String>,
    pub load_balancing: LoadBalancing,
    pub enabled: bool,
}

struct TargetState {
    url: String,
    weight: u32,
    healthy: bool,
    gateway_id: Option<String>,
    in_flight: Arc<AtomicUsize>,
}

struct RouteEntry {
    path: String,
    targets: Vec<TargetState>,
    methods: BTreeSet<String>,
    policy: LoadBalancing,
    enabled: bool,
    cursor: AtomicUsize,
}

impl RouteEntry {
    fn view(&self) -> Route {
        Route {
            path: self.path.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| RouteTarget {
                    url: t.url.clone(),
                    weight: t.weight,
                    healthy: t.healthy,
                    gateway_id: t.gateway_id.clone(),
                    in_flight: t.in_flight.load(Ordering::SeqCst),
                })
                .collect(),
            methods: self.methods.clone(),
            load_balancing: self.policy,
            enabled: self.enabled,
        }
    }

    fn accepts(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(&method.to_ascii_uppercase())
    }

    fn select(&self) -> Result<TargetLease> {
        let healthy: Vec<&TargetState> = self.targets.iter().filter(|t| t.healthy).collect();
        if healthy.is_empty() {
            return Err(ControlError::NoHealthyTarget(self.path.clone()));
        }

        let target = match self.policy {
            LoadBalancing::RoundRobin => {
                let turn = self.cursor.fetch_add(1, Ordering::SeqCst);
                healthy[turn % healthy.len()]
            }
            // min_by_key keeps the first of equal elements, so ties go to insertion order
            LoadBalancing::LeastConnections => healthy
                .iter()
                .copied()
                .min_by_key(|t| t.in_flight.load(Ordering::SeqCst))
                .unwrap_or(healthy[0]),
            LoadBalancing::Weighted => weighted_select(&healthy),
        };

        debug!("Route {} -> {}", self.path, target.url);
        target.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(TargetLease {
            path: self.path.clone(),
            url: target.url.clone(),
            gateway_id: target.gateway_id.clone(),
            in_flight: target.in_flight.clone(),
        })
    }
}

fn weighted_select<'a>(targets: &[&'a TargetState]) -> &'a TargetState {
    let total_weight: u64 = targets.iter().map(|t| t.weight as u64).sum();
    let random = rand::thread_rng().gen_range(0..total_weight.max(1));
    let mut cumulative = 0;

    for target in targets {
        cumulative += target.weight as u64;
        if random < cumulative {
            return target;
        }
    }

    targets[targets.len() - 1]
}

/// Pattern match: trailing `*` is a prefix match, otherwise exact or parent segment
fn match_path(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path || path.starts_with(&format!("{}/", pattern.trim_end_matches('/'))),
    }
}

/// Selected target; the in-flight attribution ends when the lease is dropped
#[derive(Debug)]
pub struct TargetLease {
    pub path: String,
    pub url: String,
    pub gateway_id: Option<String>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a gateway purge took away
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutePurge {
    pub targets_removed: usize,
    pub routes_removed: Vec<String>,
}

fn validate(spec: &RouteSpec) -> Result<BTreeSet<String>> {
    if !spec.path.starts_with('/') {
        return Err(ControlError::InvalidInput(format!("route path must start with '/': {}", spec.path)));
    }
    if spec.targets.is_empty() {
        return Err(ControlError::InvalidTarget("route needs at least one target".into()));
    }

    let mut seen = HashSet::new();
    for target in &spec.targets {
        if target.weight == 0 {
            return Err(ControlError::InvalidTarget(format!("{}: weight must be positive", target.url)));
        }
        if !(target.url.starts_with("http://") || target.url.starts_with("https://")) {
            return Err(ControlError::InvalidTarget(format!("{}: expected an http(s) URL", target.url)));
        }
        if !seen.insert(target.url.as_str()) {
            return Err(ControlError::InvalidTarget(format!("{}: listed twice", target.url)));
        }
    }

    spec.methods
        .iter()
        .map(|m| {
            let method = m.trim().to_ascii_uppercase();
            if HTTP_METHODS.contains(&method.as_str()) {
                Ok(method)
            } else {
                Err(ControlError::InvalidInput(format!("unsupported HTTP method: {}", m)))
            }
        })
        .collect()
}

/// Route Table
pub struct RouteTable {
    routes: RwLock<BTreeMap<String, RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a route; non-default policies need `advanced-load-balancing`
    pub fn add_route(&self, entitlements: &EntitlementStore, spec: RouteSpec) -> Result<Route> {
        let methods = validate(&spec)?;

        let mut routes = self.routes.write();
        entitlements.ensure_allowed(ResourceKind::Route, routes.len())?;
        if spec.load_balancing != LoadBalancing::RoundRobin {
            entitlements.ensure_feature(Feature::AdvancedLoadBalancing)?;
        }
        if routes.contains_key(&spec.path) {
            return Err(ControlError::DuplicatePath(spec.path));
        }

        let entry = RouteEntry {
            path: spec.path.clone(),
            targets: spec
                .targets
                .into_iter()
                .map(|t| TargetState {
                    url: t.url,
                    weight: t.weight,
                    healthy: true,
                    gateway_id: t.gateway_id,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                })
                .collect(),
            methods,
            policy: spec.load_balancing,
            enabled: spec.enabled,
            cursor: AtomicUsize::new(0),
        };

        info!(
            "Added route {} ({} targets, {:?})",
            entry.path,
            entry.targets.len(),
            entry.policy
        );
        let view = entry.view();
        routes.insert(spec.path, entry);
        Ok(view)
    }

    pub fn remove_route(&self, entitlements: &EntitlementStore, path: &str) -> Result<Route> {
        let mut routes = self.routes.write();
        entitlements.ensure_active()?;
        let entry = routes
            .remove(path)
            .ok_or_else(|| ControlError::NotFound(format!("route {}", path)))?;
        info!("Removed route {}", path);
        Ok(entry.view())
    }

    /// Select a target of the route registered under `path`
    pub fn select_target(&self, path: &str, method: &str) -> Result<TargetLease> {
        let routes = self.routes.read();
        let entry = routes
            .get(path)
            .filter(|r| r.enabled && r.accepts(method))
            .ok_or_else(|| ControlError::NotFound(format!("route {} {}", method, path)))?;
        entry.select()
    }

    /// Find the enabled route matching a request path (longest pattern wins) and select a target
    pub fn resolve(&self, request_path: &str, method: &str) -> Result<TargetLease> {
        let routes = self.routes.read();
        let entry = routes
            .values()
            .filter(|r| r.enabled && r.accepts(method) && match_path(&r.path, request_path))
            .max_by_key(|r| r.path.len())
            .ok_or_else(|| ControlError::NotFound(format!("no route for {} {}", method, request_path)))?;
        entry.select()
    }

    /// Idempotent health update
    pub fn set_target_health(&self, path: &str, url: &str, healthy: bool) -> Result<()> {
        let mut routes = self.routes.write();
        let entry = routes
            .get_mut(path)
            .ok_or_else(|| ControlError::NotFound(format!("route {}", path)))?;
        let target = entry
            .targets
            .iter_mut()
            .find(|t| t.url == url)
            .ok_or_else(|| ControlError::NotFound(format!("target {} on route {}", url, path)))?;

        if target.healthy != healthy {
            info!("Target {} on {} is now {}", url, path, if healthy { "healthy" } else { "unhealthy" });
            target.healthy = healthy;
        }
        Ok(())
    }

    pub fn set_route_enabled(&self, entitlements: &EntitlementStore, path: &str, enabled: bool) -> Result<Route> {
        let mut routes = self.routes.write();
        entitlements.ensure_active()?;
        let entry = routes
            .get_mut(path)
            .ok_or_else(|| ControlError::NotFound(format!("route {}", path)))?;
        entry.enabled = enabled;
        Ok(entry.view())
    }

    /// Drop every target scoped to `gateway_id`, and routes left empty
    pub fn purge_gateway(&self, gateway_id: &str) -> RoutePurge {
        let mut routes = self.routes.write();
        let mut purge = RoutePurge::default();

        for entry in routes.values_mut() {
            let before = entry.targets.len();
            entry
                .targets
                .retain(|t| t.gateway_id.as_deref() != Some(gateway_id));
            purge.targets_removed += before - entry.targets.len();
        }

        routes.retain(|path, entry| {
            if entry.targets.is_empty() {
                purge.routes_removed.push(path.clone());
                false
            } else {
                true
            }
        });

        if purge.targets_removed > 0 {
            info!(
                "Purged {} targets of {} ({} routes removed)",
                purge.targets_removed,
                gateway_id,
                purge.routes_removed.len()
            );
        }
        purge
    }

    pub fn get(&self, path: &str) -> Option<Route> {
        self.routes.read().get(path).map(RouteEntry::view)
    }

    pub fn list(&self) -> Vec<Route> {
        self.routes.read().values().map(RouteEntry::view).collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::tests::license;
    use crate::entitlement::{Plan, SimulatedBackend};
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

    fn target(url: &str) -> TargetSpec {
        TargetSpec {
            url: url.into(),
            weight: 1,
            gateway_id: None,
        }
    }

    fn route(path: &str, urls: &[&str], policy: LoadBalancing) -> RouteSpec {
        RouteSpec {
            path: path.into(),
            targets: urls.iter().map(|u| target(u)).collect(),
            methods: BTreeSet::new(),
            load_balancing: policy,
            enabled: true,
        }
    }

    const A: &str = "http://10.0.1.10:8080";
    const B: &str = "http://10.0.1.11:8080";
    const C: &str = "http://10.0.1.12:8080";

    #[test]
    fn test_round_robin_independent_per_route() {
        let table = RouteTable::new();
        let entitlements = store(Plan::Starter);
        table.add_route(&entitlements, route("/api", &[A, B, C], LoadBalancing::RoundRobin)).unwrap();
        table.add_route(&entitlements, route("/web", &[A, B], LoadBalancing::RoundRobin)).unwrap();

        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(table.select_target("/api", "GET").unwrap().url.clone());
            table.select_target("/web", "GET").unwrap();
        }
        assert_eq!(picked, vec![A, B, C, A, B, C]);
    }

    #[test]
    fn test_unhealthy_sole_target() {
        let table = RouteTable::new();
        table.add_route(&store(Plan::Starter), route("/api", &[A], LoadBalancing::RoundRobin)).unwrap();

        table.set_target_health("/api", A, false).unwrap();
        table.set_target_health("/api", A, false).unwrap();
        assert!(matches!(table.select_target("/api", "GET"), Err(ControlError::NoHealthyTarget(_))));
        assert!(table.get("/api").is_some());

        table.set_target_health("/api", A, true).unwrap();
        assert!(table.select_target("/api", "GET").is_ok());
    }

    #[test]
    fn test_least_connections_uses_leases() {
        let table = RouteTable::new();
        table
            .add_route(&store(Plan::Professional), route("/api", &[A, B], LoadBalancing::LeastConnections))
            .unwrap();

        let first = table.select_target("/api", "GET").unwrap();
        assert_eq!(first.url, A);
        let second = table.select_target("/api", "GET").unwrap();
        assert_eq!(second.url, B);
        assert_eq!(table.get("/api").unwrap().targets[0].in_flight, 1);

        drop(first);
        assert_eq!(table.select_target("/api", "GET").unwrap().url, A);
        drop(second);
        assert!(table.get("/api").unwrap().targets.iter().all(|t| t.in_flight == 0));
    }

    #[test]
    fn test_weighted_skips_unhealthy() {
        let table = RouteTable::new();
        let mut spec = route("/api", &[A, B], LoadBalancing::Weighted);
        spec.targets[0].weight = 10;
        table.add_route(&store(Plan::Enterprise), spec).unwrap();
        table.set_target_health("/api", A, false).unwrap();

        for _ in 0..20 {
            assert_eq!(table.select_target("/api", "GET").unwrap().url, B);
        }
    }

    #[test]
    fn test_weighted_follows_weights() {
        let table = RouteTable::new();
        let mut spec = route("/api", &[A, B], LoadBalancing::Weighted);
        spec.targets[0].weight = 3;
        table.add_route(&store(Plan::Professional), spec).unwrap();

        let picks = 4000;
        let to_a = (0..picks)
            .filter(|_| table.select_target("/api", "GET").unwrap().url == A)
            .count();

        // Expected 3000, standard deviation about 27
        assert!((2800..=3200).contains(&to_a), "A picked {} of {}", to_a, picks);
    }

    #[test]
    fn test_advanced_policy_needs_feature() {
        let table = RouteTable::new();
        let err = table
            .add_route(&store(Plan::Starter), route("/api", &[A], LoadBalancing::Weighted))
            .unwrap_err();
        assert!(matches!(err, ControlError::FeatureNotEntitled(Feature::AdvancedLoadBalancing)));
    }

    #[test]
    fn test_validation_errors() {
        let table = RouteTable::new();
        let entitlements = store(Plan::Starter);

        let err = table.add_route(&entitlements, route("/api", &[], LoadBalancing::RoundRobin)).unwrap_err();
        assert!(matches!(err, ControlError::InvalidTarget(_)));

        let mut zero = route("/api", &[A], LoadBalancing::RoundRobin);
        zero.targets[0].weight = 0;
        assert!(matches!(table.add_route(&entitlements, zero), Err(ControlError::InvalidTarget(_))));

        let mut verb = route("/api", &[A], LoadBalancing::RoundRobin);
        verb.methods.insert("BREW".into());
        assert!(matches!(table.add_route(&entitlements, verb), Err(ControlError::InvalidInput(_))));

        table.add_route(&entitlements, route("/api", &[A], LoadBalancing::RoundRobin)).unwrap();
        let err = table.add_route(&entitlements, route("/api", &[B], LoadBalancing::RoundRobin)).unwrap_err();
        assert!(matches!(err, ControlError::DuplicatePath(_)));
    }

    #[test]
    fn test_method_and_disabled_are_not_found() {
        let table = RouteTable::new();
        let entitlements = store(Plan::Starter);
        let mut spec = route("/api", &[A], LoadBalancing::RoundRobin);
        spec.methods.insert("get".into());
        table.add_route(&entitlements, spec).unwrap();

        assert!(table.select_target("/api", "get").is_ok());
        assert!(matches!(table.select_target("/api", "POST"), Err(ControlError::NotFound(_))));

        table.set_route_enabled(&entitlements, "/api", false).unwrap();
        assert!(matches!(table.select_target("/api", "GET"), Err(ControlError::NotFound(_))));
    }

    #[test]
    fn test_resolve_longest_pattern() {
        let table = RouteTable::new();
        let entitlements = store(Plan::Starter);
        table.add_route(&entitlements, route("/api", &[A], LoadBalancing::RoundRobin)).unwrap();
        table.add_route(&entitlements, route("/api/v2*", &[B], LoadBalancing::RoundRobin)).unwrap();

        assert_eq!(table.resolve("/api/users", "GET").unwrap().url, A);
        assert_eq!(table.resolve("/api/v2beta/users", "GET").unwrap().url, B);
        assert!(table.resolve("/apix", "GET").is_err());
    }

    #[test]
    fn test_purge_gateway_drops_empty_routes() {
        let table = RouteTable::new();
        let entitlements = store(Plan::Starter);
        let mut mixed = route("/api", &[A, B], LoadBalancing::RoundRobin);
        mixed.targets[0].gateway_id = Some("gw_1".into());
        let mut only = route("/web", &[C], LoadBalancing::RoundRobin);
        only.targets[0].gateway_id = Some("gw_1".into());
        table.add_route(&entitlements, mixed).unwrap();
        table.add_route(&entitlements, only).unwrap();

        let purge = table.purge_gateway("gw_1");
        assert_eq!(purge.targets_removed, 2);
        assert_eq!(purge.routes_removed, vec!["/web".to_string()]);
        assert_eq!(table.get("/api").unwrap().targets.len(), 1);
    }

    #[test]
    fn test_expired_license_blocks_mutations_not_reads() {
        let table = RouteTable::new();
        let entitlements = store(Plan::Starter);
        table.add_route(&entitlements, route("/api", &[A], LoadBalancing::RoundRobin)).unwrap();

        let mut expired = license(Plan::Starter);
        expired.expires_at = chrono::Utc::now() - chrono::Duration::minutes(1);
        entitlements.install(expired);

        assert!(matches!(table.remove_route(&entitlements, "/api"), Err(ControlError::LicenseInactive(_))));
        assert_eq!(table.list().len(), 1);
        assert!(table.select_target("/api", "GET").is_ok());
    }
}
