//! Entitlement Store
//!
//! Holds the customer's license and answers quota and feature questions for
//! every fleet mutation. The store never mutates fleet state itself; the
//! registries call [`EntitlementStore::ensure_allowed`] from inside their own
//! critical section so the decision and the mutation are one atomic step.

pub mod cache;
pub mod provider;

use crate::error::{ControlError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use cache::LicenseCache;
pub use provider::{
    build_provider, EntitlementProvider, LicenseValidation, LiveBackend, SimulatedBackend,
};

/// Subscription plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    Starter,
    Professional,
    Enterprise,
}

impl Plan {
    /// Gateway limit sold with the plan, `None` is unbounded
    pub fn default_gateway_limit(&self) -> Option<u32> {
        match self {
            Self::Starter => Some(1),
            Self::Professional => Some(5),
            Self::Enterprise => None,
        }
    }

    /// Capabilities included with the plan
    pub fn default_features(&self) -> BTreeSet<Feature> {
        let mut features: BTreeSet<Feature> = [
            Feature::GatewayManagement,
            Feature::PortForwarding,
            Feature::DnsManagement,
        ]
        .into_iter()
        .collect();

        if matches!(self, Self::Professional | Self::Enterprise) {
            features.extend([
                Feature::NetworkMonitoring,
                Feature::Analytics,
                Feature::AdvancedLoadBalancing,
            ]);
        }
        if *self == Self::Enterprise {
            features.extend([Feature::CustomIntegrations, Feature::PrioritySupport]);
        }
        features
    }
}

/// License status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Inactive,
    Expired,
}

/// Capability tag carried by a license
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    GatewayManagement,
    PortForwarding,
    DnsManagement,
    NetworkMonitoring,
    Analytics,
    AdvancedLoadBalancing,
    CustomIntegrations,
    PrioritySupport,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayManagement => "gateway-management",
            Self::PortForwarding => "port-forwarding",
            Self::DnsManagement => "dns-management",
            Self::NetworkMonitoring => "network-monitoring",
            Self::Analytics => "analytics",
            Self::AdvancedLoadBalancing => "advanced-load-balancing",
            Self::CustomIntegrations => "custom-integrations",
            Self::PrioritySupport => "priority-support",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        let feature = match s {
            "gateway-management" => Self::GatewayManagement,
            "port-forwarding" => Self::PortForwarding,
            "dns-management" => Self::DnsManagement,
            "network-monitoring" => Self::NetworkMonitoring,
            "analytics" => Self::Analytics,
            "advanced-load-balancing" => Self::AdvancedLoadBalancing,
            "custom-integrations" => Self::CustomIntegrations,
            "priority-support" => Self::PrioritySupport,
            other => return Err(ControlError::InvalidInput(format!("unknown feature tag: {}", other))),
        };
        Ok(feature)
    }
}

/// Kind of fleet resource a mutation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Gateway,
    Route,
    DnsRecord,
    PortForward,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gateway => "gateway",
            Self::Route => "route",
            Self::DnsRecord => "dns-record",
            Self::PortForward => "port-forward",
        };
        f.write_str(name)
    }
}

/// Customer license
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    /// Customer identifier the license was validated for
    pub customer: String,
    pub plan: Plan,
    /// `None` means unbounded
    pub gateways_limit: Option<u32>,
    pub status: LicenseStatus,
    pub expires_at: DateTime<Utc>,
    pub features: BTreeSet<Feature>,
}

impl License {
    /// Status with expiry applied
    pub fn effective_status(&self, now: DateTime<Utc>) -> LicenseStatus {
        match self.status {
            LicenseStatus::Active if now > self.expires_at => LicenseStatus::Expired,
            status => status,
        }
    }

    /// Gateway limit, Enterprise is always unbounded
    pub fn gateway_limit(&self) -> Option<u32> {
        match self.plan {
            Plan::Enterprise => None,
            _ => self.gateways_limit,
        }
    }
}

/// Read view of the license with derived fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseInfo {
    pub customer: String,
    pub plan: Plan,
    pub gateways_limit: Option<u32>,
    pub gateways_used: usize,
    pub status: LicenseStatus,
    pub expires_at: DateTime<Utc>,
    pub features: BTreeSet<Feature>,
}

/// Why a mutation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoLicense,
    Inactive,
    Expired,
    LimitReached { limit: u32, used: usize },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLicense => f.write_str("no license activated"),
            Self::Inactive => f.write_str("license is inactive"),
            Self::Expired => f.write_str("license has expired"),
            Self::LimitReached { limit, used } => write!(f, "{} of {} in use", used, limit),
        }
    }
}

/// Quota decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny(DenyReason),
}

impl QuotaDecision {
    /// Convert a denial into the matching error
    pub fn into_result(self, kind: ResourceKind) -> Result<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(DenyReason::LimitReached { limit, .. }) => Err(ControlError::QuotaExceeded {
                resource: kind,
                limit,
            }),
            Self::Deny(reason) => Err(ControlError::LicenseInactive(reason.to_string())),
        }
    }
}

/// Decide whether `kind` may grow given `live_count` existing resources
pub fn check_quota(
    license: Option<&License>,
    kind: ResourceKind,
    live_count: usize,
    now: DateTime<Utc>,
) -> QuotaDecision {
    let Some(license) = license else {
        return QuotaDecision::Deny(DenyReason::NoLicense);
    };

    match license.effective_status(now) {
        LicenseStatus::Active => {}
        LicenseStatus::Inactive => return QuotaDecision::Deny(DenyReason::Inactive),
        LicenseStatus::Expired => return QuotaDecision::Deny(DenyReason::Expired),
    }

    if kind != ResourceKind::Gateway {
        return QuotaDecision::Allow;
    }

    match license.gateway_limit() {
        Some(limit) if live_count >= limit as usize => QuotaDecision::Deny(DenyReason::LimitReached {
            limit,
            used: live_count,
        }),
        _ => QuotaDecision::Allow,
    }
}

/// Whether the license carries a capability tag
pub fn requires_feature(license: &License, feature: Feature) -> bool {
    license.features.contains(&feature)
}

/// Outcome of a license refresh
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Provider answered, license replaced
    Refreshed(License),
    /// Provider unreachable, still-valid cached license kept
    CachedFallback(License),
}

/// Entitlement Store
pub struct EntitlementStore {
    license: RwLock<Option<License>>,
    /// Last customer validated or restored; outlives a dropped license so
    /// refreshes keep retrying after an outage
    customer: RwLock<Option<String>>,
    provider: Arc<dyn EntitlementProvider>,
    cache: Option<LicenseCache>,
    timeout: Duration,
}

impl EntitlementStore {
    pub fn new(
        provider: Arc<dyn EntitlementProvider>,
        cache: Option<LicenseCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            license: RwLock::new(None),
            customer: RwLock::new(None),
            provider,
            cache,
            timeout,
        }
    }

    /// Currently held license, if any
    pub fn license(&self) -> Option<License> {
        self.license.read().clone()
    }

    /// Customer the store refreshes for, kept even when the license was dropped
    pub fn customer(&self) -> Option<String> {
        self.customer.read().clone()
    }

    /// License view with `gateways_used` taken from the live registry count
    pub fn license_info(&self, gateways_used: usize) -> Option<LicenseInfo> {
        let now = Utc::now();
        self.license.read().as_ref().map(|l| LicenseInfo {
            customer: l.customer.clone(),
            plan: l.plan,
            gateways_limit: l.gateway_limit(),
            gateways_used,
            status: l.effective_status(now),
            expires_at: l.expires_at,
            features: l.features.clone(),
        })
    }

    /// Quota decision against the held license
    pub fn check_quota(&self, kind: ResourceKind, live_count: usize) -> QuotaDecision {
        check_quota(self.license.read().as_ref(), kind, live_count, Utc::now())
    }

    /// Quota check as a `Result`
    pub fn ensure_allowed(&self, kind: ResourceKind, live_count: usize) -> Result<()> {
        let decision = self.check_quota(kind, live_count);
        if let QuotaDecision::Deny(reason) = decision {
            debug!("Denied {} mutation: {}", kind, reason);
        }
        decision.into_result(kind)
    }

    /// Mutations that never grow a counted resource only need an active license
    pub fn ensure_active(&self) -> Result<()> {
        let now = Utc::now();
        let reason = match self.license.read().as_ref() {
            None => DenyReason::NoLicense,
            Some(l) => match l.effective_status(now) {
                LicenseStatus::Active => return Ok(()),
                LicenseStatus::Inactive => DenyReason::Inactive,
                LicenseStatus::Expired => DenyReason::Expired,
            },
        };
        debug!("Denied mutation: {}", reason);
        Err(ControlError::LicenseInactive(reason.to_string()))
    }

    /// Whether the held license carries `feature`
    pub fn requires_feature(&self, feature: Feature) -> bool {
        self.license
            .read()
            .as_ref()
            .map_or(false, |l| requires_feature(l, feature))
    }

    /// Feature check as a `Result`
    pub fn ensure_feature(&self, feature: Feature) -> Result<()> {
        if self.requires_feature(feature) {
            Ok(())
        } else {
            Err(ControlError::FeatureNotEntitled(feature))
        }
    }

    /// Load the persisted license, used at startup
    pub fn restore(&self) -> Option<License> {
        let (key, license) = self.cache.as_ref()?.load()?;
        info!("Restored cached license for {} ({:?})", key, license.plan);
        *self.customer.write() = Some(key);
        *self.license.write() = Some(license.clone());
        Some(license)
    }

    /// Validate `customer` with the provider and replace the held license.
    ///
    /// The provider call happens without any lock held and is bounded by the
    /// configured timeout. When the provider is unavailable a held or cached
    /// license for the same customer is kept until it expires; after that the
    /// store degrades to deny-all.
    pub async fn refresh(&self, customer: &str) -> Result<RefreshOutcome> {
        *self.customer.write() = Some(customer.to_string());
        let call = self.provider.validate_license(customer);
        let validation = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(validation)) => validation,
            Ok(Err(err @ ControlError::ExternalUnavailable(_))) => {
                return self.fall_back(customer, err).await;
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let err = ControlError::ExternalUnavailable("billing provider timed out".into());
                return self.fall_back(customer, err).await;
            }
        };

        let license = validation.into_license(customer, Utc::now());
        info!(
            "License for {}: {:?} {:?}, expires {}",
            customer, license.plan, license.status, license.expires_at
        );

        if let Some(cache) = self.cache.clone() {
            let (key, record) = (customer.to_string(), license.clone());
            match tokio::task::spawn_blocking(move || cache.store(&key, &record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to persist license cache: {}", e),
                Err(e) => warn!("License cache task failed: {}", e),
            }
        }

        *self.license.write() = Some(license.clone());
        Ok(RefreshOutcome::Refreshed(license))
    }

    async fn fall_back(&self, customer: &str, err: ControlError) -> Result<RefreshOutcome> {
        let cached = match self.cache.clone() {
            Some(cache) => tokio::task::spawn_blocking(move || cache.load())
                .await
                .unwrap_or_else(|e| {
                    warn!("License cache task failed: {}", e);
                    None
                }),
            None => None,
        };
        let cached = cached
            .filter(|(key, _)| key == customer)
            .map(|(_, license)| license);

        let now = Utc::now();

        let usable = |l: &License| l.effective_status(now) == LicenseStatus::Active;

        let mut held = self.license.write();
        let candidate = held
            .clone()
            .filter(|l| l.customer == customer && usable(l))
            .or_else(|| cached.filter(|l| usable(l)));

        match candidate {
            Some(license) => {
                warn!(
                    "License refresh failed ({}), keeping cached license until {}",
                    err, license.expires_at
                );
                *held = Some(license.clone());
                Ok(RefreshOutcome::CachedFallback(license))
            }
            None => {
                warn!("License refresh failed ({}), no valid cached license: denying all", err);
                *held = None;
                Err(err)
            }
        }
    }

    /// Customer portal link for the held license
    pub async fn customer_portal_link(&self) -> Result<Option<String>> {
        let customer = self
            .customer()
            .ok_or_else(|| ControlError::LicenseInactive(DenyReason::NoLicense.to_string()))?;
        let call = self.provider.customer_portal_link(&customer);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::ExternalUnavailable("billing provider timed out".into())),
        }
    }

    /// Drop the held license and its cache
    pub fn deactivate(&self) -> Result<()> {
        info!("Deactivating license");
        *self.license.write() = None;
        *self.customer.write() = None;
        if let Some(cache) = &self.cache {
            cache.clear()?;
        }
        Ok(())
    }

    /// Install a license directly
    pub fn install(&self, license: License) {
        *self.customer.write() = Some(license.customer.clone());
        *self.license.write() = Some(license);
    }
}
