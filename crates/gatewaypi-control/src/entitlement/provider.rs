//! Entitlement providers
//!
//! The billing backend answering "what may this customer do". Two variants
//! sit behind [`EntitlementProvider`]: [`LiveBackend`] talks to the billing
//! provider over HTTPS, [`SimulatedBackend`] serves a configured account set
//! in-process. The variant is picked once, from configuration.

use super::{Feature, License, LicenseStatus, Plan};
use crate::config::{BackendConfig, SimulatedAccount};
use crate::error::{ControlError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Billing provider seam
#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    /// Validate the license held by `customer`
    async fn validate_license(&self, customer: &str) -> Result<LicenseValidation>;

    /// Self-service portal link for `customer`, if the provider has one
    async fn customer_portal_link(&self, customer: &str) -> Result<Option<String>>;
}

/// Provider answer to a validation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseValidation {
    pub valid: bool,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub status: Option<LicenseStatus>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gateways_limit: Option<u32>,
    /// Capability tags; plan defaults apply when absent
    #[serde(default)]
    pub features: Option<Vec<String>>,
}

impl LicenseValidation {
    /// Answer for an unknown customer
    pub fn invalid() -> Self {
        Self {
            valid: false,
            plan: None,
            status: Some(LicenseStatus::Inactive),
            expires_at: None,
            gateways_limit: None,
            features: None,
        }
    }

    /// Active license on `plan` for `days` days
    pub fn active(plan: Plan, days: i64) -> Self {
        Self {
            valid: true,
            plan: Some(plan),
            status: Some(LicenseStatus::Active),
            expires_at: Some(Utc::now() + chrono::Duration::days(days)),
            gateways_limit: plan.default_gateway_limit(),
            features: None,
        }
    }

    /// Normalize into a [`License`] for `customer`
    pub fn into_license(self, customer: &str, now: DateTime<Utc>) -> License {
        let plan = self.plan.unwrap_or(Plan::Starter);
        let status = match (self.valid, self.plan) {
            (true, Some(_)) => self.status.unwrap_or(LicenseStatus::Active),
            _ => LicenseStatus::Inactive,
        };

        let features = match self.features {
            Some(tags) => tags
                .iter()
                .filter_map(|tag| match tag.parse::<Feature>() {
                    Ok(feature) => Some(feature),
                    Err(_) => {
                        debug!("Ignoring unknown feature tag {}", tag);
                        None
                    }
                })
                .collect(),
            None if status == LicenseStatus::Active => plan.default_features(),
            None => BTreeSet::new(),
        };

        License {
            customer: customer.to_string(),
            plan,
            gateways_limit: self.gateways_limit.or_else(|| plan.default_gateway_limit()),
            status,
            expires_at: self.expires_at.unwrap_or(now),
            features,
        }
    }
}

/// Build the provider selected by configuration
pub fn build_provider(config: &BackendConfig, timeout: Duration) -> Result<Arc<dyn EntitlementProvider>> {
    match config {
        BackendConfig::Simulated { accounts } => {
            info!("Using simulated entitlement backend ({} accounts)", accounts.len());
            Ok(Arc::new(SimulatedBackend::from_accounts(accounts)))
        }
        BackendConfig::Live { base_url, api_key } => {
            info!("Using live entitlement backend at {}", base_url);
            Ok(Arc::new(LiveBackend::new(base_url, api_key.clone(), timeout)?))
        }
    }
}

/// Billing provider reached over HTTPS
pub struct LiveBackend {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl LiveBackend {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Config(format!("billing client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn unavailable(e: reqwest::Error) -> ControlError {
    ControlError::ExternalUnavailable(format!("billing provider: {}", e))
}

#[async_trait]
impl EntitlementProvider for LiveBackend {
    async fn validate_license(&self, customer: &str) -> Result<LicenseValidation> {
        let url = format!("{}/v1/licenses/validate", self.base_url);
        debug!("POST {}", url);

        let response = self
            .authorize(self.client.post(&url))
            .json(&serde_json::json!({ "customer": customer }))
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(LicenseValidation::invalid());
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ControlError::ExternalUnavailable(format!("billing provider {}: {}", status, text)));
        }

        response.json().await.map_err(unavailable)
    }

    async fn customer_portal_link(&self, customer: &str) -> Result<Option<String>> {
        let url = format!("{}/v1/customers/portal", self.base_url);
        debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("customer", customer)])
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(ControlError::ExternalUnavailable(format!("billing provider {}", status)));
        }

        let portal: PortalResponse = response.json().await.map_err(unavailable)?;
        Ok(portal.url)
    }
}

#[derive(Debug, Deserialize)]
struct PortalResponse {
    url: Option<String>,
}

/// In-process provider for development and tests
pub struct SimulatedBackend {
    accounts: RwLock<HashMap<String, LicenseValidation>>,
    available: AtomicBool,
}

impl SimulatedBackend {
    pub fn from_accounts(accounts: &[SimulatedAccount]) -> Self {
        let accounts = accounts
            .iter()
            .map(|a| (a.customer.clone(), LicenseValidation::active(a.plan, a.valid_days)))
            .collect();

        Self {
            accounts: RwLock::new(accounts),
            available: AtomicBool::new(true),
        }
    }

    /// Add or replace an account
    pub fn insert(&self, customer: &str, validation: LicenseValidation) {
        self.accounts.write().insert(customer.to_string(), validation);
    }

    /// Simulate the provider going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlError::ExternalUnavailable("simulated billing outage".into()))
        }
    }
}

#[async_trait]
impl EntitlementProvider for SimulatedBackend {
    async fn validate_license(&self, customer: &str) -> Result<LicenseValidation> {
        self.ensure_available()?;
        Ok(self
            .accounts
            .read()
            .get(customer)
            .cloned()
            .unwrap_or_else(LicenseValidation::invalid))
    }

    async fn customer_portal_link(&self, customer: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let known = self.accounts.read().contains_key(customer);
        Ok(known.then(|| format!("https://billing.gatewaypi.com/portal?customer={}", customer)))
    }
}
