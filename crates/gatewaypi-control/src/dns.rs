//! DNS Zone
//!
//! Hostname records served by the VPS resolver, plus query counters reported
//! back by it.

use crate::entitlement::{EntitlementStore, ResourceKind};
use crate::error::{ControlError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// DNS record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    pub hostname: String,
    pub ip: IpAddr,
    pub description: String,
    pub ttl: u32,
    pub gateway_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordSpec {
    pub hostname: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default)]
    pub gateway_id: Option<String>,
}

fn default_ttl() -> u32 {
    300
}

/// Query statistics; totals are derived so hits + misses always equals total
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsStats {
    pub cache_hits: u64,
    pub cache_miss: u64,
    pub total_queries: u64,
    /// Hit ratio in `[0, 1]`, 1 when nothing was queried yet
    pub success_rate: f64,
    /// Mean resolver latency over timed queries, none before the first one
    pub avg_response_time_ms: Option<f64>,
    pub records: usize,
}

/// Case-insensitive, trailing dot ignored
pub fn normalize_hostname(hostname: &str) -> Result<String> {
    let name = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid {
        Ok(name)
    } else {
        Err(ControlError::InvalidInput(format!("invalid hostname: {:?}", hostname)))
    }
}

/// DNS Zone
pub struct DnsZone {
    records: RwLock<BTreeMap<String, DnsRecord>>,
    hits: AtomicU64,
    misses: AtomicU64,
    timed_queries: AtomicU64,
    response_micros: AtomicU64,
}

impl DnsZone {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timed_queries: AtomicU64::new(0),
            response_micros: AtomicU64::new(0),
        }
    }

    /// Insert or overwrite the record for a hostname
    pub fn upsert_record(&self, entitlements: &EntitlementStore, spec: DnsRecordSpec) -> Result<DnsRecord> {
        let hostname = normalize_hostname(&spec.hostname)?;
        if spec.ttl == 0 {
            return Err(ControlError::InvalidInput("ttl must be positive".into()));
        }

        let mut records = self.records.write();
        entitlements.ensure_allowed(ResourceKind::DnsRecord, records.len())?;

        let record = DnsRecord {
            hostname: hostname.clone(),
            ip: spec.ip,
            description: spec.description.trim().to_string(),
            ttl: spec.ttl,
            gateway_id: spec.gateway_id,
            updated_at: Utc::now(),
        };

        match records.insert(hostname, record.clone()) {
            Some(previous) if previous.ip != record.ip => {
                info!("DNS {} {} -> {}", record.hostname, previous.ip, record.ip)
            }
            Some(_) => {}
            None => info!("DNS {} -> {}", record.hostname, record.ip),
        }
        Ok(record)
    }

    pub fn remove_record(&self, entitlements: &EntitlementStore, hostname: &str) -> Result<DnsRecord> {
        let hostname = normalize_hostname(hostname)?;
        let mut records = self.records.write();
        entitlements.ensure_active()?;
        let record = records
            .remove(&hostname)
            .ok_or_else(|| ControlError::NotFound(format!("dns record {}", hostname)))?;
        info!("Removed DNS record {}", hostname);
        Ok(record)
    }

    pub fn lookup(&self, hostname: &str) -> Option<DnsRecord> {
        let hostname = normalize_hostname(hostname).ok()?;
        self.records.read().get(&hostname).cloned()
    }

    pub fn list(&self) -> Vec<DnsRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Count one resolver query
    pub fn record_query(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add one resolver latency sample to the average
    pub fn record_response_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.response_micros.fetch_add(micros, Ordering::Relaxed);
        self.timed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DnsStats {
        let cache_hits = self.hits.load(Ordering::Relaxed);
        let cache_miss = self.misses.load(Ordering::Relaxed);
        let total_queries = cache_hits + cache_miss;
        let success_rate = if total_queries == 0 {
            1.0
        } else {
            cache_hits as f64 / total_queries as f64
        };
        let timed = self.timed_queries.load(Ordering::Relaxed);
        let avg_response_time_ms = (timed > 0)
            .then(|| self.response_micros.load(Ordering::Relaxed) as f64 / timed as f64 / 1000.0);

        DnsStats {
            cache_hits,
            cache_miss,
            total_queries,
            success_rate,
            avg_response_time_ms,
            records: self.records.read().len(),
        }
    }

    /// Drop every record bound to `gateway_id`; returns removed hostnames
    pub fn purge_gateway(&self, gateway_id: &str) -> Vec<String> {
        let mut records = self.records.write();
        let removed: Vec<String> = records
            .values()
            .filter(|r| r.gateway_id.as_deref() == Some(gateway_id))
            .map(|r| r.hostname.clone())
            .collect();

        for hostname in &removed {
            records.remove(hostname);
        }
        if !removed.is_empty() {
            info!("Purged {} DNS records of {}", removed.len(), gateway_id);
        }
        removed
    }
}

impl Default for DnsZone {
    fn default() -> Self {
        Self::new()
    }
}
