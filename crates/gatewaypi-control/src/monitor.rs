//! Background monitors

use crate::entitlement::RefreshOutcome;
use crate::ControlPlane;
use std::sync::Arc;
use std::time::Duration;

/// Periodically disconnect gateways whose heartbeats went quiet
pub async fn start_liveness_monitor(plane: Arc<ControlPlane>) {
    let period = Duration::from_secs(plane.config().liveness_interval_secs);
    tracing::info!("Starting liveness monitor (every {:?})", period);

    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;

        let stale = plane.sweep_stale();
        if !stale.is_empty() {
            tracing::warn!("{} gateways disconnected: {}", stale.len(), stale.join(", "));
        }
    }
}

/// Periodically re-validate the held license with the billing provider
pub async fn start_license_refresher(plane: Arc<ControlPlane>) {
    let period = Duration::from_secs(plane.config().license_refresh_secs.max(1));
    tracing::info!("Starting license refresher (every {:?})", period);

    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; startup already restored the cache
    interval.tick().await;

    loop {
        interval.tick().await;
        refresh_once(&plane).await;
    }
}

/// One refresh round for the last known customer, a no-op before any activation
pub async fn refresh_once(plane: &ControlPlane) -> Option<RefreshOutcome> {
    let customer = plane.entitlements.customer()?;

    match plane.entitlements.refresh(&customer).await {
        Ok(outcome) => {
            tracing::debug!("License refresh for {}: {:?}", customer, outcome);
            Some(outcome)
        }
        Err(e) => {
            tracing::warn!("License refresh for {} failed: {}", customer, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::entitlement::tests::license;
    use crate::entitlement::{LicenseValidation, Plan, SimulatedBackend};
    use crate::gateway::GatewaySpec;
    use crate::tunnel::LoggingTransport;

    fn plane_with(backend: Arc<SimulatedBackend>, config: ControlConfig) -> Arc<ControlPlane> {
        Arc::new(ControlPlane::with_components(config, backend, Arc::new(LoggingTransport)).unwrap())
    }

    #[tokio::test]
    async fn test_refresh_once_picks_up_plan_change() {
        let backend = Arc::new(SimulatedBackend::from_accounts(&[]));
        backend.insert("ops@example.com", LicenseValidation::active(Plan::Enterprise, 30));
        let plane = plane_with(backend, ControlConfig::default());

        assert!(refresh_once(&plane).await.is_none());

        plane.entitlements.install(license(Plan::Starter));
        let outcome = refresh_once(&plane).await;
        assert!(matches!(outcome, Some(RefreshOutcome::Refreshed(ref l)) if l.plan == Plan::Enterprise));
    }

    #[tokio::test]
    async fn test_refresh_recovers_after_outage_past_expiry() {
        let backend = Arc::new(SimulatedBackend::from_accounts(&[]));
        let plane = plane_with(backend.clone(), ControlConfig::default());
        let mut expired = license(Plan::Professional);
        expired.expires_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        plane.entitlements.install(expired);

        backend.set_available(false);
        assert!(refresh_once(&plane).await.is_none());
        assert!(plane.entitlements.license().is_none());

        backend.set_available(true);
        backend.insert("ops@example.com", LicenseValidation::active(Plan::Professional, 30));
        let outcome = refresh_once(&plane).await;
        assert!(matches!(outcome, Some(RefreshOutcome::Refreshed(_))));
        assert!(plane.entitlements.ensure_active().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_monitor_marks_stale() {
        let config = ControlConfig {
            stale_after_secs: 60,
            liveness_interval_secs: 10,
            ..ControlConfig::default()
        };
        let plane = plane_with(Arc::new(SimulatedBackend::from_accounts(&[])), config);
        plane.entitlements.install(license(Plan::Starter));
        let gw = plane
            .register_gateway(GatewaySpec {
                name: "edge-1".into(),
                ..Default::default()
            })
            .unwrap();

        // Last heartbeat well past the threshold
        plane
            .gateways
            .mark_seen(
                &gw.id,
                "203.0.113.9".parse().unwrap(),
                chrono::Utc::now() - chrono::Duration::seconds(600),
            )
            .unwrap();
        assert!(plane.gateways.get(&gw.id).unwrap().connected);

        let task = tokio::spawn(start_liveness_monitor(plane.clone()));
        tokio::time::sleep(Duration::from_secs(11)).await;
        task.abort();

        assert!(!plane.gateways.get(&gw.id).unwrap().connected);
    }
}
