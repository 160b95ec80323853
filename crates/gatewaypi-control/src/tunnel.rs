//! Tunnel provisioning
//!
//! Key generation, install artifacts, and the seam towards the external
//! tunnel transport (WireGuard). The control plane never carries tunnel
//! traffic; it only tells the transport which peers are valid and asks it
//! to run LAN scans through connected gateways.

use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::info;

/// WireGuard key length (32 bytes for Curve25519)
pub const TUNNEL_KEY_LEN: usize = 32;

/// Name of the hub's tunnel interface on the VPS
pub const TUNNEL_INTERFACE: &str = "wg0";

/// Tunnel key pair, base64 encoded
#[derive(Clone)]
pub struct TunnelKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for TunnelKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelKeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a tunnel key pair from the OS CSPRNG
pub fn generate_keypair() -> TunnelKeyPair {
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);

    TunnelKeyPair {
        private_key: STANDARD.encode(secret.as_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// One-shot bootstrap payload for a gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallArtifact {
    pub gateway_id: String,
    pub command: String,
    pub tunnel_key: String,
    pub tunnel_subnet: Ipv4Network,
    pub tunnel_address: Ipv4Addr,
    pub hub_address: Ipv4Addr,
    pub vps_address: String,
    pub instructions: Vec<String>,
}

impl InstallArtifact {
    pub fn new(
        gateway_id: &str,
        vps_address: &str,
        install_script_url: &str,
        private_key: &str,
        tunnel_subnet: Ipv4Network,
        hub_address: Ipv4Addr,
    ) -> Self {
        let tunnel_address = crate::subnet::first_host(tunnel_subnet);
        let command = format!(
            "curl -fsSL {} | bash -s -- \\\n  --vps-ip=\"{}\" \\\n  --gateway-id=\"{}\" \\\n  --wireguard-key=\"{}\" \\\n  --tunnel-ip=\"{}/{}\"",
            install_script_url,
            vps_address,
            gateway_id,
            private_key,
            tunnel_address,
            tunnel_subnet.prefix(),
        );

        Self {
            gateway_id: gateway_id.to_string(),
            command,
            tunnel_key: private_key.to_string(),
            tunnel_subnet,
            tunnel_address,
            hub_address,
            vps_address: vps_address.to_string(),
            instructions: vec![
                "SSH into your gateway hardware".into(),
                "Paste and run the command above".into(),
                "The gateway will automatically connect to this VPS".into(),
                "Check the gateway list for connection status".into(),
            ],
        }
    }
}

/// Peer the tunnel transport should accept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProvision {
    pub gateway_id: String,
    pub public_key: String,
    pub tunnel_subnet: Ipv4Network,
    pub tunnel_address: Ipv4Addr,
}

/// Device found on the LAN behind a gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub ip: IpAddr,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Result of one LAN scan through a gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkScan {
    pub scan_id: String,
    pub gateway_id: String,
    pub devices: Vec<DiscoveredDevice>,
    pub timestamp: DateTime<Utc>,
}

impl NetworkScan {
    pub fn new(gateway_id: &str, devices: Vec<DiscoveredDevice>) -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        Self {
            scan_id: format!("scan_{}", &raw[..12]),
            gateway_id: gateway_id.to_string(),
            devices,
            timestamp: Utc::now(),
        }
    }
}

/// External tunnel transport
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Accept `peer`, replacing any previous key for the same gateway
    async fn provision_peer(&self, peer: &PeerProvision) -> Result<()>;

    /// Stop accepting the gateway's key
    async fn revoke_peer(&self, gateway_id: &str) -> Result<()>;

    /// Discover devices on the LAN behind the gateway
    async fn scan_network(&self, gateway_id: &str) -> Result<Vec<DiscoveredDevice>>;
}

/// Transport that only records requests in the log
#[derive(Debug, Default)]
pub struct LoggingTransport;

#[async_trait]
impl TunnelTransport for LoggingTransport {
    async fn provision_peer(&self, peer: &PeerProvision) -> Result<()> {
        info!(
            "Tunnel peer {} -> {} ({})",
            peer.gateway_id, peer.tunnel_address, peer.public_key
        );
        Ok(())
    }

    async fn revoke_peer(&self, gateway_id: &str) -> Result<()> {
        info!("Tunnel peer {} revoked", gateway_id);
        Ok(())
    }

    async fn scan_network(&self, gateway_id: &str) -> Result<Vec<DiscoveredDevice>> {
        info!("Network scan via {} requested, no agent attached", gateway_id);
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_shape() {
        let pair = generate_keypair();
        assert_eq!(pair.private_key.len(), 44);
        assert!(pair.private_key.ends_with('='));
        assert_eq!(STANDARD.decode(&pair.public_key).unwrap().len(), TUNNEL_KEY_LEN);
        assert_ne!(pair.private_key, generate_keypair().private_key);
        assert!(!format!("{:?}", pair).contains(&pair.private_key));
    }

    #[test]
    fn test_artifact_embeds_provisioning_data() {
        let subnet: Ipv4Network = "10.0.7.0/24".parse().unwrap();
        let artifact = InstallArtifact::new(
            "gw_abc",
            "45.67.89.123",
            "https://install.gatewaypi.com/install.sh",
            "KEY=",
            subnet,
            Ipv4Addr::new(10, 0, 0, 1),
        );

        assert!(artifact.command.contains("--vps-ip=\"45.67.89.123\""));
        assert!(artifact.command.contains("--gateway-id=\"gw_abc\""));
        assert!(artifact.command.contains("--wireguard-key=\"KEY=\""));
        assert!(artifact.command.contains("--tunnel-ip=\"10.0.7.1/24\""));
        assert_eq!(artifact.tunnel_address, Ipv4Addr::new(10, 0, 7, 1));
        assert_eq!(artifact.instructions.len(), 4);
    }
}
