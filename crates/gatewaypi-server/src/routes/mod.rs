//! API Routes

pub mod dns;
pub mod gateways;
pub mod health;
pub mod license;
pub mod network;
pub mod routing;
pub mod vps;
