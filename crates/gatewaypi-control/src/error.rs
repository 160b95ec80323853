//! Error types for the control plane

use crate::entitlement::{Feature, ResourceKind};
use crate::forwards::Protocol;
use thiserror::Error;

/// Control plane error type
#[derive(Error, Debug)]
pub enum ControlError {
    /// Plan quota reached for a resource kind
    #[error("quota exceeded for {resource}: limit {limit}")]
    QuotaExceeded { resource: ResourceKind, limit: u32 },

    /// No usable license (missing, inactive or expired)
    #[error("license inactive: {0}")]
    LicenseInactive(String),

    /// Capability not included in the current plan
    #[error("feature not entitled: {0}")]
    FeatureNotEntitled(Feature),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Route path already registered
    #[error("duplicate route path: {0}")]
    DuplicatePath(String),

    /// Public port already claimed by an enabled forward or reserved
    #[error("port {port}/{protocol} already in use")]
    PortInUse { port: u16, protocol: Protocol },

    /// Route target list or target definition rejected
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Request field failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Every target of the route is unhealthy
    #[error("no healthy target for route {0}")]
    NoHealthyTarget(String),

    /// Tunnel key changed while another install artifact was being issued
    #[error("tunnel key for {0} changed concurrently")]
    KeyConflict(String),

    /// Tunnel subnet pool has no free /24 left
    #[error("tunnel subnet pool exhausted")]
    SubnetPoolExhausted,

    /// Billing provider, tunnel transport or monitor unreachable or timed out
    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Stable machine-readable code, used in API envelopes
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::LicenseInactive(_) => "LICENSE_INACTIVE",
            Self::FeatureNotEntitled(_) => "FEATURE_NOT_ENTITLED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicatePath(_) => "DUPLICATE_PATH",
            Self::PortInUse { .. } => "PORT_IN_USE",
            Self::InvalidTarget(_) => "INVALID_TARGET",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NoHealthyTarget(_) => "NO_HEALTHY_TARGET",
            Self::KeyConflict(_) => "KEY_CONFLICT",
            Self::SubnetPoolExhausted => "SUBNET_POOL_EXHAUSTED",
            Self::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type for the control plane
pub type Result<T> = std::result::Result<T, ControlError>;
