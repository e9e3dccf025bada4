//! Replication throttle rate calculation.
//!
//! A broker's nominal network capacity is looked up from its instance type.
//! The headroom left for replication is whatever remains of the role ceiling
//! (a configured percentage of capacity) once non-replication traffic is
//! subtracted. Live bandwidth already includes any replication in flight at
//! the currently applied throttle, so that amount is credited back before
//! the subtraction.

use std::collections::HashMap;

use thiserror::Error;

use crate::bandwidth::BrokerBandwidth;
use crate::config::Config;

/// The role a broker plays in a replication: leaders are sources of
/// replication traffic, followers are destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Errors from throttle rate calculation.
#[derive(Debug, Error)]
pub enum LimitsError {
    /// The limits configuration itself is unusable.
    #[error("invalid limits config: {0}")]
    InvalidConfig(String),
    /// The broker's instance type has no entry in the capacity map.
    #[error("no capacity configured for instance type {0}")]
    UnknownInstanceType(String),
}

/// Rate boundaries and the instance-type capacity model used to compute
/// per-broker replication throttle rates.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Floor for any applied rate, MB/s.
    minimum: f64,
    /// Ceiling for outbound (leader) replication as a percentage of capacity.
    source_max_pct: f64,
    /// Ceiling for inbound (follower) replication as a percentage of capacity.
    destination_max_pct: f64,
    /// Instance type to nominal network capacity, MB/s. Capacities are
    /// symmetric; the role percentage is applied on top.
    capacity_by_type: HashMap<String, f64>,
}

impl Limits {
    /// Build limits from runtime config, validating the boundaries.
    pub fn new(config: &Config) -> Result<Self, LimitsError> {
        if config.min_rate <= 0.0 {
            return Err(LimitsError::InvalidConfig(format!(
                "min-rate must be > 0, got {}",
                config.min_rate
            )));
        }
        for (name, pct) in [("max-tx-rate", config.max_tx_rate), ("max-rx-rate", config.max_rx_rate)] {
            if pct <= 0.0 || pct > 100.0 {
                return Err(LimitsError::InvalidConfig(format!("{} must be in (0, 100], got {}", name, pct)));
            }
        }
        if let Some((t, cap)) = config.cap_map.iter().find(|(_, cap)| **cap <= 0.0) {
            return Err(LimitsError::InvalidConfig(format!("capacity for instance type {} must be > 0, got {}", t, cap)));
        }
        Ok(Self {
            minimum: config.min_rate,
            source_max_pct: config.max_tx_rate,
            destination_max_pct: config.max_rx_rate,
            capacity_by_type: config.cap_map.clone(),
        })
    }

    /// The configured rate floor, MB/s.
    pub fn minimum(&self) -> f64 {
        self.minimum
    }

    /// Nominal network capacity for the given instance type, MB/s.
    pub fn capacity(&self, instance_type: &str) -> Result<f64, LimitsError> {
        self.capacity_by_type
            .get(instance_type)
            .copied()
            .ok_or_else(|| LimitsError::UnknownInstanceType(instance_type.to_string()))
    }

    /// The absolute rate ceiling for the given instance type and role, MB/s.
    pub fn ceiling(&self, instance_type: &str, role: Role) -> Result<f64, LimitsError> {
        let pct = match role {
            Role::Leader => self.source_max_pct,
            Role::Follower => self.destination_max_pct,
        };
        Ok(self.capacity(instance_type)? * pct / 100.0)
    }

    /// Compute a replication throttle rate for a broker in the given role.
    ///
    /// `current_throttle` is the rate most recently applied to this broker
    /// for this role (0.0 when none): the observed bandwidth counts any
    /// replication currently flowing at that rate, which is not client
    /// traffic and must not be held against the headroom.
    ///
    /// The result is clamped into `[minimum, ceiling]` — never zero, since a
    /// zero throttle would stall the reassignment outright.
    pub fn replication_headroom(
        &self,
        bandwidth: &BrokerBandwidth,
        role: Role,
        current_throttle: f64,
    ) -> Result<f64, LimitsError> {
        let observed = match role {
            Role::Leader => bandwidth.tx_mbps,
            Role::Follower => bandwidth.rx_mbps,
        };
        let ceiling = self.ceiling(&bandwidth.instance_type, role)?;
        let non_replication = (observed - current_throttle).max(0.0);
        let headroom = ceiling - non_replication;
        Ok(headroom.clamp(self.minimum, ceiling.max(self.minimum)))
    }
}
