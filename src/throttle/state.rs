//! Per-broker throttle rates by replication role.

use std::collections::HashMap;

use crate::limits::Role;

/// A source and destination throttle rate for one broker, MB/s.
///
/// `None` means no rate applies to that role for the broker's part in the
/// current reassignment — distinct from `Some(0.0)`, which would say the
/// broker plays the role but has no headroom. The reconciler never writes a
/// zero rate, but the distinction must survive here: a role that is unset is
/// skipped entirely when applying throttles.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThrottleByRole {
    /// Leader (source) rate.
    pub source: Option<f64>,
    /// Follower (destination) rate.
    pub destination: Option<f64>,
}

impl ThrottleByRole {
    /// The rate for the given role, if set.
    pub fn rate(&self, role: Role) -> Option<f64> {
        match role {
            Role::Leader => self.source,
            Role::Follower => self.destination,
        }
    }

    /// Set the rate for the given role.
    pub fn set_rate(&mut self, role: Role, rate: f64) {
        match role {
            Role::Leader => self.source = Some(rate),
            Role::Follower => self.destination = Some(rate),
        }
    }

    /// True when neither role carries a rate.
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.destination.is_none()
    }
}

/// Broker id to per-role rates. Used both for the rates computed within a
/// tick and for the record of what was last applied to the cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatesByBroker {
    rates: HashMap<i32, ThrottleByRole>,
}

impl RatesByBroker {
    /// The rate applied to a broker for a role, if any.
    pub fn rate(&self, broker: i32, role: Role) -> Option<f64> {
        self.rates.get(&broker).and_then(|t| t.rate(role))
    }

    /// Store a rate for one broker and role.
    pub fn store(&mut self, broker: i32, role: Role, rate: f64) {
        self.rates.entry(broker).or_default().set_rate(role, rate);
    }

    /// Store the same rate for both roles of one broker.
    pub fn store_both(&mut self, broker: i32, rate: f64) {
        self.store(broker, Role::Leader, rate);
        self.store(broker, Role::Follower, rate);
    }

    /// Replace every set rate with the given one, leaving unset roles unset.
    pub fn replace_set_rates(&mut self, rate: f64) {
        for entry in self.rates.values_mut() {
            if entry.source.is_some() {
                entry.source = Some(rate);
            }
            if entry.destination.is_some() {
                entry.destination = Some(rate);
            }
        }
    }

    /// Replace the set rates of a single broker, leaving unset roles unset.
    pub fn replace_broker_rates(&mut self, broker: i32, rate: f64) {
        if let Some(entry) = self.rates.get_mut(&broker) {
            if entry.source.is_some() {
                entry.source = Some(rate);
            }
            if entry.destination.is_some() {
                entry.destination = Some(rate);
            }
        }
    }

    /// Iterate brokers and their per-role rates.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &ThrottleByRole)> {
        self.rates.iter().map(|(id, t)| (*id, t))
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Drop all recorded rates.
    pub fn clear(&mut self) {
        self.rates.clear();
    }
}
