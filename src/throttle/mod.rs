//! Throttle reconciler.
//!
//! ## Overview
//! The controller observes ongoing partition reassignments and continuously
//! reconciles per-broker replication throttle rates onto the cluster. Each
//! tick snapshots the reassignment state, classifies every involved broker
//! as a replication source, destination or both, computes a rate per role
//! from live bandwidth and the capacity model, folds in operator overrides,
//! and writes only the rates that changed enough to matter.
//!
//! ## States
//! Idle until a reassignment appears; throttling while one runs. When the
//! last reassignment finishes — or after `cleanup-after` idle intervals,
//! covering throttles left behind by an earlier process — every throttle is
//! removed cluster-wide. Too many consecutive apply failures degrade the
//! controller to writing the minimum rate everywhere until a write lands.
//!
//! Throttles are never rolled back on shutdown: a successor process (or the
//! idle cleanup of a fresh one) is expected to take over, which is also why
//! `known_throttles` starts out true.

pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use crate::admin::{ThrottleAdmin, PROP_FOLLOWER_REPLICAS, PROP_LEADER_REPLICAS};
use crate::bandwidth::BandwidthSource;
use crate::config::Config;
use crate::events::EventWriter;
use crate::limits::{Limits, Role};
use crate::overrides::{BrokerOverride, OverrideConfig, OverrideStore};
use crate::reassignments::{self, ReassigningBrokers, Snapshot};
use crate::throttle::state::RatesByBroker;
use crate::zk::MetadataStore;

const METRIC_TICKS: &str = "autothrottle_ticks";
const METRIC_THROTTLE_WRITES: &str = "autothrottle_throttle_writes";
const METRIC_WRITE_ERRORS: &str = "autothrottle_throttle_write_errors";
const METRIC_CLEANUPS: &str = "autothrottle_throttle_cleanups";

/// The reconciler. Owns all throttle state; collaborators are only reached
/// through their seams so the tick logic is testable in isolation.
pub struct ThrottleCtl {
    /// Runtime config.
    config: Arc<Config>,
    /// Cluster metadata, also carrying the topic throttled-replicas lists.
    meta: Arc<dyn MetadataStore>,
    /// Throttle application.
    admin: Arc<dyn ThrottleAdmin>,
    /// Live broker bandwidth.
    bandwidth: Arc<dyn BandwidthSource>,
    /// Operator overrides, read fresh every tick.
    overrides: OverrideStore,
    /// Operator-visible notices.
    events: EventWriter,
    /// Rate boundaries and the capacity model.
    limits: Limits,

    /// Rates most recently applied to the cluster, by broker and role.
    applied: RatesByBroker,
    /// Topics observed reassigning at the previous tick.
    topics_prev: HashSet<String>,
    /// Brokers observed reassigning at the previous tick.
    brokers_prev: HashSet<i32>,
    /// Consecutive ticks that failed to apply throttles.
    failures: u32,
    /// Whether the cluster may be carrying throttles this controller should
    /// clean up. True at startup: an earlier process may have left some.
    known_throttles: bool,
    /// Idle ticks since the last cleanup.
    idle_intervals: u64,
    /// When set, per-topic throttled-replicas lists are not republished
    /// this tick (no new topics started reassigning, the published lists
    /// still hold).
    skip_topic_updates: bool,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ThrottleCtl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        meta: Arc<dyn MetadataStore>,
        admin: Arc<dyn ThrottleAdmin>,
        bandwidth: Arc<dyn BandwidthSource>,
        overrides: OverrideStore,
        events: EventWriter,
        limits: Limits,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        metrics::describe_counter!(METRIC_TICKS, "reconcile ticks run");
        metrics::describe_counter!(METRIC_THROTTLE_WRITES, "throttle rates written to brokers");
        metrics::describe_counter!(METRIC_WRITE_ERRORS, "failed throttle write attempts");
        metrics::describe_counter!(METRIC_CLEANUPS, "cluster-wide throttle removals");
        Self {
            config,
            meta,
            admin,
            bandwidth,
            overrides,
            events,
            limits,
            applied: RatesByBroker::default(),
            topics_prev: HashSet::new(),
            brokers_prev: HashSet::new(),
            failures: 0,
            known_throttles: true,
            idle_intervals: 0,
            skip_topic_updates: false,
            shutdown_rx: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval));
        // A tick that overruns the interval is dropped rather than queued,
        // so load cannot compound into a backlog of stale observations.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval = self.config.interval, "throttle reconciler initialized");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("throttle reconciler shutting down");
        Ok(())
    }

    /// One reconcile pass.
    async fn tick(&mut self) {
        metrics::increment_counter!(METRIC_TICKS);

        let snap = match reassignments::snapshot(self.meta.as_ref()).await {
            Ok(snap) => snap,
            Err(err) => {
                tracing::error!(error = ?err, "error observing reassignments, skipping tick");
                return;
            }
        };
        let topics_now = snap.topics();
        let brokers_now = snap.brokers.all.clone();

        let mut topics_done: Vec<String> = self.topics_prev.difference(&topics_now).cloned().collect();
        if !topics_done.is_empty() {
            topics_done.sort();
            let list = topics_done.join(", ");
            tracing::info!(topics = %list, "topics done reassigning");
            self.events.write("Topics done reassigning", &format!("Topics done reassigning: {}", list));
        }
        let brokers_done: Vec<i32> = self.brokers_prev.difference(&brokers_now).copied().collect();
        if !brokers_done.is_empty() {
            tracing::debug!(brokers = ?brokers_done, "brokers done replicating");
        }

        // When no topic started reassigning since the previous tick, the
        // published throttled-replicas lists are still accurate and need not
        // be pushed through the cluster again. Checked against the previous
        // tick's set, before promotion below.
        self.skip_topic_updates = topics_now.is_subset(&self.topics_prev);

        // Override reads are non-fatal: a failed read falls back to no
        // override for this tick.
        let global = match self.overrides.get_global().await {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = ?err, "error reading global throttle override");
                OverrideConfig::default()
            }
        };
        let mut broker_overrides = match self.overrides.list_broker_overrides().await {
            Ok(overrides) => overrides,
            Err(err) => {
                tracing::warn!(error = ?err, "error reading broker throttle overrides");
                HashMap::new()
            }
        };

        if !topics_now.is_empty() {
            self.reconcile_active(&snap, &global, &mut broker_overrides).await;
        }

        // Broker-specific overrides apply whether or not a reassignment is
        // running; participants were already folded into the path above.
        self.apply_standalone_overrides(&broker_overrides).await;

        if topics_now.is_empty() {
            self.reconcile_idle(&global, &broker_overrides).await;
        }

        self.topics_prev = topics_now;
        self.brokers_prev = brokers_now;
    }

    /// Compute and apply throttles for an active reassignment.
    async fn reconcile_active(&mut self, snap: &Snapshot, global: &OverrideConfig, broker_overrides: &mut HashMap<i32, BrokerOverride>) {
        let mut topics: Vec<&String> = snap.reassignments.keys().collect();
        topics.sort();
        tracing::info!(topics = ?topics, "topics with ongoing reassignments");

        let min = self.limits.minimum();
        let degraded = self.failures > self.config.failure_threshold;
        let mut capacities = if degraded {
            tracing::warn!(failures = self.failures, "over the failure threshold, falling back to the minimum rate everywhere");
            Self::floor_capacities(&snap.brokers, min)
        } else {
            match self.compute_capacities(snap).await {
                Some(capacities) => capacities,
                None => return,
            }
        };

        // A global override supersedes every computed rate, clamped to the
        // floor like any other rate.
        if global.is_set() {
            let rate = (global.rate as f64).max(min);
            tracing::info!(rate, "global throttle override in effect");
            capacities.replace_set_rates(rate);
        }

        // Broker overrides for brokers inside the reassignment supersede
        // that broker's rates; the record is marked as a participant so the
        // standalone pass below leaves it alone.
        for (id, o) in broker_overrides.iter_mut() {
            if !o.config.is_set() || !snap.brokers.all.contains(id) {
                continue;
            }
            capacities.replace_broker_rates(*id, (o.config.rate as f64).max(min));
            if !o.reassignment_participant {
                o.reassignment_participant = true;
                if let Err(err) = self.overrides.set_broker_override(o).await {
                    tracing::warn!(broker = *id, error = ?err, "error marking broker override as a reassignment participant");
                }
            }
        }

        let (wrote, errors) = self.apply_rates(&capacities, degraded).await;
        if errors == 0 || wrote > 0 {
            // A successful apply anywhere in the tick (or nothing needing a
            // write at all) counts as recovery.
            self.known_throttles = true;
            self.failures = 0;
        } else {
            self.failures += 1;
            tracing::error!(failures = self.failures, threshold = self.config.failure_threshold, "failed to apply any throttle this tick");
        }

        if !self.skip_topic_updates {
            self.update_topic_replica_lists(snap).await;
        }
    }

    /// The degraded fallback: the floor rate on every applicable role of
    /// every reassigning broker.
    fn floor_capacities(brokers: &ReassigningBrokers, min: f64) -> RatesByBroker {
        let mut capacities = RatesByBroker::default();
        for &broker in &brokers.all {
            if brokers.src.contains(&broker) {
                capacities.store(broker, Role::Leader, min);
            }
            if brokers.dst.contains(&broker) {
                capacities.store(broker, Role::Follower, min);
            }
        }
        capacities
    }

    /// Build the per-broker, per-role rate map for this tick. `None` means
    /// no rates could be determined at all (counts as a failed tick).
    async fn compute_capacities(&mut self, snap: &Snapshot) -> Option<RatesByBroker> {
        let mut capacities = RatesByBroker::default();

        let bandwidth = match self.bandwidth.broker_bandwidth().await {
            Ok(bandwidth) => bandwidth,
            Err(err) => {
                // Without metrics no throttle decision can be made, which
                // does count toward the failure threshold.
                self.failures += 1;
                tracing::error!(error = ?err, failures = self.failures, "error fetching broker bandwidth, skipping throttle updates");
                return None;
            }
        };

        for &broker in &snap.brokers.all {
            let measurement = match bandwidth.get(&broker) {
                Some(measurement) => measurement,
                None => {
                    tracing::warn!(broker, "broker not found in bandwidth metrics, skipping");
                    continue;
                }
            };
            for role in [Role::Leader, Role::Follower] {
                let in_role = match role {
                    Role::Leader => snap.brokers.src.contains(&broker),
                    Role::Follower => snap.brokers.dst.contains(&broker),
                };
                if !in_role {
                    continue;
                }
                // The bandwidth observed includes replication flowing at
                // whatever rate was last applied for this role.
                let current = self.applied.rate(broker, role).unwrap_or(0.0);
                match self.limits.replication_headroom(measurement, role, current) {
                    Ok(rate) => capacities.store(broker, role, rate),
                    Err(err) => {
                        tracing::warn!(broker, role = %role, error = %err, "error computing throttle rate, skipping broker");
                    }
                }
            }
        }
        Some(capacities)
    }

    /// Write every rate that is newly applicable or changed beyond the
    /// threshold, recording successful writes in the applied state.
    ///
    /// `force` bypasses the change-threshold gate: the degraded floor must
    /// land on every broker, even one whose last applied rate is already
    /// near the minimum.
    async fn apply_rates(&mut self, capacities: &RatesByBroker, force: bool) -> (u32, u32) {
        let (mut wrote, mut errors) = (0u32, 0u32);
        let mut notice = Vec::new();

        let mut brokers: Vec<_> = capacities.iter().collect();
        brokers.sort_by_key(|(broker, _)| *broker);
        for (broker, rates) in brokers {
            if rates.is_empty() {
                continue;
            }
            let source = rates.source.filter(|r| force || self.should_write(broker, Role::Leader, *r));
            let destination = rates.destination.filter(|r| force || self.should_write(broker, Role::Follower, *r));
            if source.is_none() && destination.is_none() {
                continue;
            }
            match self.admin.set_throttle(broker, source, destination).await {
                Ok(()) => {
                    for (role, rate) in [(Role::Leader, source), (Role::Follower, destination)] {
                        if let Some(rate) = rate {
                            self.applied.store(broker, role, rate);
                            wrote += 1;
                            metrics::increment_counter!(METRIC_THROTTLE_WRITES);
                            tracing::info!(broker, role = %role, rate, "applied replication throttle");
                            notice.push(format!("broker {} {}: {:.2} MB/s", broker, role, rate));
                        }
                    }
                }
                Err(err) => {
                    errors += 1;
                    metrics::increment_counter!(METRIC_WRITE_ERRORS);
                    tracing::error!(broker, error = ?err, "error applying replication throttle");
                }
            }
        }

        if wrote > 0 {
            self.events.write("Replication throttles set", &notice.join("\n"));
        }
        (wrote, errors)
    }

    /// Republish each reassigning topic's throttled-replicas lists.
    async fn update_topic_replica_lists(&mut self, snap: &Snapshot) {
        for topic in snap.reassignments.keys() {
            let mut leader_entries = Vec::new();
            let mut follower_entries = Vec::new();
            for mv in snap.moves_for_topic(topic) {
                let mut sources: Vec<i32> = mv.sources().into_iter().collect();
                sources.sort_unstable();
                leader_entries.extend(sources.into_iter().map(|b| format!("{}:{}", mv.partition, b)));
                let mut destinations: Vec<i32> = mv.destinations().into_iter().collect();
                destinations.sort_unstable();
                follower_entries.extend(destinations.into_iter().map(|b| format!("{}:{}", mv.partition, b)));
            }

            let mut set = Vec::new();
            let mut remove = Vec::new();
            for (prop, entries) in [(PROP_LEADER_REPLICAS, leader_entries), (PROP_FOLLOWER_REPLICAS, follower_entries)] {
                if entries.is_empty() {
                    remove.push(prop.to_string());
                } else {
                    set.push((prop.to_string(), entries.join(",")));
                }
            }
            if let Err(err) = self.meta.update_topic_config(topic, &set, &remove).await {
                tracing::warn!(topic = %topic, error = ?err, "error updating topic throttled replicas list");
            }
        }
    }

    /// Apply broker overrides that are not part of a reassignment.
    async fn apply_standalone_overrides(&mut self, broker_overrides: &HashMap<i32, BrokerOverride>) {
        for (&broker, o) in broker_overrides {
            if !o.config.is_set() || o.reassignment_participant {
                continue;
            }
            let rate = (o.config.rate as f64).max(self.limits.minimum());
            let source = Some(rate).filter(|r| self.should_write(broker, Role::Leader, *r));
            let destination = Some(rate).filter(|r| self.should_write(broker, Role::Follower, *r));
            if source.is_none() && destination.is_none() {
                continue;
            }
            match self.admin.set_throttle(broker, source, destination).await {
                Ok(()) => {
                    self.applied.store_both(broker, rate);
                    metrics::increment_counter!(METRIC_THROTTLE_WRITES);
                    tracing::info!(broker, rate, "applied broker throttle override");
                    self.events
                        .write("Broker throttle override applied", &format!("broker {}: {:.2} MB/s", broker, rate));
                }
                Err(err) => {
                    metrics::increment_counter!(METRIC_WRITE_ERRORS);
                    tracing::error!(broker, error = ?err, "error applying broker throttle override");
                }
            }
        }
    }

    /// Idle housekeeping: cluster-wide throttle removal and override
    /// expiry.
    async fn reconcile_idle(&mut self, global: &OverrideConfig, broker_overrides: &HashMap<i32, BrokerOverride>) {
        tracing::info!("no topics undergoing reassignment");
        self.idle_intervals += 1;

        if self.known_throttles || self.idle_intervals == self.config.cleanup_after {
            self.idle_intervals = 0;
            match self.admin.remove_all_throttles().await {
                Ok(()) => {
                    metrics::increment_counter!(METRIC_CLEANUPS);
                    self.applied.clear();
                    self.known_throttles = false;
                    tracing::info!("removed all replication throttles");
                    self.events.write("Replication throttles removed", "All replication throttles were removed");
                }
                Err(err) => {
                    // known_throttles stays set, so removal is retried next
                    // tick.
                    tracing::error!(error = ?err, "error removing throttles");
                }
            }
            self.skip_topic_updates = false;
        }

        if global.autoremove {
            match self.overrides.clear_global().await {
                Ok(()) => {
                    tracing::info!("global throttle override removed");
                    self.events.write("Global throttle override removed", "The global throttle override was cleared");
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "error removing global throttle override");
                }
            }
        }

        // Participant records outlived their reassignment: expire the ones
        // marked for automatic removal, reset the rest for standalone use.
        for (&broker, o) in broker_overrides {
            if !o.reassignment_participant {
                continue;
            }
            if o.config.autoremove {
                match self.overrides.delete_broker_override(broker).await {
                    Ok(()) => {
                        tracing::info!(broker, "broker throttle override removed");
                        self.events
                            .write("Broker throttle override removed", &format!("The override for broker {} was removed", broker));
                    }
                    Err(err) => {
                        tracing::warn!(broker, error = ?err, "error removing broker throttle override");
                    }
                }
            } else {
                let mut reset = o.clone();
                reset.reassignment_participant = false;
                if let Err(err) = self.overrides.set_broker_override(&reset).await {
                    tracing::warn!(broker, error = ?err, "error resetting broker override participant state");
                }
            }
        }
    }

    /// Whether a newly computed rate differs enough from the last applied
    /// rate to be worth a write. A role with no prior rate is always
    /// written.
    fn should_write(&self, broker: i32, role: Role, new_rate: f64) -> bool {
        match self.applied.rate(broker, role) {
            None => true,
            Some(old) if old == 0.0 => true,
            Some(old) => ((new_rate - old) / old * 100.0).abs() >= self.config.change_threshold,
        }
    }
}
