//! In-memory collaborator fakes for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use structopt::StructOpt;

use crate::bandwidth::{BandwidthSource, BrokerBandwidth, BrokerBandwidthMap};
use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::reassignments::{PartitionState, Reassignments};
use crate::zk::MetadataStore;

/// Build a config from the defaults plus the given extra flags.
pub fn test_config(extra: &[&str]) -> Config {
    let mut args = vec!["autothrottle"];
    args.extend_from_slice(extra);
    Config::from_iter(args)
}

/// In-memory `MetadataStore`: a flat znode map plus typed reassignment and
/// partition-state records, with broker/topic dynamic config tracked the
/// way the ZooKeeper layout tracks it.
#[derive(Default)]
pub struct MemoryMeta {
    nodes: Mutex<HashMap<String, Vec<u8>>>,
    reassignments: Mutex<Reassignments>,
    partition_states: Mutex<HashMap<(String, i32), PartitionState>>,
    brokers: Mutex<Vec<i32>>,
    broker_configs: Mutex<HashMap<i32, HashMap<String, String>>>,
    topic_configs: Mutex<HashMap<String, HashMap<String, String>>>,
    fail_reassignments: AtomicBool,
    config_notifications: Mutex<Vec<String>>,
}

impl MemoryMeta {
    pub fn add_reassignment(&self, topic: &str, partition: i32, target: Vec<i32>) {
        self.reassignments
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .insert(partition, target);
    }

    pub fn clear_reassignments(&self) {
        self.reassignments.lock().unwrap().clear();
    }

    pub fn set_partition_state(&self, topic: &str, partition: i32, state: PartitionState) {
        self.partition_states.lock().unwrap().insert((topic.to_string(), partition), state);
    }

    pub fn set_brokers(&self, brokers: Vec<i32>) {
        *self.brokers.lock().unwrap() = brokers;
    }

    /// Make reassignment reads fail until reset.
    pub fn fail_reassignments(&self, fail: bool) {
        self.fail_reassignments.store(fail, Ordering::SeqCst);
    }

    pub fn broker_config(&self, broker: i32) -> HashMap<String, String> {
        self.broker_configs.lock().unwrap().get(&broker).cloned().unwrap_or_default()
    }

    pub fn topic_config(&self, topic: &str) -> HashMap<String, String> {
        self.topic_configs.lock().unwrap().get(topic).cloned().unwrap_or_default()
    }

    /// Entity paths that received a config change notification, in order.
    pub fn notifications(&self) -> Vec<String> {
        self.config_notifications.lock().unwrap().clone()
    }

    fn apply_config(config: &mut HashMap<String, String>, set: &[(String, String)], remove: &[String]) {
        for (key, value) in set {
            config.insert(key.clone(), value.clone());
        }
        for key in remove {
            config.remove(key);
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMeta {
    async fn get_raw(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.nodes.lock().unwrap().get(path).cloned())
    }

    async fn set_raw(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.nodes.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    async fn delete_raw(&self, path: &str) -> Result<()> {
        self.nodes.lock().unwrap().remove(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        if path == "/config/topics" {
            return Ok(self.topic_configs.lock().unwrap().keys().cloned().collect());
        }
        let nodes = self.nodes.lock().unwrap();
        let prefix = format!("{}/", path);
        let mut children: Vec<String> = nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        children.sort();
        Ok(children)
    }

    async fn get_reassignments(&self) -> Result<Reassignments> {
        if self.fail_reassignments.load(Ordering::SeqCst) {
            bail!("injected reassignment read failure");
        }
        Ok(self.reassignments.lock().unwrap().clone())
    }

    async fn partition_state(&self, topic: &str, partition: i32) -> Result<PartitionState> {
        match self.partition_states.lock().unwrap().get(&(topic.to_string(), partition)) {
            Some(state) => Ok(state.clone()),
            None => bail!("no state found for {}-{}", topic, partition),
        }
    }

    async fn list_brokers(&self) -> Result<Vec<i32>> {
        Ok(self.brokers.lock().unwrap().clone())
    }

    async fn update_broker_config(&self, broker: i32, set: &[(String, String)], remove: &[String]) -> Result<()> {
        let mut configs = self.broker_configs.lock().unwrap();
        Self::apply_config(configs.entry(broker).or_default(), set, remove);
        self.config_notifications.lock().unwrap().push(format!("brokers/{}", broker));
        Ok(())
    }

    async fn update_topic_config(&self, topic: &str, set: &[(String, String)], remove: &[String]) -> Result<()> {
        let mut configs = self.topic_configs.lock().unwrap();
        Self::apply_config(configs.entry(topic.to_string()).or_default(), set, remove);
        self.config_notifications.lock().unwrap().push(format!("topics/{}", topic));
        Ok(())
    }
}

/// A call recorded by `MockAdmin`.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCall {
    Set {
        broker: i32,
        source: Option<f64>,
        destination: Option<f64>,
    },
    Remove(i32),
    RemoveAll,
}

/// `ThrottleAdmin` fake recording every call, with injectable failures.
#[derive(Default)]
pub struct MockAdmin {
    calls: Mutex<Vec<AdminCall>>,
    brokers: Mutex<Vec<i32>>,
    fail_sets: AtomicBool,
    fail_removes: AtomicBool,
}

impl MockAdmin {
    pub fn set_brokers(&self, brokers: Vec<i32>) {
        *self.brokers.lock().unwrap() = brokers;
    }

    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AdminCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// The set calls recorded, keyed by broker.
    pub fn sets_by_broker(&self) -> HashMap<i32, (Option<f64>, Option<f64>)> {
        let mut sets = HashMap::new();
        for call in self.calls.lock().unwrap().iter() {
            if let AdminCall::Set { broker, source, destination } = call {
                let entry = sets.entry(*broker).or_insert((None, None));
                if source.is_some() {
                    entry.0 = *source;
                }
                if destination.is_some() {
                    entry.1 = *destination;
                }
            }
        }
        sets
    }

    pub fn remove_all_count(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches!(c, AdminCall::RemoveAll)).count()
    }
}

#[async_trait]
impl crate::admin::ThrottleAdmin for MockAdmin {
    async fn set_throttle(&self, broker: i32, source_mbps: Option<f64>, destination_mbps: Option<f64>) -> Result<()> {
        if self.fail_sets.load(Ordering::SeqCst) {
            bail!("injected set_throttle failure");
        }
        self.calls.lock().unwrap().push(AdminCall::Set {
            broker,
            source: source_mbps,
            destination: destination_mbps,
        });
        Ok(())
    }

    async fn remove_throttle(&self, broker: i32) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            bail!("injected remove_throttle failure");
        }
        self.calls.lock().unwrap().push(AdminCall::Remove(broker));
        Ok(())
    }

    async fn remove_all_throttles(&self) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            bail!("injected remove_all_throttles failure");
        }
        self.calls.lock().unwrap().push(AdminCall::RemoveAll);
        Ok(())
    }

    async fn list_brokers(&self) -> Result<Vec<i32>> {
        Ok(self.brokers.lock().unwrap().clone())
    }
}

/// `BandwidthSource` fake returning a fixed measurement map.
#[derive(Default)]
pub struct StaticBandwidth {
    map: Mutex<BrokerBandwidthMap>,
    fail: AtomicBool,
}

impl StaticBandwidth {
    /// Symmetric tx/rx bandwidth for a set of brokers on one instance type.
    pub fn set(&self, readings: &[(i32, f64, f64)]) {
        let mut map = self.map.lock().unwrap();
        map.clear();
        for (broker, tx, rx) in readings {
            map.insert(
                *broker,
                BrokerBandwidth {
                    tx_mbps: *tx,
                    rx_mbps: *rx,
                    instance_type: "m5.xlarge".to_string(),
                },
            );
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BandwidthSource for StaticBandwidth {
    async fn broker_bandwidth(&self) -> Result<BrokerBandwidthMap> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("injected bandwidth fetch failure");
        }
        Ok(self.map.lock().unwrap().clone())
    }
}

/// `EventSink` fake capturing every posted event.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<Event>>,
}

impl CapturingSink {
    pub fn titles(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.title.clone()).collect()
    }
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn post(&self, event: &Event, _tags: &[String]) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
