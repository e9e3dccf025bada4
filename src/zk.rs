//! Cluster-metadata collaborator, backed by ZooKeeper.
//!
//! Everything the controller knows about the cluster — ongoing
//! reassignments, partition placement, broker registrations — is read from
//! the same ZooKeeper ensemble the brokers coordinate through, and throttle
//! configuration is written back as Kafka dynamic config. Each dynamic
//! config write is followed by a sequential change-notification znode so
//! brokers pick the change up without a restart.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zookeeper_async::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZooKeeper};

use crate::reassignments::{PartitionState, Reassignments};

/// Admin path listing partitions with an ongoing reassignment.
const PATH_REASSIGN_PARTITIONS: &str = "/admin/reassign_partitions";
/// Parent of per-broker registration znodes.
const PATH_BROKER_IDS: &str = "/brokers/ids";
/// Parent of per-entity dynamic config znodes.
const PATH_CONFIG_BROKERS: &str = "/config/brokers";
const PATH_CONFIG_TOPICS: &str = "/config/topics";
/// Parent of config change notifications, children are sequential.
const PATH_CONFIG_CHANGES: &str = "/config/changes/config_change_";

const SESSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Access to cluster metadata and the config namespaces stored beside it.
///
/// The raw get/set/delete/children operations address arbitrary paths (the
/// override store keeps its records in a dedicated namespace); the typed
/// operations cover the Kafka structures the reconciler reads and writes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read a node's data; `None` when the node does not exist.
    async fn get_raw(&self, path: &str) -> Result<Option<Vec<u8>>>;
    /// Write a node's data, creating the node (and any missing parents)
    /// first if needed.
    async fn set_raw(&self, path: &str, data: Vec<u8>) -> Result<()>;
    /// Delete a node; deleting a missing node is not an error.
    async fn delete_raw(&self, path: &str) -> Result<()>;
    /// List a node's children; a missing node reads as no children.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Partitions with an ongoing reassignment, as topic -> partition ->
    /// target replicas.
    async fn get_reassignments(&self) -> Result<Reassignments>;
    /// A partition's current leader and assigned replica set.
    async fn partition_state(&self, topic: &str, partition: i32) -> Result<PartitionState>;
    /// Ids of all registered brokers.
    async fn list_brokers(&self) -> Result<Vec<i32>>;
    /// Merge `set` into and strip `remove` from a broker's dynamic config,
    /// then notify.
    async fn update_broker_config(&self, broker: i32, set: &[(String, String)], remove: &[String]) -> Result<()>;
    /// Merge `set` into and strip `remove` from a topic's dynamic config,
    /// then notify.
    async fn update_topic_config(&self, topic: &str, set: &[(String, String)], remove: &[String]) -> Result<()>;
}

/// Payload of `/admin/reassign_partitions`.
#[derive(Debug, Deserialize)]
struct ReassignPartitionsData {
    #[serde(default)]
    partitions: Vec<ReassignPartition>,
}

#[derive(Debug, Deserialize)]
struct ReassignPartition {
    topic: String,
    partition: i32,
    replicas: Vec<i32>,
}

/// Payload of a topic assignment znode, mapping partition index to the
/// partition's assigned replica set.
#[derive(Debug, Deserialize)]
struct TopicAssignmentData {
    #[serde(default)]
    partitions: HashMap<String, Vec<i32>>,
}

/// Payload of a partition state znode.
#[derive(Debug, Deserialize)]
struct PartitionStateData {
    leader: i32,
}

/// Payload of a dynamic config znode.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EntityConfigData {
    version: u32,
    #[serde(default)]
    config: HashMap<String, String>,
}

/// Payload of a config change notification znode.
#[derive(Debug, Serialize)]
struct ConfigChangeData {
    version: u32,
    entity_path: String,
}

struct ConnectionWatcher;

impl Watcher for ConnectionWatcher {
    fn handle(&self, event: WatchedEvent) {
        tracing::debug!(event = ?event, "zookeeper session event");
    }
}

/// ZooKeeper-backed `MetadataStore`.
pub struct ZkHandler {
    zk: ZooKeeper,
    /// Optional namespace prefix prepended to every path.
    prefix: String,
}

impl ZkHandler {
    /// Connect to the ensemble. `prefix` namespaces every path when
    /// non-empty (a cluster running under a chroot-style prefix).
    pub async fn connect(addr: &str, prefix: &str) -> Result<Self> {
        let zk = ZooKeeper::connect(addr, SESSION_TIMEOUT, ConnectionWatcher)
            .await
            .with_context(|| format!("error connecting to zookeeper at {}", addr))?;
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("/{}", p),
        };
        Ok(Self { zk, prefix })
    }

    fn path(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    /// Create a node and any missing parents, tolerating races with other
    /// writers on the intermediate nodes.
    async fn create_recursive(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let sections: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if sections.is_empty() {
            bail!("cannot create the zookeeper root");
        }
        let mut current = String::new();
        for (idx, section) in sections.iter().enumerate() {
            current.push('/');
            current.push_str(section);
            let node_data = if idx == sections.len() - 1 { data.clone() } else { Vec::new() };
            match self.zk.create(&current, node_data, Acl::open_unsafe().clone(), CreateMode::Persistent).await {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(err) => return Err(err).with_context(|| format!("error creating znode {}", current)),
            }
        }
        Ok(())
    }

    /// Write a config change notification so brokers reload the entity.
    async fn notify_config_change(&self, entity_path: &str) -> Result<()> {
        let data = serde_json::to_vec(&ConfigChangeData {
            version: 2,
            entity_path: entity_path.to_string(),
        })?;
        let full = self.path(PATH_CONFIG_CHANGES);
        let res = self.zk.create(&full, data.clone(), Acl::open_unsafe().clone(), CreateMode::PersistentSequential).await;
        if let Err(ZkError::NoNode) = res {
            // First notification ever written to this ensemble: the parent
            // node does not exist yet.
            if let Some((parent, _)) = full.rsplit_once('/') {
                self.create_recursive(parent, Vec::new()).await?;
            }
            self.zk
                .create(&full, data, Acl::open_unsafe().clone(), CreateMode::PersistentSequential)
                .await
                .with_context(|| format!("error writing config change notification for {}", entity_path))?;
            return Ok(());
        }
        res.with_context(|| format!("error writing config change notification for {}", entity_path))?;
        Ok(())
    }

    /// Read-modify-write one entity's dynamic config and notify on change.
    async fn update_entity_config(&self, path: &str, entity_path: &str, set: &[(String, String)], remove: &[String]) -> Result<()> {
        let mut entity: EntityConfigData = match self.get_raw(path).await? {
            Some(data) => serde_json::from_slice(&data).with_context(|| format!("malformed config data at {}", path))?,
            None => EntityConfigData { version: 1, ..Default::default() },
        };

        let mut changed = false;
        for (key, value) in set {
            if entity.config.get(key) != Some(value) {
                entity.config.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        for key in remove {
            if entity.config.remove(key).is_some() {
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        self.set_raw(path, serde_json::to_vec(&entity)?).await?;
        self.notify_config_change(entity_path).await
    }
}

#[async_trait]
impl MetadataStore for ZkHandler {
    async fn get_raw(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.zk.get_data(&self.path(path), false).await {
            Ok((data, _stat)) => Ok(Some(data)),
            Err(ZkError::NoNode) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("error reading znode {}", path)),
        }
    }

    async fn set_raw(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let full = self.path(path);
        match self.zk.set_data(&full, data.clone(), None).await {
            Ok(_) => Ok(()),
            Err(ZkError::NoNode) => self.create_recursive(&full, data).await,
            Err(err) => Err(err).with_context(|| format!("error writing znode {}", path)),
        }
    }

    async fn delete_raw(&self, path: &str) -> Result<()> {
        match self.zk.delete(&self.path(path), None).await {
            Ok(()) | Err(ZkError::NoNode) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("error deleting znode {}", path)),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.zk.get_children(&self.path(path), false).await {
            Ok(children) => Ok(children),
            Err(ZkError::NoNode) => Ok(Vec::new()),
            Err(err) => Err(err).with_context(|| format!("error listing children of {}", path)),
        }
    }

    async fn get_reassignments(&self) -> Result<Reassignments> {
        let data = match self.get_raw(PATH_REASSIGN_PARTITIONS).await? {
            Some(data) => data,
            None => return Ok(Reassignments::default()),
        };
        let parsed: ReassignPartitionsData = serde_json::from_slice(&data).context("malformed reassign_partitions data")?;

        let mut reassignments = Reassignments::default();
        for p in parsed.partitions {
            reassignments.entry(p.topic).or_default().insert(p.partition, p.replicas);
        }
        Ok(reassignments)
    }

    async fn partition_state(&self, topic: &str, partition: i32) -> Result<PartitionState> {
        // The assigned replica set lives on the topic node; the state znode
        // only carries leadership and sync state. An assigned replica that
        // has fallen out of sync is still a replica, so the ISR is not a
        // substitute here.
        let assignment_path = format!("/brokers/topics/{}", topic);
        let data = self
            .get_raw(&assignment_path)
            .await?
            .with_context(|| format!("no assignment found for topic {}", topic))?;
        let assignment: TopicAssignmentData =
            serde_json::from_slice(&data).with_context(|| format!("malformed topic assignment for {}", topic))?;
        let replicas = assignment
            .partitions
            .get(&partition.to_string())
            .cloned()
            .with_context(|| format!("no assignment found for {}-{}", topic, partition))?;

        let state_path = format!("/brokers/topics/{}/partitions/{}/state", topic, partition);
        let data = self
            .get_raw(&state_path)
            .await?
            .with_context(|| format!("no state found for {}-{}", topic, partition))?;
        let state: PartitionStateData =
            serde_json::from_slice(&data).with_context(|| format!("malformed partition state for {}-{}", topic, partition))?;

        Ok(PartitionState {
            leader: state.leader,
            replicas,
        })
    }

    async fn list_brokers(&self) -> Result<Vec<i32>> {
        let mut ids: Vec<i32> = self
            .children(PATH_BROKER_IDS)
            .await?
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn update_broker_config(&self, broker: i32, set: &[(String, String)], remove: &[String]) -> Result<()> {
        self.update_entity_config(&format!("{}/{}", PATH_CONFIG_BROKERS, broker), &format!("brokers/{}", broker), set, remove)
            .await
    }

    async fn update_topic_config(&self, topic: &str, set: &[(String, String)], remove: &[String]) -> Result<()> {
        self.update_entity_config(&format!("{}/{}", PATH_CONFIG_TOPICS, topic), &format!("topics/{}", topic), set, remove)
            .await
    }
}
