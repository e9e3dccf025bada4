//! Reassignment view: which topics are moving, and which brokers play
//! which replication role in the move.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::zk::MetadataStore;

/// Topic name to partition index to target replica set. Presence of a
/// partition here means it is currently being moved.
pub type Reassignments = HashMap<String, HashMap<i32, Vec<i32>>>;

/// The current state of one partition, read from cluster metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionState {
    /// The broker currently leading the partition.
    pub leader: i32,
    /// The partition's assigned replica set, including any replica that has
    /// fallen out of sync.
    pub replicas: Vec<i32>,
}

/// One moving partition: its current placement and its target placement.
#[derive(Debug, Clone)]
pub struct PartitionMove {
    pub topic: String,
    pub partition: i32,
    /// Replica set before the move completes.
    pub current: Vec<i32>,
    /// The broker leading the partition while it moves.
    pub leader: i32,
    /// Replica set the reassignment is converging on.
    pub target: Vec<i32>,
}

impl PartitionMove {
    /// Brokers acting as replication sources for this partition: those
    /// losing their replica, plus the current leader (which serves the
    /// replication reads even when it keeps its replica).
    pub fn sources(&self) -> HashSet<i32> {
        let mut src: HashSet<i32> = self.current.iter().copied().filter(|b| !self.target.contains(b)).collect();
        src.insert(self.leader);
        src
    }

    /// Brokers gaining a replica of this partition.
    pub fn destinations(&self) -> HashSet<i32> {
        self.target.iter().copied().filter(|b| !self.current.contains(b)).collect()
    }
}

/// Broker ids participating in the current reassignments, by role. A broker
/// may appear in both `src` and `dst`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReassigningBrokers {
    pub src: HashSet<i32>,
    pub dst: HashSet<i32>,
    pub all: HashSet<i32>,
}

/// One observation of the cluster's reassignment state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Raw reassignment data: topic to partition to target replicas.
    pub reassignments: Reassignments,
    /// Per-partition move detail, used to build topic throttled-replicas lists.
    pub moves: Vec<PartitionMove>,
    /// Role classification over all moves.
    pub brokers: ReassigningBrokers,
}

impl Snapshot {
    /// The set of topics currently reassigning.
    pub fn topics(&self) -> HashSet<String> {
        self.reassignments.keys().cloned().collect()
    }

    /// The moves belonging to one topic.
    pub fn moves_for_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a PartitionMove> {
        self.moves.iter().filter(move |m| m.topic == topic)
    }
}

/// Observe the cluster's ongoing reassignments and classify the brokers
/// involved.
///
/// A partition whose current state cannot be read is skipped with a warning
/// rather than failing the snapshot: the remaining partitions still yield a
/// usable (if partial) view, and metadata is re-read next tick anyway.
pub async fn snapshot(meta: &dyn MetadataStore) -> Result<Snapshot> {
    let reassignments = meta.get_reassignments().await?;

    let mut moves = Vec::new();
    let mut brokers = ReassigningBrokers::default();
    for (topic, partitions) in &reassignments {
        for (&partition, target) in partitions {
            let state = match meta.partition_state(topic, partition).await {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(topic = %topic, partition, error = ?err, "error reading partition state, skipping partition");
                    continue;
                }
            };
            let mv = PartitionMove {
                topic: topic.clone(),
                partition,
                current: state.replicas,
                leader: state.leader,
                target: target.clone(),
            };
            brokers.src.extend(mv.sources());
            brokers.dst.extend(mv.destinations());
            moves.push(mv);
        }
    }
    brokers.all = brokers.src.union(&brokers.dst).copied().collect();
    moves.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.partition.cmp(&b.partition)));

    Ok(Snapshot {
        reassignments,
        moves,
        brokers,
    })
}
