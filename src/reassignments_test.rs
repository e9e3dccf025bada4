use std::collections::HashSet;
use std::sync::Arc;

use super::*;
use crate::fixtures::MemoryMeta;
use crate::reassignments::{snapshot, PartitionMove, PartitionState};

fn brokers(ids: &[i32]) -> HashSet<i32> {
    ids.iter().copied().collect()
}

#[test]
fn classification_splits_sources_and_destinations() {
    // {1,2,3} -> {1,2,4}: broker 3 is losing its replica, broker 4 gaining
    // one, broker 1 leads and serves the replication reads.
    let mv = PartitionMove {
        topic: "T".into(),
        partition: 0,
        current: vec![1, 2, 3],
        leader: 1,
        target: vec![1, 2, 4],
    };

    assert_eq!(mv.sources(), brokers(&[1, 3]));
    assert_eq!(mv.destinations(), brokers(&[4]));
}

#[test]
fn a_broker_can_be_both_source_and_destination() {
    // Broker 3 leads a partition it is losing while gaining a replica of
    // the same topic elsewhere; the roles are tracked independently.
    let losing = PartitionMove {
        topic: "T".into(),
        partition: 0,
        current: vec![3, 1],
        leader: 3,
        target: vec![1, 2],
    };
    let gaining = PartitionMove {
        topic: "T".into(),
        partition: 1,
        current: vec![1, 2],
        leader: 1,
        target: vec![1, 3],
    };

    assert!(losing.sources().contains(&3));
    assert!(gaining.destinations().contains(&3));
}

#[tokio::test]
async fn snapshot_builds_the_role_sets() -> anyhow::Result<()> {
    let meta = Arc::new(MemoryMeta::default());
    meta.add_reassignment("T", 0, vec![1, 2, 4]);
    meta.add_reassignment("T", 1, vec![1, 2, 4]);
    meta.set_partition_state("T", 0, PartitionState { leader: 1, replicas: vec![1, 2, 3] });
    meta.set_partition_state("T", 1, PartitionState { leader: 2, replicas: vec![1, 2, 3] });

    let snap = snapshot(meta.as_ref()).await?;

    assert_eq!(snap.topics(), ["T".to_string()].into_iter().collect());
    assert_eq!(snap.brokers.src, brokers(&[1, 2, 3]), "leaders and the leaving broker are sources");
    assert_eq!(snap.brokers.dst, brokers(&[4]));
    assert_eq!(snap.brokers.all, brokers(&[1, 2, 3, 4]));
    assert_eq!(snap.moves_for_topic("T").count(), 2);
    Ok(())
}

#[tokio::test]
async fn snapshot_skips_partitions_with_unreadable_state() -> anyhow::Result<()> {
    let meta = Arc::new(MemoryMeta::default());
    meta.add_reassignment("T", 0, vec![1, 4]);
    meta.add_reassignment("T", 1, vec![2, 5]);
    // Only partition 0 has readable state.
    meta.set_partition_state("T", 0, PartitionState { leader: 1, replicas: vec![1, 3] });

    let snap = snapshot(meta.as_ref()).await?;

    assert_eq!(snap.moves.len(), 1, "the unreadable partition must be skipped, not fail the snapshot");
    assert_eq!(snap.brokers.all, brokers(&[1, 3, 4]));
    Ok(())
}

#[tokio::test]
async fn snapshot_with_no_reassignments_is_empty() -> anyhow::Result<()> {
    let meta = Arc::new(MemoryMeta::default());
    let snap = snapshot(meta.as_ref()).await?;
    assert!(snap.topics().is_empty());
    assert!(snap.brokers.all.is_empty());
    Ok(())
}
