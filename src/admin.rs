//! Kafka admin collaborator: applies and removes replication throttles.
//!
//! Throttle rates are Kafka dynamic config on the broker entity; the
//! throttled-replicas lists live on the topic entity and are managed by the
//! reconciler alongside these rate writes. This implementation targets
//! ZooKeeper-stored dynamic config through the metadata store; the
//! reconciler only sees the trait.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::zk::MetadataStore;

/// Dynamic config key capping leader (source) replication bandwidth.
pub const PROP_LEADER_RATE: &str = "leader.replication.throttled.rate";
/// Dynamic config key capping follower (destination) replication bandwidth.
pub const PROP_FOLLOWER_RATE: &str = "follower.replication.throttled.rate";
/// Dynamic config key listing a topic's throttled leader replicas.
pub const PROP_LEADER_REPLICAS: &str = "leader.replication.throttled.replicas";
/// Dynamic config key listing a topic's throttled follower replicas.
pub const PROP_FOLLOWER_REPLICAS: &str = "follower.replication.throttled.replicas";

/// Kafka expresses throttle rates in bytes/sec; the controller works in MB/s.
fn rate_to_bytes(rate_mbps: f64) -> String {
    format!("{:.0}", rate_mbps * 1_000_000.0)
}

/// Application of replication throttles to the cluster.
#[async_trait]
pub trait ThrottleAdmin: Send + Sync {
    /// Set the given role rates on one broker. A `None` role is left
    /// untouched — it is not cleared.
    async fn set_throttle(&self, broker: i32, source_mbps: Option<f64>, destination_mbps: Option<f64>) -> Result<()>;
    /// Remove both role rates from one broker.
    async fn remove_throttle(&self, broker: i32) -> Result<()>;
    /// Remove every throttle this controller manages: all broker rates and
    /// all topic throttled-replicas lists.
    async fn remove_all_throttles(&self) -> Result<()>;
    /// Ids of all registered brokers.
    async fn list_brokers(&self) -> Result<Vec<i32>>;
}

/// `ThrottleAdmin` over ZooKeeper-stored dynamic config.
pub struct ZkThrottleAdmin {
    meta: Arc<dyn MetadataStore>,
}

impl ZkThrottleAdmin {
    pub fn new(meta: Arc<dyn MetadataStore>) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl ThrottleAdmin for ZkThrottleAdmin {
    async fn set_throttle(&self, broker: i32, source_mbps: Option<f64>, destination_mbps: Option<f64>) -> Result<()> {
        let mut set = Vec::with_capacity(2);
        if let Some(rate) = source_mbps {
            set.push((PROP_LEADER_RATE.to_string(), rate_to_bytes(rate)));
        }
        if let Some(rate) = destination_mbps {
            set.push((PROP_FOLLOWER_RATE.to_string(), rate_to_bytes(rate)));
        }
        if set.is_empty() {
            return Ok(());
        }
        self.meta
            .update_broker_config(broker, &set, &[])
            .await
            .with_context(|| format!("error applying throttle config to broker {}", broker))
    }

    async fn remove_throttle(&self, broker: i32) -> Result<()> {
        self.meta
            .update_broker_config(broker, &[], &[PROP_LEADER_RATE.to_string(), PROP_FOLLOWER_RATE.to_string()])
            .await
            .with_context(|| format!("error removing throttle config from broker {}", broker))
    }

    async fn remove_all_throttles(&self) -> Result<()> {
        for broker in self.list_brokers().await? {
            self.remove_throttle(broker).await?;
        }
        for topic in self.meta.children("/config/topics").await? {
            self.meta
                .update_topic_config(&topic, &[], &[PROP_LEADER_REPLICAS.to_string(), PROP_FOLLOWER_REPLICAS.to_string()])
                .await
                .with_context(|| format!("error clearing throttled replicas for topic {}", topic))?;
        }
        Ok(())
    }

    async fn list_brokers(&self) -> Result<Vec<i32>> {
        self.meta.list_brokers().await
    }
}

#[cfg(test)]
mod admin_test {
    use super::*;
    use crate::fixtures::MemoryMeta;

    #[test]
    fn rates_convert_to_integer_bytes() {
        assert_eq!(rate_to_bytes(52.5), "52500000");
        assert_eq!(rate_to_bytes(10.0), "10000000");
    }

    #[tokio::test]
    async fn set_throttle_writes_only_the_given_roles() -> Result<()> {
        let meta = Arc::new(MemoryMeta::default());
        let admin = ZkThrottleAdmin::new(meta.clone());

        admin.set_throttle(3, Some(52.5), None).await?;

        let config = meta.broker_config(3);
        assert_eq!(config.get(PROP_LEADER_RATE), Some(&"52500000".to_string()));
        assert!(!config.contains_key(PROP_FOLLOWER_RATE), "an unset role must not be written: {:?}", config);
        Ok(())
    }

    #[tokio::test]
    async fn remove_all_clears_brokers_and_topics() -> Result<()> {
        let meta = Arc::new(MemoryMeta::default());
        meta.set_brokers(vec![1, 2]);
        let admin = ZkThrottleAdmin::new(meta.clone());

        admin.set_throttle(1, Some(20.0), Some(30.0)).await?;
        admin.set_throttle(2, Some(20.0), None).await?;
        meta.update_topic_config("T", &[(PROP_LEADER_REPLICAS.to_string(), "0:1".to_string())], &[])
            .await?;

        admin.remove_all_throttles().await?;

        for broker in [1, 2] {
            let config = meta.broker_config(broker);
            assert!(
                !config.contains_key(PROP_LEADER_RATE) && !config.contains_key(PROP_FOLLOWER_RATE),
                "broker {} still carries throttle config: {:?}",
                broker,
                config
            );
        }
        assert!(
            !meta.topic_config("T").contains_key(PROP_LEADER_REPLICAS),
            "topic T still carries a throttled replicas list"
        );
        Ok(())
    }

    #[tokio::test]
    async fn remove_throttle_is_idempotent() -> Result<()> {
        let meta = Arc::new(MemoryMeta::default());
        let admin = ZkThrottleAdmin::new(meta.clone());

        admin.remove_throttle(9).await?;
        admin.remove_throttle(9).await?;
        Ok(())
    }
}
