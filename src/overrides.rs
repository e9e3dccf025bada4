//! Operator throttle overrides, persisted beside the cluster metadata.
//!
//! The override namespace is the only mutable state shared between the
//! admin API and the reconciler: the API writes records here, the
//! reconciler reads them fresh every tick. A single znode holds the global
//! override; its children hold per-broker records keyed by broker id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::zk::MetadataStore;

/// A throttle override. A rate of 0 means no override is in effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideConfig {
    /// Override rate in MB/s.
    #[serde(default)]
    pub rate: u64,
    /// Remove the override once no reassignments are running.
    #[serde(default)]
    pub autoremove: bool,
}

impl OverrideConfig {
    /// Whether this record actually overrides anything.
    pub fn is_set(&self) -> bool {
        self.rate > 0
    }
}

/// A broker-specific throttle override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOverride {
    /// Broker ID.
    pub id: i32,
    /// Whether the broker was part of a reassignment while this override was
    /// active. Participant records are folded into the reassignment path and
    /// become eligible for automatic removal once the reassignment finishes.
    #[serde(default)]
    pub reassignment_participant: bool,
    /// The override itself.
    pub config: OverrideConfig,
}

/// Store for the global and per-broker overrides.
///
/// All operations are idempotent. The global record is cleared by writing
/// an empty config rather than deleting the znode, since the per-broker
/// records live underneath it.
#[derive(Clone)]
pub struct OverrideStore {
    meta: Arc<dyn MetadataStore>,
    global_path: String,
}

impl OverrideStore {
    pub fn new(meta: Arc<dyn MetadataStore>, config_prefix: &str) -> Self {
        let global_path = format!("/{}/override", config_prefix.trim_matches('/'));
        Self { meta, global_path }
    }

    fn broker_path(&self, broker: i32) -> String {
        format!("{}/{}", self.global_path, broker)
    }

    /// The global override; a missing record reads as no override.
    pub async fn get_global(&self) -> Result<OverrideConfig> {
        match self.meta.get_raw(&self.global_path).await? {
            Some(data) if !data.is_empty() => {
                serde_json::from_slice(&data).context("malformed global throttle override config")
            }
            _ => Ok(OverrideConfig::default()),
        }
    }

    pub async fn set_global(&self, config: OverrideConfig) -> Result<()> {
        let data = serde_json::to_vec(&config)?;
        self.meta
            .set_raw(&self.global_path, data)
            .await
            .context("error writing global throttle override")
    }

    /// Reset the global override to an empty record.
    pub async fn clear_global(&self) -> Result<()> {
        self.set_global(OverrideConfig::default()).await
    }

    /// All per-broker overrides, keyed by broker id. Records that fail to
    /// parse are skipped with a warning so one bad znode cannot hide the
    /// rest.
    pub async fn list_broker_overrides(&self) -> Result<HashMap<i32, BrokerOverride>> {
        let mut overrides = HashMap::new();
        for child in self.meta.children(&self.global_path).await? {
            let id: i32 = match child.parse() {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(znode = %child, "ignoring non-broker child of the override namespace");
                    continue;
                }
            };
            match self.get_broker_override(id).await {
                Ok(Some(o)) => {
                    overrides.insert(id, o);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(broker = id, error = ?err, "error reading broker override, skipping");
                }
            }
        }
        Ok(overrides)
    }

    pub async fn get_broker_override(&self, broker: i32) -> Result<Option<BrokerOverride>> {
        match self.meta.get_raw(&self.broker_path(broker)).await? {
            Some(data) if !data.is_empty() => {
                let o = serde_json::from_slice(&data)
                    .with_context(|| format!("malformed throttle override config for broker {}", broker))?;
                Ok(Some(o))
            }
            _ => Ok(None),
        }
    }

    pub async fn set_broker_override(&self, o: &BrokerOverride) -> Result<()> {
        let data = serde_json::to_vec(o)?;
        self.meta
            .set_raw(&self.broker_path(o.id), data)
            .await
            .with_context(|| format!("error writing throttle override for broker {}", o.id))
    }

    pub async fn delete_broker_override(&self, broker: i32) -> Result<()> {
        self.meta
            .delete_raw(&self.broker_path(broker))
            .await
            .with_context(|| format!("error deleting throttle override for broker {}", broker))
    }
}
