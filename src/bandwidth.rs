//! Broker bandwidth metrics collaborator.
//!
//! The reconciler needs, for every broker, its live outbound and inbound
//! bandwidth over a trailing window plus its instance type. The production
//! implementation queries the Datadog timeseries API with one query per
//! direction and joins the resulting series by the broker id tag.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Config;

/// Bytes-per-second to MB/s, matching the unit the throttle rates use.
const BYTES_PER_MB: f64 = 1_000_000.0;

/// A broker's observed bandwidth over the metrics window.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerBandwidth {
    /// Outbound bandwidth, MB/s.
    pub tx_mbps: f64,
    /// Inbound bandwidth, MB/s.
    pub rx_mbps: f64,
    /// The broker's instance type tag, used for capacity lookups.
    pub instance_type: String,
}

/// Broker id to observed bandwidth.
pub type BrokerBandwidthMap = HashMap<i32, BrokerBandwidth>;

/// A source of live broker bandwidth measurements.
#[async_trait]
pub trait BandwidthSource: Send + Sync {
    /// Fetch bandwidth for all brokers reporting within the configured window.
    async fn broker_bandwidth(&self) -> Result<BrokerBandwidthMap>;
}

/// Datadog-backed bandwidth source.
pub struct DatadogBandwidth {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    app_key: String,
    tx_query: String,
    rx_query: String,
    broker_id_tag: String,
    window_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    scope: String,
    #[serde(default)]
    pointlist: Vec<(f64, Option<f64>)>,
}

impl DatadogBandwidth {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.datadoghq.com".to_string(),
            api_key: config.api_key.clone(),
            app_key: config.app_key.clone(),
            tx_query: config.net_tx_query.clone(),
            rx_query: config.net_rx_query.clone(),
            broker_id_tag: config.broker_id_tag.clone(),
            window_seconds: config.metrics_window,
        }
    }

    /// Run one timeseries query and reduce each returned series to an
    /// averaged MB/s value keyed by broker id. Series missing the broker id
    /// tag or the instance-type tag are skipped.
    async fn query(&self, query: &str) -> Result<HashMap<i32, (f64, String)>> {
        let to = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before the unix epoch")?
            .as_secs();
        let from = to.saturating_sub(self.window_seconds);

        let response: QueryResponse = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .header("DD-API-KEY", &self.api_key)
            .header("DD-APPLICATION-KEY", &self.app_key)
            .query(&[("from", from.to_string()), ("to", to.to_string()), ("query", query.to_string())])
            .send()
            .await
            .context("error issuing metrics query")?
            .error_for_status()
            .context("metrics query rejected")?
            .json()
            .await
            .context("error decoding metrics query response")?;

        let mut by_broker = HashMap::new();
        for series in &response.series {
            let tags = parse_scope(&series.scope);
            let broker_id = match tags.get(self.broker_id_tag.as_str()).and_then(|v| v.parse::<i32>().ok()) {
                Some(id) => id,
                None => {
                    tracing::debug!(scope = %series.scope, "series missing usable broker id tag, skipping");
                    continue;
                }
            };
            let instance_type = match tags.get("instance-type") {
                Some(t) => (*t).to_string(),
                None => {
                    tracing::debug!(broker = broker_id, "series missing instance-type tag, skipping");
                    continue;
                }
            };
            let points: Vec<f64> = series.pointlist.iter().filter_map(|(_, v)| *v).collect();
            if points.is_empty() {
                continue;
            }
            let avg = points.iter().sum::<f64>() / points.len() as f64;
            by_broker.insert(broker_id, (avg / BYTES_PER_MB, instance_type));
        }
        Ok(by_broker)
    }
}

#[async_trait]
impl BandwidthSource for DatadogBandwidth {
    async fn broker_bandwidth(&self) -> Result<BrokerBandwidthMap> {
        let tx = self.query(&self.tx_query).await.context("outbound bandwidth query failed")?;
        let mut rx = self.query(&self.rx_query).await.context("inbound bandwidth query failed")?;

        // Join on broker id; a broker present in only one direction has an
        // incomplete picture and is dropped.
        let mut map = BrokerBandwidthMap::new();
        for (id, (tx_mbps, instance_type)) in tx {
            if let Some((rx_mbps, _)) = rx.remove(&id) {
                map.insert(
                    id,
                    BrokerBandwidth {
                        tx_mbps,
                        rx_mbps,
                        instance_type,
                    },
                );
            }
        }
        Ok(map)
    }
}

/// Split a Datadog series scope (`broker_id:1001,instance-type:m5.xlarge`)
/// into its tag pairs.
fn parse_scope(scope: &str) -> HashMap<&str, &str> {
    scope
        .split(',')
        .filter_map(|tag| {
            let mut parts = tag.trim().splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => Some((k, v)),
                _ => None,
            }
        })
        .collect()
}
