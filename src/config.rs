//! Runtime configuration.
//!
//! Every flag doubles as an uppercased `AUTOTHROTTLE_*` environment
//! variable; flags win when both are present. Parsing failures at startup
//! are fatal and reported before the reconcile loop starts.

use std::collections::HashMap;

use structopt::StructOpt;

/// Adaptive replication throttle controller for Kafka clusters.
#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "autothrottle")]
pub struct Config {
    /// Datadog API key
    #[structopt(long, env = "AUTOTHROTTLE_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Datadog app key
    #[structopt(long, env = "AUTOTHROTTLE_APP_KEY", default_value = "", hide_env_values = true)]
    pub app_key: String,

    /// Datadog query for broker outbound bandwidth by host
    #[structopt(
        long,
        env = "AUTOTHROTTLE_NET_TX_QUERY",
        default_value = "avg:system.net.bytes_sent{service:kafka} by {host}"
    )]
    pub net_tx_query: String,

    /// Datadog query for broker inbound bandwidth by host
    #[structopt(
        long,
        env = "AUTOTHROTTLE_NET_RX_QUERY",
        default_value = "avg:system.net.bytes_rcvd{service:kafka} by {host}"
    )]
    pub net_rx_query: String,

    /// Datadog host tag for broker ID
    #[structopt(long, env = "AUTOTHROTTLE_BROKER_ID_TAG", default_value = "broker_id")]
    pub broker_id_tag: String,

    /// Time span of metrics required (seconds)
    #[structopt(long, env = "AUTOTHROTTLE_METRICS_WINDOW", default_value = "120")]
    pub metrics_window: u64,

    /// ZooKeeper connect string
    #[structopt(long, env = "AUTOTHROTTLE_ZK_ADDR", default_value = "localhost:2181")]
    pub zk_addr: String,

    /// ZooKeeper namespace prefix for cluster metadata
    #[structopt(long, env = "AUTOTHROTTLE_ZK_PREFIX", default_value = "")]
    pub zk_prefix: String,

    /// ZooKeeper prefix to store autothrottle configuration
    #[structopt(long, env = "AUTOTHROTTLE_ZK_CONFIG_PREFIX", default_value = "autothrottle")]
    pub zk_config_prefix: String,

    /// Reconcile interval (seconds)
    #[structopt(long, env = "AUTOTHROTTLE_INTERVAL", default_value = "180")]
    pub interval: u64,

    /// Admin API listen address:port
    #[structopt(long, env = "AUTOTHROTTLE_API_LISTEN", default_value = "localhost:8080")]
    pub api_listen: String,

    /// Comma-delimited list of Datadog event tags
    #[structopt(long, env = "AUTOTHROTTLE_DD_EVENT_TAGS", default_value = "")]
    pub dd_event_tags: String,

    /// Minimum replication throttle rate (MB/s)
    #[structopt(long, env = "AUTOTHROTTLE_MIN_RATE", default_value = "10")]
    pub min_rate: f64,

    /// Maximum outbound replication throttle rate (percent of available capacity)
    #[structopt(long, env = "AUTOTHROTTLE_MAX_TX_RATE", default_value = "90")]
    pub max_tx_rate: f64,

    /// Maximum inbound replication throttle rate (percent of available capacity)
    #[structopt(long, env = "AUTOTHROTTLE_MAX_RX_RATE", default_value = "90")]
    pub max_rx_rate: f64,

    /// Required change in replication throttle to trigger an update (percent)
    #[structopt(long, env = "AUTOTHROTTLE_CHANGE_THRESHOLD", default_value = "10")]
    pub change_threshold: f64,

    /// Consecutive failed reconcile intervals before reverting to min-rate
    #[structopt(long, env = "AUTOTHROTTLE_FAILURE_THRESHOLD", default_value = "1")]
    pub failure_threshold: u32,

    /// JSON map of instance types to network capacity in MB/s
    #[structopt(
        long,
        env = "AUTOTHROTTLE_CAP_MAP",
        default_value = "{}",
        parse(try_from_str = parse_cap_map)
    )]
    pub cap_map: HashMap<String, f64>,

    /// Number of idle intervals after which to issue a global throttle unset
    /// even if no replication was observed
    #[structopt(long, env = "AUTOTHROTTLE_CLEANUP_AFTER", default_value = "60")]
    pub cleanup_after: u64,
}

impl Config {
    /// The event tag list: the controller's own name tag plus any
    /// operator-supplied tags.
    pub fn event_tags(&self) -> Vec<String> {
        let mut tags = vec!["name:kafka-autothrottle".to_string()];
        tags.extend(
            self.dd_event_tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
        tags
    }
}

fn parse_cap_map(input: &str) -> Result<HashMap<String, f64>, serde_json::Error> {
    serde_json::from_str(input)
}
