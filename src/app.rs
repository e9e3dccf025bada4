//! The application object: wires the collaborators together, spawns the
//! long-running tasks, and coordinates graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::admin::ZkThrottleAdmin;
use crate::bandwidth::DatadogBandwidth;
use crate::config::Config;
use crate::events::{DatadogEvents, EventSink, EventWriter, LogEvents};
use crate::limits::Limits;
use crate::overrides::OverrideStore;
use crate::server::AdminServer;
use crate::throttle::ThrottleCtl;
use crate::zk::{MetadataStore, ZkHandler};

/// The application object for the running controller.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the throttle reconciler.
    throttle_handle: JoinHandle<Result<()>>,
    /// The join handle of the admin API server.
    server_handle: JoinHandle<Result<()>>,
    /// The join handle of the event relay.
    events_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, prom: Option<PrometheusHandle>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let limits = Limits::new(&config).context("invalid throttle limits config")?;

        // Lazily prevent a tight restart loop from thrashing the metadata
        // store.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let meta: Arc<dyn MetadataStore> = Arc::new(
            ZkHandler::connect(&config.zk_addr, &config.zk_prefix)
                .await
                .context("error connecting to the cluster metadata store")?,
        );
        let admin = Arc::new(ZkThrottleAdmin::new(meta.clone()));
        let bandwidth = Arc::new(DatadogBandwidth::new(&config));
        let overrides = OverrideStore::new(meta.clone(), &config.zk_config_prefix);

        let sink: Arc<dyn EventSink> = if config.api_key.is_empty() {
            tracing::info!("no metrics API key configured, events go to the process log only");
            Arc::new(LogEvents)
        } else {
            Arc::new(DatadogEvents::new(&config.api_key))
        };
        let (events, events_handle) = EventWriter::new(sink, config.event_tags(), shutdown_tx.subscribe());

        let throttle_handle = ThrottleCtl::new(
            config.clone(),
            meta,
            admin,
            bandwidth,
            overrides.clone(),
            events,
            limits,
            shutdown_tx.subscribe(),
        )
        .spawn();

        let server_handle = AdminServer::new(config, overrides, prom, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            throttle_handle,
            server_handle,
            events_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine. Applied throttles are deliberately left in
        // place for a successor process to reconcile or clean up.
        tracing::debug!("autothrottle is shutting down");
        if let Err(err) = self.throttle_handle.await.context("error joining throttle reconciler handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down throttle reconciler");
        }
        if let Err(err) = self.server_handle.await.context("error joining admin API server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down admin API server");
        }
        if let Err(err) = self.events_handle.await.context("error joining event relay handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down event relay");
        }

        tracing::debug!("autothrottle shutdown complete");
        Ok(())
    }
}
