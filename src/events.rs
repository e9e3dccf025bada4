//! Event sink collaborator.
//!
//! The reconciler emits human-readable notices on state transitions. Writes
//! must never block or fail the loop: they go into a bounded channel, a
//! relay task drains the channel into the sink, and overflow drops the
//! event (with a counter) rather than backing up the reconciler.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Prefix on every event title, so events from different tooling sharing
/// the sink are distinguishable.
const EVENT_TITLE_PREFIX: &str = "kafka-autothrottle";
/// Events buffered before overflow drops new ones.
const EVENT_BUFFER: usize = 100;

const METRIC_EVENTS_DROPPED: &str = "autothrottle_events_dropped";

/// A single operator-visible notice.
#[derive(Debug, Clone)]
pub struct Event {
    pub title: String,
    pub text: String,
}

/// Where events ultimately land.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn post(&self, event: &Event, tags: &[String]) -> Result<()>;
}

/// Sink that posts to the Datadog events API.
pub struct DatadogEvents {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DatadogEvents {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.datadoghq.com".to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl EventSink for DatadogEvents {
    async fn post(&self, event: &Event, tags: &[String]) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before the unix epoch")?
            .as_secs();
        let body = serde_json::json!({
            "title": event.title,
            "text": event.text,
            "tags": tags,
            "date_happened": timestamp,
        });
        self.client
            .post(format!("{}/api/v1/events", self.base_url))
            .header("DD-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("error posting event")?
            .error_for_status()
            .context("event rejected")?;
        Ok(())
    }
}

/// Sink for running without event credentials: the notice only goes to the
/// process log.
pub struct LogEvents;

#[async_trait]
impl EventSink for LogEvents {
    async fn post(&self, _event: &Event, _tags: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Fire-and-forget event producer handed to the reconciler.
#[derive(Clone)]
pub struct EventWriter {
    tx: mpsc::Sender<Event>,
}

impl EventWriter {
    /// Create the writer and spawn its relay task.
    pub fn new(sink: Arc<dyn EventSink>, tags: Vec<String>, shutdown: broadcast::Receiver<()>) -> (Self, JoinHandle<Result<()>>) {
        metrics::describe_counter!(METRIC_EVENTS_DROPPED, "events dropped due to a full event buffer");
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let relay = EventRelay {
            rx,
            sink,
            tags,
            shutdown,
        };
        (Self { tx }, relay.spawn())
    }

    /// Queue an event. Never blocks; a full buffer drops the event.
    pub fn write(&self, title: &str, text: &str) {
        let event = Event {
            title: format!("{}: {}", EVENT_TITLE_PREFIX, title),
            text: text.to_string(),
        };
        tracing::info!(title = %event.title, text = %event.text, "event");
        if let Err(err) = self.tx.try_send(event) {
            metrics::increment_counter!(METRIC_EVENTS_DROPPED);
            tracing::warn!(error = %err, "event buffer full or closed, dropping event");
        }
    }
}

/// Task draining queued events into the sink.
struct EventRelay {
    rx: mpsc::Receiver<Event>,
    sink: Arc<dyn EventSink>,
    tags: Vec<String>,
    shutdown: broadcast::Receiver<()>,
}

impl EventRelay {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.sink.post(&event, &self.tags).await {
                            tracing::warn!(error = ?err, title = %event.title, "error posting event");
                        }
                    }
                    None => break,
                },
                _ = self.shutdown.recv() => break,
            }
        }
        Ok(())
    }
}
