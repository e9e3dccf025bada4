//! Admin HTTP API.
//!
//! Operators read and write throttle overrides here; every write goes
//! through the override store, which the reconciler re-reads each tick.
//! Also serves the healthcheck and the Prometheus metrics endpoint.

use std::net::ToSocketAddrs;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::overrides::{BrokerOverride, OverrideConfig, OverrideStore};

/// State shared with the request handlers.
#[derive(Clone)]
struct ApiState {
    overrides: OverrideStore,
    prom: Option<PrometheusHandle>,
}

/// The admin API server.
pub struct AdminServer {
    /// Runtime config.
    config: Arc<Config>,
    /// The override store backing all throttle endpoints.
    overrides: OverrideStore,
    /// Renders `/metrics`; absent when no recorder is installed.
    prom: Option<PrometheusHandle>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl AdminServer {
    pub fn new(config: Arc<Config>, overrides: OverrideStore, prom: Option<PrometheusHandle>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            overrides,
            prom,
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let addr = self
            .config
            .api_listen
            .to_socket_addrs()
            .with_context(|| format!("error resolving api-listen address {}", self.config.api_listen))?
            .next()
            .with_context(|| format!("api-listen address {} resolved to nothing", self.config.api_listen))?;

        let state = ApiState {
            overrides: self.overrides,
            prom: self.prom,
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tracing::info!(listen = %addr, "admin API initialized");
        axum::Server::bind(&addr)
            .serve(router(state).into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .await
            .context("admin API server error")?;
        Ok(())
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(prom_metrics))
        .route("/throttle", get(get_throttle).post(set_throttle).delete(remove_throttle))
        .route("/throttle/brokers", get(list_broker_throttles))
        .route(
            "/throttle/brokers/:id",
            get(get_broker_throttle).post(set_broker_throttle).delete(remove_broker_throttle),
        )
        .with_state(state)
}

/// GET the global throttle override.
async fn get_throttle(State(state): State<ApiState>) -> ApiResult<Json<OverrideConfig>> {
    Ok(Json(state.overrides.get_global().await?))
}

/// POST the global throttle override.
#[tracing::instrument(level = "debug", skip(state))]
async fn set_throttle(State(state): State<ApiState>, Json(config): Json<OverrideConfig>) -> ApiResult<Json<OverrideConfig>> {
    state.overrides.set_global(config).await?;
    tracing::info!(rate = config.rate, autoremove = config.autoremove, "global throttle override set");
    Ok(Json(config))
}

/// DELETE the global throttle override.
async fn remove_throttle(State(state): State<ApiState>) -> ApiResult<StatusCode> {
    state.overrides.clear_global().await?;
    tracing::info!("global throttle override removed");
    Ok(StatusCode::OK)
}

/// GET all broker throttle overrides.
async fn list_broker_throttles(State(state): State<ApiState>) -> ApiResult<Json<Vec<BrokerOverride>>> {
    let mut overrides: Vec<BrokerOverride> = state.overrides.list_broker_overrides().await?.into_values().collect();
    overrides.sort_by_key(|o| o.id);
    Ok(Json(overrides))
}

/// GET one broker's throttle override.
async fn get_broker_throttle(State(state): State<ApiState>, Path(id): Path<i32>) -> ApiResult<Json<BrokerOverride>> {
    match state.overrides.get_broker_override(id).await? {
        Some(o) => Ok(Json(o)),
        None => Err(ApiError::NotFound),
    }
}

/// POST one broker's throttle override.
#[tracing::instrument(level = "debug", skip(state))]
async fn set_broker_throttle(
    State(state): State<ApiState>,
    Path(id): Path<i32>,
    Json(config): Json<OverrideConfig>,
) -> ApiResult<Json<BrokerOverride>> {
    if id < 0 {
        return Err(ApiError::InvalidInput(format!("invalid broker id {}", id)));
    }
    let o = BrokerOverride {
        id,
        reassignment_participant: false,
        config,
    };
    state.overrides.set_broker_override(&o).await?;
    tracing::info!(broker = id, rate = config.rate, autoremove = config.autoremove, "broker throttle override set");
    Ok(Json(o))
}

/// DELETE one broker's throttle override.
async fn remove_broker_throttle(State(state): State<ApiState>, Path(id): Path<i32>) -> ApiResult<StatusCode> {
    state.overrides.delete_broker_override(id).await?;
    tracing::info!(broker = id, "broker throttle override removed");
    Ok(StatusCode::OK)
}

/// Handler for serving Prometheus metrics.
async fn prom_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.prom {
        Some(handle) => {
            let mut headers = HeaderMap::new();
            headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
            (StatusCode::OK, headers, handle.render()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
