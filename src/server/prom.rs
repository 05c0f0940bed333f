use std::fmt::Write;
use std::sync::Arc;

use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::IngestionService;
use crate::config::Config;

/// The prefix of the gauges rendered from the INIT-time collectors.
pub(super) const COLLECTOR_PREFIX: &str = "hadron_ingest_";

lazy_static::lazy_static! {
    static ref RECORDER: PrometheusRecorder = PrometheusBuilder::new().build();
}

/// Get a handle to the process wide metrics recorder, initializing it as needed.
pub fn metrics_recorder() -> &'static PrometheusRecorder {
    &RECORDER
}

#[derive(Clone)]
struct ScrapeState {
    recorder: PrometheusHandle,
    service: Arc<IngestionService>,
}

/// Spawn the worker's scrape endpoint on the metrics port.
///
/// `/metrics` renders the control plane counters of the recorder, followed by the gauges of
/// the collectors registered at INIT once the service has been initiated.
pub fn spawn_prom_server(config: &Config, service: Arc<IngestionService>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let state = ScrapeState {
        recorder: metrics_recorder().handle(),
        service,
    };
    let app = Router::new().route("/metrics", get(scrape_metrics)).layer(AddExtensionLayer::new(state));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!(port = config.metrics_port, "ingestion metrics are served at /metrics");
    tokio::spawn(server.map_err(anyhow::Error::from))
}

async fn scrape_metrics(Extension(state): Extension<ScrapeState>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, render_scrape(&state.recorder, &state.service))
}

/// Render the recorder, followed by the collector gauges of an initiated service.
pub(super) fn render_scrape(recorder: &PrometheusHandle, service: &IngestionService) -> String {
    let mut body = recorder.render();
    let ctx = match service.context() {
        Some(ctx) => ctx,
        None => return body,
    };
    let mut samples: Vec<_> = ctx.metrics.snapshot().into_iter().collect();
    samples.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in samples {
        let _res = write!(body, "# TYPE {prefix}{name} gauge\n{prefix}{name} {value}\n", prefix = COLLECTOR_PREFIX, name = name, value = value);
    }
    body
}
