use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;
use tracing_subscriber::prelude::*;

use crate::backend::ComponentFactory;
use crate::config::Config;
use crate::server::{metrics_recorder, spawn_prom_server, ControlServer, IngestionService};

/// Setup the tracing/logging system.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")
}

/// The application object for when the ingestion worker is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The ingestion control protocol dispatcher.
    service: Arc<IngestionService>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the control server.
    control_server: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: Option<JoinHandle<Result<()>>>,
    /// The join handle of the heartbeat monitor.
    heartbeat_monitor: Option<JoinHandle<Result<()>>>,
}

impl App {
    /// Create a new instance.
    ///
    /// The worker's components are built by the given factory once the supervising process
    /// sends its INIT action.
    pub async fn new(config: Arc<Config>, factory: Arc<dyn ComponentFactory>) -> Result<Self> {
        if let Err(err) = metrics::set_recorder(metrics_recorder()) {
            tracing::warn!(error = ?err, "metrics recorder already installed");
        }
        let (shutdown_tx, _) = broadcast::channel(10);

        let service = IngestionService::new(&config, factory, shutdown_tx.clone());
        let control_server = ControlServer::new(&config, service.clone(), shutdown_tx.clone())
            .await
            .context("error setting up control server")?
            .spawn();
        let metrics_server = match config.metrics_port {
            0 => None,
            _ => Some(spawn_prom_server(&config, service.clone(), shutdown_tx.subscribe())),
        };
        let heartbeat_monitor = config
            .heartbeat_timeout()
            .map(|timeout| HeartbeatMonitor::new(service.clone(), timeout, &shutdown_tx).spawn());

        Ok(Self {
            _config: config,
            service,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            control_server,
            metrics_server,
            heartbeat_monitor,
        })
    }

    /// A handle to the app's shutdown channel.
    pub fn shutdown_tx(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
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

        // Begin shutdown routine.
        tracing::debug!("ingestion worker is shutting down");
        if let Err(err) = self.control_server.await.context("error joining control server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down control server");
        }
        if let Some(handle) = self.heartbeat_monitor {
            if let Err(err) = handle.await.context("error joining heartbeat monitor handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down heartbeat monitor");
            }
        }
        self.service.join_tasks().await;
        if let Some(handle) = self.metrics_server {
            if let Err(err) = handle.await.context("error joining metrics server handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down metrics server");
            }
        }
        tracing::debug!("ingestion worker shutdown");
        Ok(())
    }
}

/// A task which shuts the worker down once its supervising process stops sending heartbeats.
///
/// The monitor only arms once INIT has completed; the first heartbeat deadline is measured
/// from the moment INIT was observed.
pub(crate) struct HeartbeatMonitor {
    service: Arc<IngestionService>,
    timeout: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(service: Arc<IngestionService>, timeout: Duration, shutdown_tx: &broadcast::Sender<()>) -> Self {
        Self {
            service,
            timeout,
            shutdown_tx: shutdown_tx.clone(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval((self.timeout / 4).max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut armed = false;
        let mut last_heartbeat: Option<i64> = None;
        let mut last_seen = Instant::now();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.service.is_initiated() {
                        continue;
                    }
                    let now = Instant::now();
                    if !armed {
                        armed = true;
                        last_seen = now;
                    }
                    let heartbeat = self.service.stats().last_heartbeat_millis();
                    if heartbeat != last_heartbeat {
                        last_heartbeat = heartbeat;
                        last_seen = now;
                    }
                    if now.duration_since(last_seen) >= self.timeout {
                        tracing::error!(timeout = ?self.timeout, "no heartbeat received from the supervising process, shutting down");
                        let _res = self.shutdown_tx.send(());
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::debug!("heartbeat monitor has shutdown");
        Ok(())
    }
}
