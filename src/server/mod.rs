//! The ingestion control protocol.
//!
//! `IngestionService` is the dispatcher behind the control server: it parses the action from
//! the request path, decodes the payload, routes to the state model or the collaborators, and
//! encodes the answer. Failures are split in three tiers:
//!
//! - validation failures (bad method, path or action, INIT ordering) answer `400`;
//! - failures executing a recognized command answer `200` with a negative report;
//! - anything else, including undecodable payloads, answers `500` and closes the connection.

mod admin;
mod command;
mod http;
mod prom;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use ::http::{Method, StatusCode};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use crate::backend::{ComponentFactory, Components};
use crate::cleaner::LeakedResourceCleaner;
use crate::collectors::{CollectorContext, MetricsRegistry};
use crate::config::{Config, IngestionConfig};
use crate::error::{cause_message, AppError, ShutdownError};
use crate::models::{IngestionAction, IngestionMetricsReport, IngestionTaskReport, InitializationConfig};
use crate::notifier::{IngestionNotifier, ReportForwarder};
use crate::state_model::{ConsumptionLatches, PartitionStateModel, ReplicaTable};
use crate::utils;

pub use self::http::ControlServer;
pub use prom::{metrics_recorder, spawn_prom_server};

const METRIC_REQUESTS: &str = "hadron_ingest_requests";
const METRIC_REQUEST_ERRORS: &str = "hadron_ingest_request_errors";

/// Liveness & traffic statistics of the control protocol.
#[derive(Default)]
pub struct ServiceStats {
    /// Wall clock millis of the last heartbeat, `0` when none has been received.
    last_heartbeat_ms: AtomicI64,
    commands: AtomicU64,
    negative_reports: AtomicU64,
}

impl ServiceStats {
    /// Record a heartbeat from the supervising process.
    pub fn record_heartbeat(&self) {
        self.last_heartbeat_ms.store(utils::now_millis(), Ordering::SeqCst);
    }

    /// The wall clock millis of the last heartbeat, if any.
    pub fn last_heartbeat_millis(&self) -> Option<i64> {
        match self.last_heartbeat_ms.load(Ordering::SeqCst) {
            0 => None,
            millis => Some(millis),
        }
    }

    /// Millis elapsed since the last heartbeat, if any.
    pub fn heartbeat_age_millis(&self) -> Option<i64> {
        self.last_heartbeat_millis().map(|last| (utils::now_millis() - last).max(0))
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn negative_reports(&self) -> u64 {
        self.negative_reports.load(Ordering::Relaxed)
    }
}

/// Everything wired together by the INIT action.
pub struct IngestionContext {
    pub config: Arc<IngestionConfig>,
    pub components: Components,
    pub model: PartitionStateModel,
    pub notifier: IngestionNotifier,
    pub metrics: MetricsRegistry,
}

/// The answer to one control request.
#[derive(Debug)]
pub struct ActionResponse {
    pub status: StatusCode,
    pub body: Bytes,
    /// Whether the connection must be closed after answering.
    pub close: bool,
}

impl ActionResponse {
    fn ok(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            body: Bytes::from(body),
            close: false,
        }
    }
}

/// Resolve the action of a request from its method & path.
pub fn parse_action(method: &Method, path: &str) -> std::result::Result<IngestionAction, AppError> {
    let parts: Vec<&str> = path.split('/').collect();
    if method != Method::POST || parts.len() < 2 {
        return Err(AppError::InvalidInput(format!(
            "only POST requests with an action path are supported, cannot parse request {} {}",
            method, path
        )));
    }
    IngestionAction::from_path_segment(parts[1]).ok_or_else(|| AppError::InvalidInput(format!("unsupported action: {}", parts[1])))
}

/// The ingestion control protocol dispatcher.
pub struct IngestionService {
    factory: Arc<dyn ComponentFactory>,
    /// The context built by INIT, absent until INIT succeeds.
    context: ArcSwapOption<IngestionContext>,
    /// Serializes INIT actions.
    init_lock: tokio::sync::Mutex<()>,
    /// Bounds the number of requests dispatched at once.
    permits: Semaphore,
    stats: Arc<ServiceStats>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// Background tasks spawned by INIT.
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl IngestionService {
    /// Create a new instance.
    pub fn new(config: &Config, factory: Arc<dyn ComponentFactory>, shutdown_tx: broadcast::Sender<()>) -> Arc<Self> {
        metrics::register_counter!(METRIC_REQUESTS, metrics::Unit::Count, "control requests received");
        metrics::register_counter!(METRIC_REQUEST_ERRORS, metrics::Unit::Count, "control requests answered with a non-200 status");
        Arc::new(Self {
            factory,
            context: ArcSwapOption::empty(),
            init_lock: tokio::sync::Mutex::new(()),
            permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            stats: Arc::new(ServiceStats::default()),
            shutdown_tx,
            tasks: Mutex::new(vec![]),
        })
    }

    pub fn stats(&self) -> &Arc<ServiceStats> {
        &self.stats
    }

    /// The context built by INIT, if INIT has completed.
    pub fn context(&self) -> Option<Arc<IngestionContext>> {
        self.context.load_full()
    }

    pub fn is_initiated(&self) -> bool {
        self.context.load().is_some()
    }

    /// Handle one control request.
    #[tracing::instrument(level = "debug", skip(self, body))]
    pub async fn handle_request(&self, method: &Method, path: &str, body: Bytes) -> ActionResponse {
        metrics::increment_counter!(METRIC_REQUESTS);
        let res = match self.permits.acquire().await {
            Ok(_permit) => match parse_action(method, path) {
                Ok(action) => self.dispatch(action, body).await,
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(anyhow::Error::from(err).context("request permits closed")),
        };
        match res {
            Ok(body) => ActionResponse::ok(body),
            Err(err) => {
                metrics::increment_counter!(METRIC_REQUEST_ERRORS);
                if err.downcast_ref::<ShutdownError>().is_some() {
                    let _res = self.shutdown_tx.send(());
                }
                let (status, message) = match err.downcast::<AppError>() {
                    Ok(app_err) => {
                        tracing::warn!(error = %app_err, "rejecting control request");
                        app_err.into_status()
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, "error handling control request");
                        AppError::Ise(err).into_status()
                    }
                };
                ActionResponse {
                    status,
                    body: Bytes::from(message),
                    close: status.is_server_error(),
                }
            }
        }
    }

    async fn dispatch(&self, action: IngestionAction, body: Bytes) -> Result<Vec<u8>> {
        match action {
            IngestionAction::Init => {
                let config: InitializationConfig = utils::decode_model(&body).context("error decoding INIT payload")?;
                self.handle_init(config).await?;
                Ok(vec![])
            }
            IngestionAction::Command => {
                let command = utils::decode_model(&body).context("error decoding COMMAND payload")?;
                utils::encode_model(&self.handle_command(command).await)
            }
            IngestionAction::Metric => utils::encode_model(&self.handle_metric()?),
            IngestionAction::Heartbeat => {
                self.handle_heartbeat()?;
                Ok(vec![])
            }
            IngestionAction::UpdateMetadata => {
                let metadata = utils::decode_model(&body).context("error decoding UPDATE_METADATA payload")?;
                utils::encode_model(&self.handle_update_metadata(metadata).await)
            }
            IngestionAction::ShutdownComponent => {
                let command = utils::decode_model(&body).context("error decoding SHUTDOWN_COMPONENT payload")?;
                utils::encode_model(&self.handle_shutdown_component(command).await)
            }
            IngestionAction::Report => Err(AppError::InvalidInput("unsupported action: report".into()).into()),
        }
    }

    /// Wire together all ingestion components. Accepted exactly once.
    ///
    /// A failed INIT leaves the service un-initiated so that it may be retried.
    pub async fn handle_init(&self, init: InitializationConfig) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initiated() {
            return Err(AppError::AlreadyInitiated.into());
        }
        let config = Arc::new(IngestionConfig::from_aggregated(&init.aggregated_configs)?);
        tracing::info!(configs = init.aggregated_configs.len(), mode = ?config.ingestion_mode, "initializing ingestion service");
        MetricsRegistry::validate(config.metric_collector_names()).context("error validating metric collectors")?;

        let (latches, replicas) = (Arc::new(ConsumptionLatches::default()), ReplicaTable::new());
        let (notifier, events) = IngestionNotifier::new(config.report_channel_capacity, latches.clone(), replicas.clone());
        let components = self
            .factory
            .build(config.clone(), notifier.clone())
            .await
            .context("error building ingestion components")?;
        let model = PartitionStateModel::new(
            config.clone(),
            components.consumption.clone(),
            components.storage.clone(),
            components.stores.clone(),
            replicas.clone(),
            latches,
        );
        let metrics = MetricsRegistry::build(
            config.metric_collector_names(),
            &CollectorContext {
                storage: components.storage.clone(),
                replicas,
                transitions: model.stats().clone(),
                reports: notifier.stats().clone(),
                service: self.stats.clone(),
            },
        )
        .context("error building metric collectors")?;

        let forwarder = ReportForwarder::new(events, components.report_sink.clone(), notifier.stats().clone(), &self.shutdown_tx).spawn();
        let cleaner = LeakedResourceCleaner::new(
            &config,
            components.storage.clone(),
            components.stores.clone(),
            components.consumption.clone(),
            &self.shutdown_tx,
        )
        .spawn();
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend([forwarder, cleaner]),
            Err(poisoned) => poisoned.into_inner().extend([forwarder, cleaner]),
        }

        self.context.store(Some(Arc::new(IngestionContext {
            config,
            components,
            model,
            notifier,
            metrics,
        })));
        tracing::info!("ingestion service initiated");
        Ok(())
    }

    /// Dump the current metric snapshot.
    pub fn handle_metric(&self) -> Result<IngestionMetricsReport> {
        let ctx = self.context().ok_or(AppError::NotInitiated)?;
        Ok(IngestionMetricsReport {
            aggregated_metrics: ctx.metrics.snapshot(),
        })
    }

    /// Record a heartbeat from the supervising process.
    pub fn handle_heartbeat(&self) -> Result<()> {
        if !self.is_initiated() {
            return Err(AppError::NotInitiated.into());
        }
        self.stats.record_heartbeat();
        Ok(())
    }

    /// Wait for the background tasks spawned by INIT to shutdown.
    ///
    /// This should be called once shutdown has been signalled.
    pub async fn join_tasks(&self) {
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            match task.await {
                Ok(Err(err)) => tracing::error!(error = ?err, "ingestion task shutdown with error"),
                Err(err) => tracing::error!(error = ?err, "error joining ingestion task"),
                Ok(Ok(())) => (),
            }
        }
    }

    /// Finish the given report, rendering the error as a negative report if present.
    fn finish_report(&self, mut report: IngestionTaskReport, res: Result<()>) -> IngestionTaskReport {
        if let Err(err) = res {
            self.stats.negative_reports.fetch_add(1, Ordering::Relaxed);
            report.is_positive = false;
            report.message = cause_message(&err);
        }
        report
    }
}
