//! The ingestion notification bus.
//!
//! The consumption engine raises lifecycle events through an `IngestionNotifier`. Each event
//! first updates local state (latches & replica roles), and is then queued on a bounded
//! channel from which the `ReportForwarder` pushes it to the supervising process as a report.
//! Delivery is fire-and-forget: a full channel drops the event instead of blocking the engine.


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::backend::ReportSink;
use crate::client::HttpTransport;
use crate::error::cause_message;
use crate::models::{IngestionAction, IngestionReportType, IngestionTaskReport, PartitionKey};
use crate::state_model::{ConsumptionLatches, ReplicaTable};

const METRIC_REPORTS_SENT: &str = "hadron_ingest_reports_sent";
const METRIC_REPORTS_DROPPED: &str = "hadron_ingest_reports_dropped";
const METRIC_REPORTS_FAILED: &str = "hadron_ingest_reports_failed";

/// A lifecycle event raised by the consumption engine for one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestionEvent {
    Started { key: PartitionKey, message: String },
    Restarted { key: PartitionKey, offset: i64, message: String },
    Progress { key: PartitionKey, offset: i64, message: String },
    Completed { key: PartitionKey, offset: i64, message: String },
    /// Consumption failed; `message` is a `<causeKind>_<detail>` message.
    Error { key: PartitionKey, message: String },
    EndOfPushReceived { key: PartitionKey, offset: i64, message: String },
    StartOfBufferReplayReceived { key: PartitionKey, offset: i64, message: String },
    StartOfIncrementalPushReceived { key: PartitionKey, offset: i64, incremental_push_version: String },
    EndOfIncrementalPushReceived { key: PartitionKey, offset: i64, incremental_push_version: String },
    TopicSwitchReceived { key: PartitionKey, offset: i64, message: String },
}

impl IngestionEvent {
    /// The partition this event was raised for.
    pub fn key(&self) -> &PartitionKey {
        match self {
            Self::Started { key, .. }
            | Self::Restarted { key, .. }
            | Self::Progress { key, .. }
            | Self::Completed { key, .. }
            | Self::Error { key, .. }
            | Self::EndOfPushReceived { key, .. }
            | Self::StartOfBufferReplayReceived { key, .. }
            | Self::StartOfIncrementalPushReceived { key, .. }
            | Self::EndOfIncrementalPushReceived { key, .. }
            | Self::TopicSwitchReceived { key, .. } => key,
        }
    }

    /// The report type corresponding to this event.
    pub fn report_type(&self) -> IngestionReportType {
        match self {
            Self::Started { .. } => IngestionReportType::Started,
            Self::Restarted { .. } => IngestionReportType::Restarted,
            Self::Progress { .. } => IngestionReportType::Progress,
            Self::Completed { .. } => IngestionReportType::Completed,
            Self::Error { .. } => IngestionReportType::Error,
            Self::EndOfPushReceived { .. } => IngestionReportType::EndOfPushReceived,
            Self::StartOfBufferReplayReceived { .. } => IngestionReportType::StartOfBufferReplayReceived,
            Self::StartOfIncrementalPushReceived { .. } => IngestionReportType::StartOfIncrementalPushReceived,
            Self::EndOfIncrementalPushReceived { .. } => IngestionReportType::EndOfIncrementalPushReceived,
            Self::TopicSwitchReceived { .. } => IngestionReportType::TopicSwitchReceived,
        }
    }

    /// Convert this event into the report sent to the supervising process.
    pub fn into_report(self) -> IngestionTaskReport {
        let report_type = self.report_type();
        let (key, offset, message) = match self {
            Self::Started { key, message } | Self::Error { key, message } => (key, 0, message),
            Self::Restarted { key, offset, message }
            | Self::Progress { key, offset, message }
            | Self::Completed { key, offset, message }
            | Self::EndOfPushReceived { key, offset, message }
            | Self::StartOfBufferReplayReceived { key, offset, message }
            | Self::TopicSwitchReceived { key, offset, message } => (key, offset, message),
            Self::StartOfIncrementalPushReceived {
                key,
                offset,
                incremental_push_version,
            }
            | Self::EndOfIncrementalPushReceived {
                key,
                offset,
                incremental_push_version,
            } => (key, offset, incremental_push_version),
        };
        let mut report = IngestionTaskReport::positive(key.resource.name(), key.partition as i32);
        report.set_report_type(report_type);
        report.is_positive = report_type != IngestionReportType::Error;
        report.message = message;
        report.offset = offset;
        report
    }
}

/// Counters of the reports handled by the bus.
#[derive(Default)]
pub struct ReportStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl ReportStats {
    /// Reports delivered to the sink.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Reports dropped because the outbound channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Reports which the sink failed to deliver.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// The handle through which the consumption engine raises lifecycle events.
#[derive(Clone)]
pub struct IngestionNotifier {
    tx: mpsc::Sender<IngestionEvent>,
    latches: Arc<ConsumptionLatches>,
    replicas: Arc<ReplicaTable>,
    stats: Arc<ReportStats>,
}

impl IngestionNotifier {
    /// Create a new instance along with the receiving end of its event channel.
    pub fn new(capacity: usize, latches: Arc<ConsumptionLatches>, replicas: Arc<ReplicaTable>) -> (Self, mpsc::Receiver<IngestionEvent>) {
        metrics::register_counter!(METRIC_REPORTS_SENT, metrics::Unit::Count, "reports delivered to the supervising process");
        metrics::register_counter!(METRIC_REPORTS_DROPPED, metrics::Unit::Count, "reports dropped due to a full outbound channel");
        metrics::register_counter!(METRIC_REPORTS_FAILED, metrics::Unit::Count, "reports which failed to be delivered");
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(ReportStats::default());
        (
            Self {
                tx,
                latches,
                replicas,
                stats,
            },
            rx,
        )
    }

    pub fn stats(&self) -> &Arc<ReportStats> {
        &self.stats
    }

    /// Apply the local effects of the given event and queue it for delivery.
    pub fn notify(&self, event: IngestionEvent) {
        match &event {
            IngestionEvent::Completed { key, .. } => self.latches.release(key),
            IngestionEvent::Error { key, message } => {
                self.latches.fail(key, message.clone());
                if self.replicas.mark_error(key) {
                    tracing::warn!(%key, "replica moved into the ERROR role");
                }
            }
            _ => (),
        }
        if let Err(err) = self.tx.try_send(event) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!(METRIC_REPORTS_DROPPED);
            let (kind, event) = match err {
                mpsc::error::TrySendError::Full(event) => ("full", event),
                mpsc::error::TrySendError::Closed(event) => ("closed", event),
            };
            tracing::warn!(key = %event.key(), report_type = ?event.report_type(), "report channel {}, dropping report", kind);
        }
    }

    pub fn started(&self, key: &PartitionKey, message: impl Into<String>) {
        self.notify(IngestionEvent::Started { key: key.clone(), message: message.into() });
    }

    pub fn restarted(&self, key: &PartitionKey, offset: i64, message: impl Into<String>) {
        self.notify(IngestionEvent::Restarted {
            key: key.clone(),
            offset,
            message: message.into(),
        });
    }

    pub fn progress(&self, key: &PartitionKey, offset: i64, message: impl Into<String>) {
        self.notify(IngestionEvent::Progress {
            key: key.clone(),
            offset,
            message: message.into(),
        });
    }

    /// The partition has caught up, releasing any transition waiting on it.
    pub fn completed(&self, key: &PartitionKey, offset: i64, message: impl Into<String>) {
        self.notify(IngestionEvent::Completed {
            key: key.clone(),
            offset,
            message: message.into(),
        });
    }

    /// Consumption of the partition failed, failing any transition waiting on it.
    pub fn error(&self, key: &PartitionKey, err: &anyhow::Error) {
        self.notify(IngestionEvent::Error {
            key: key.clone(),
            message: cause_message(err),
        });
    }

    pub fn end_of_push_received(&self, key: &PartitionKey, offset: i64, message: impl Into<String>) {
        self.notify(IngestionEvent::EndOfPushReceived {
            key: key.clone(),
            offset,
            message: message.into(),
        });
    }

    pub fn start_of_buffer_replay_received(&self, key: &PartitionKey, offset: i64, message: impl Into<String>) {
        self.notify(IngestionEvent::StartOfBufferReplayReceived {
            key: key.clone(),
            offset,
            message: message.into(),
        });
    }

    pub fn start_of_incremental_push_received(&self, key: &PartitionKey, offset: i64, incremental_push_version: impl Into<String>) {
        self.notify(IngestionEvent::StartOfIncrementalPushReceived {
            key: key.clone(),
            offset,
            incremental_push_version: incremental_push_version.into(),
        });
    }

    pub fn end_of_incremental_push_received(&self, key: &PartitionKey, offset: i64, incremental_push_version: impl Into<String>) {
        self.notify(IngestionEvent::EndOfIncrementalPushReceived {
            key: key.clone(),
            offset,
            incremental_push_version: incremental_push_version.into(),
        });
    }

    pub fn topic_switch_received(&self, key: &PartitionKey, offset: i64, message: impl Into<String>) {
        self.notify(IngestionEvent::TopicSwitchReceived {
            key: key.clone(),
            offset,
            message: message.into(),
        });
    }
}

/// A task forwarding queued events to the supervising process.
///
/// Events are delivered one at a time in channel order, so the reports of any one partition
/// are never reordered.
pub struct ReportForwarder {
    events: ReceiverStream<IngestionEvent>,
    sink: Arc<dyn ReportSink>,
    stats: Arc<ReportStats>,
    shutdown_rx: BroadcastStream<()>,
}

impl ReportForwarder {
    /// Create a new instance.
    pub fn new(events: mpsc::Receiver<IngestionEvent>, sink: Arc<dyn ReportSink>, stats: Arc<ReportStats>, shutdown_tx: &broadcast::Sender<()>) -> Self {
        Self {
            events: ReceiverStream::new(events),
            sink,
            stats,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("report forwarder has started");
        loop {
            tokio::select! {
                event_opt = self.events.next() => match event_opt {
                    Some(event) => self.forward(event).await,
                    None => break,
                },
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::debug!("report forwarder has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, event), fields(key = %event.key()))]
    async fn forward(&mut self, event: IngestionEvent) {
        let report = event.into_report();
        match self.sink.send(report).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!(METRIC_REPORTS_SENT);
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!(METRIC_REPORTS_FAILED);
                tracing::warn!(error = ?err, "error delivering report to supervising process");
            }
        }
    }
}

/// A report sink which POSTs reports to the supervising process's `/report` path.
pub struct HttpReportSink {
    transport: HttpTransport,
}

impl HttpReportSink {
    /// Create a new instance targeting the supervisor listening on the given local port.
    pub fn new(application_port: u16) -> Result<Self> {
        let transport = HttpTransport::new(&format!("http://127.0.0.1:{}", application_port)).context("error building report transport")?;
        Ok(Self { transport })
    }
}

#[async_trait::async_trait]
impl ReportSink for HttpReportSink {
    async fn send(&self, report: IngestionTaskReport) -> Result<()> {
        let _body = self.transport.post(IngestionAction::Report.path_segment(), &report).await?;
        Ok(())
    }
}
