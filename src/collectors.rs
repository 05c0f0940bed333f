//! Metric collectors answering the METRIC action.
//!
//! Collectors are selected by name from the `metric_collectors` config through an explicit
//! registry of constructors. Each collector samples its metrics on demand, and a metric which
//! fails to be read is omitted from the snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::backend::StorageService;
use crate::notifier::ReportStats;
use crate::server::ServiceStats;
use crate::state_model::{ReplicaTable, TransitionStats};
use crate::utils::RedundantErrorFilter;

pub const METRIC_PROCESS_THREADS: &str = "process_threads";
pub const METRIC_PROCESS_VIRTUAL_MEMORY_BYTES: &str = "process_virtual_memory_bytes";
pub const METRIC_PROCESS_RESIDENT_PAGES: &str = "process_resident_pages";
pub const METRIC_BLOCKED_ON_DROP: &str = "transitions_blocked_on_offline_to_dropped";
pub const METRIC_BLOCKED_ON_DROP_TOTAL: &str = "transitions_blocked_on_offline_to_dropped_total";
pub const METRIC_TRANSITIONS_TOTAL: &str = "transitions_total";
pub const METRIC_TRANSITION_FAILURES_TOTAL: &str = "transition_failures_total";
pub const METRIC_REPLICAS: &str = "transitions_replicas";
pub const METRIC_STORAGE_RESOURCES: &str = "storage_local_resources";
pub const METRIC_STORAGE_PARTITIONS: &str = "storage_open_partitions";
pub const METRIC_COMMANDS_TOTAL: &str = "service_commands_total";
pub const METRIC_NEGATIVE_REPORTS_TOTAL: &str = "service_negative_reports_total";
pub const METRIC_REPORTS_SENT_TOTAL: &str = "service_reports_sent_total";
pub const METRIC_REPORTS_DROPPED_TOTAL: &str = "service_reports_dropped_total";
pub const METRIC_REPORTS_FAILED_TOTAL: &str = "service_reports_failed_total";
pub const METRIC_HEARTBEAT_AGE_MS: &str = "service_heartbeat_age_ms";

/// A sample of one metric.
pub type MetricSample = (&'static str, Result<f64>);

/// A named group of metrics sampled together.
pub trait MetricCollector: Send + Sync {
    /// The registry name of this collector.
    fn name(&self) -> &'static str;

    /// Sample all metrics of this collector.
    fn collect(&self) -> Vec<MetricSample>;
}

/// The state which collectors may sample.
#[derive(Clone)]
pub struct CollectorContext {
    pub storage: Arc<dyn StorageService>,
    pub replicas: Arc<ReplicaTable>,
    pub transitions: Arc<TransitionStats>,
    pub reports: Arc<ReportStats>,
    pub service: Arc<ServiceStats>,
}

type CollectorConstructor = fn(&CollectorContext) -> Box<dyn MetricCollector>;

/// All known collectors by name.
const COLLECTORS: &[(&str, CollectorConstructor)] = &[
    (ProcessCollector::NAME, ProcessCollector::build),
    (TransitionsCollector::NAME, TransitionsCollector::build),
    (StorageCollector::NAME, StorageCollector::build),
    (ServiceCollector::NAME, ServiceCollector::build),
];

fn find_constructor(name: &str) -> Result<CollectorConstructor> {
    match COLLECTORS.iter().find(|(known, _)| *known == name) {
        Some((_, constructor)) => Ok(*constructor),
        None => bail!("unknown metric collector {}", name),
    }
}

/// The set of collectors registered at INIT.
pub struct MetricsRegistry {
    collectors: Vec<Box<dyn MetricCollector>>,
    filter: RedundantErrorFilter,
}

impl MetricsRegistry {
    /// Check that every non-empty name is a known collector, without building any.
    pub fn validate<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        names.into_iter().filter(|name| !name.is_empty()).try_for_each(|name| find_constructor(name).map(|_| ()))
    }

    /// Build a registry from the given collector names.
    ///
    /// Unknown names are an error, empty names are skipped.
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>, ctx: &CollectorContext) -> Result<Self> {
        let mut collectors: Vec<Box<dyn MetricCollector>> = vec![];
        for name in names {
            if name.is_empty() {
                tracing::info!("skipping empty metric collector name");
                continue;
            }
            if collectors.iter().any(|collector| collector.name() == name) {
                continue;
            }
            collectors.push(find_constructor(name)?(ctx));
        }
        tracing::debug!(collectors = ?collectors.iter().map(|c| c.name()).collect::<Vec<_>>(), "metric collectors registered");
        Ok(Self {
            collectors,
            filter: RedundantErrorFilter::default(),
        })
    }

    /// The names of the registered collectors.
    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|collector| collector.name()).collect()
    }

    /// Sample all registered metrics, omitting those which could not be read.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        for collector in self.collectors.iter() {
            for (name, res) in collector.collect() {
                match res {
                    Ok(val) => {
                        metrics.insert(name.to_string(), val);
                    }
                    Err(err) => {
                        let msg = format!("error retrieving value of metric {}: {:#}", name, err);
                        if !self.filter.is_redundant(&msg) {
                            tracing::error!(collector = collector.name(), "{}", msg);
                        }
                    }
                }
            }
        }
        metrics
    }
}

/// OS level metrics of this process.
struct ProcessCollector;

impl ProcessCollector {
    const NAME: &'static str = "process";

    fn build(_: &CollectorContext) -> Box<dyn MetricCollector> {
        Box::new(Self)
    }
}

impl MetricCollector for ProcessCollector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[cfg(target_os = "linux")]
    fn collect(&self) -> Vec<MetricSample> {
        match procfs::process::Process::myself() {
            Ok(proc) => vec![
                (METRIC_PROCESS_THREADS, Ok(proc.stat.num_threads as f64)),
                (METRIC_PROCESS_VIRTUAL_MEMORY_BYTES, Ok(proc.stat.vsize as f64)),
                (METRIC_PROCESS_RESIDENT_PAGES, Ok(proc.stat.rss as f64)),
            ],
            Err(err) => {
                let err = format!("error reading process stats: {}", err);
                vec![
                    (METRIC_PROCESS_THREADS, Err(anyhow!(err.clone()))),
                    (METRIC_PROCESS_VIRTUAL_MEMORY_BYTES, Err(anyhow!(err.clone()))),
                    (METRIC_PROCESS_RESIDENT_PAGES, Err(anyhow!(err))),
                ]
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn collect(&self) -> Vec<MetricSample> {
        [METRIC_PROCESS_THREADS, METRIC_PROCESS_VIRTUAL_MEMORY_BYTES, METRIC_PROCESS_RESIDENT_PAGES]
            .iter()
            .map(|name| (*name, Err(anyhow!("process metrics are only available on Linux"))))
            .collect()
    }
}

/// Partition transition metrics.
struct TransitionsCollector {
    replicas: Arc<ReplicaTable>,
    stats: Arc<TransitionStats>,
}

impl TransitionsCollector {
    const NAME: &'static str = "transitions";

    fn build(ctx: &CollectorContext) -> Box<dyn MetricCollector> {
        Box::new(Self {
            replicas: ctx.replicas.clone(),
            stats: ctx.transitions.clone(),
        })
    }
}

impl MetricCollector for TransitionsCollector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn collect(&self) -> Vec<MetricSample> {
        vec![
            (METRIC_BLOCKED_ON_DROP, Ok(self.stats.blocked_on_drop() as f64)),
            (METRIC_BLOCKED_ON_DROP_TOTAL, Ok(self.stats.blocked_on_drop_entries() as f64)),
            (METRIC_TRANSITIONS_TOTAL, Ok(self.stats.transitions() as f64)),
            (METRIC_TRANSITION_FAILURES_TOTAL, Ok(self.stats.failures() as f64)),
            (METRIC_REPLICAS, Ok(self.replicas.len() as f64)),
        ]
    }
}

/// Local storage metrics.
struct StorageCollector {
    storage: Arc<dyn StorageService>,
}

impl StorageCollector {
    const NAME: &'static str = "storage";

    fn build(ctx: &CollectorContext) -> Box<dyn MetricCollector> {
        Box::new(Self { storage: ctx.storage.clone() })
    }
}

impl MetricCollector for StorageCollector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn collect(&self) -> Vec<MetricSample> {
        vec![
            (METRIC_STORAGE_RESOURCES, Ok(self.storage.local_resources().len() as f64)),
            (METRIC_STORAGE_PARTITIONS, Ok(self.storage.open_partition_count() as f64)),
        ]
    }
}

/// Control protocol & report delivery metrics.
struct ServiceCollector {
    service: Arc<ServiceStats>,
    reports: Arc<ReportStats>,
}

impl ServiceCollector {
    const NAME: &'static str = "service";

    fn build(ctx: &CollectorContext) -> Box<dyn MetricCollector> {
        Box::new(Self {
            service: ctx.service.clone(),
            reports: ctx.reports.clone(),
        })
    }
}

impl MetricCollector for ServiceCollector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn collect(&self) -> Vec<MetricSample> {
        let heartbeat_age = self
            .service
            .heartbeat_age_millis()
            .map(|age| age as f64)
            .ok_or_else(|| anyhow!("no heartbeat has been received yet"));
        vec![
            (METRIC_COMMANDS_TOTAL, Ok(self.service.commands() as f64)),
            (METRIC_NEGATIVE_REPORTS_TOTAL, Ok(self.service.negative_reports() as f64)),
            (METRIC_REPORTS_SENT_TOTAL, Ok(self.reports.sent() as f64)),
            (METRIC_REPORTS_DROPPED_TOTAL, Ok(self.reports.dropped() as f64)),
            (METRIC_REPORTS_FAILED_TOTAL, Ok(self.reports.failed() as f64)),
            (METRIC_HEARTBEAT_AGE_MS, heartbeat_age),
        ]
    }
}
