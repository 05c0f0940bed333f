//! Wire protocol between the supervising process and the ingestion worker.
//!
//! All payloads are protobuf encoded and carried as HTTP POST bodies, the path's first
//! segment selecting the action.

///////////////////////////////////////////////////////////////////////////////
// Actions ////////////////////////////////////////////////////////////////////

/// The top-level action selected by the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IngestionAction {
    Init,
    Command,
    Metric,
    Heartbeat,
    UpdateMetadata,
    ShutdownComponent,
    /// Served by the supervising process, which receives reports from the worker.
    Report,
}

impl IngestionAction {
    /// Resolve an action from its path segment, ignoring case.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "init" => Some(Self::Init),
            "command" => Some(Self::Command),
            "metric" => Some(Self::Metric),
            "heartbeat" => Some(Self::Heartbeat),
            "update_metadata" => Some(Self::UpdateMetadata),
            "shutdown_component" => Some(Self::ShutdownComponent),
            "report" => Some(Self::Report),
            _ => None,
        }
    }

    /// The path segment of this action.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Command => "command",
            Self::Metric => "metric",
            Self::Heartbeat => "heartbeat",
            Self::UpdateMetadata => "update_metadata",
            Self::ShutdownComponent => "shutdown_component",
            Self::Report => "report",
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Init ///////////////////////////////////////////////////////////////////////

/// The payload of the INIT action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializationConfig {
    /// All configs of the supervising process which the worker should run with.
    #[prost(map = "string, string", tag = "1")]
    pub aggregated_configs: ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
}

///////////////////////////////////////////////////////////////////////////////
// Command ////////////////////////////////////////////////////////////////////

/// A command to be executed against a resource partition.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IngestionTaskCommand {
    #[prost(enumeration = "IngestionCommandType", tag = "1")]
    pub command_type: i32,
    /// The resource name, formatted as `{store}_v{version}`.
    #[prost(string, tag = "2")]
    pub topic_name: ::prost::alloc::string::String,
    #[prost(int32, tag = "3")]
    pub partition_id: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// The type of an ingestion command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IngestionCommandType {
    StartConsumption = 0,
    StopConsumption = 1,
    KillConsumption = 2,
    ResetConsumption = 3,
    IsPartitionConsuming = 4,
    RemoveStorageEngine = 5,
    RemovePartition = 6,
    OpenStorageEngine = 7,
    PromoteToLeader = 8,
    DemoteToStandby = 9,
}

///////////////////////////////////////////////////////////////////////////////
// Report /////////////////////////////////////////////////////////////////////

/// A report sent back to the supervising process, either as a command response or as an
/// asynchronous lifecycle event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IngestionTaskReport {
    #[prost(enumeration = "IngestionReportType", tag = "1")]
    pub report_type: i32,
    #[prost(bool, tag = "2")]
    pub is_positive: bool,
    /// A human readable message; negative reports carry `<causeKind>_<detail>`.
    #[prost(string, tag = "3")]
    pub message: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub topic_name: ::prost::alloc::string::String,
    #[prost(int32, tag = "5")]
    pub partition_id: i32,
    #[prost(int64, tag = "6")]
    pub offset: i64,
}

impl IngestionTaskReport {
    /// A positive report for the given resource partition.
    pub fn positive(topic_name: impl Into<String>, partition_id: i32) -> Self {
        Self {
            is_positive: true,
            topic_name: topic_name.into(),
            partition_id,
            ..Default::default()
        }
    }
}

/// The type of a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IngestionReportType {
    Completed = 0,
    Error = 1,
    Started = 2,
    Restarted = 3,
    Progress = 4,
    EndOfPushReceived = 5,
    StartOfBufferReplayReceived = 6,
    StartOfIncrementalPushReceived = 7,
    EndOfIncrementalPushReceived = 8,
    TopicSwitchReceived = 9,
}

///////////////////////////////////////////////////////////////////////////////
// Metrics ////////////////////////////////////////////////////////////////////

/// The response of the METRIC action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IngestionMetricsReport {
    #[prost(map = "string, double", tag = "1")]
    pub aggregated_metrics: ::std::collections::HashMap<::prost::alloc::string::String, f64>,
}

///////////////////////////////////////////////////////////////////////////////
// Update Metadata ////////////////////////////////////////////////////////////

/// The payload of the UPDATE_METADATA action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IngestionStorageMetadata {
    #[prost(enumeration = "IngestionMetadataUpdateType", tag = "1")]
    pub metadata_update_type: i32,
    #[prost(string, tag = "2")]
    pub topic_name: ::prost::alloc::string::String,
    #[prost(int32, tag = "3")]
    pub partition_id: i32,
    /// An opaque, already serialized offset record or store version state.
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// The type of a storage metadata update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IngestionMetadataUpdateType {
    PutOffsetRecord = 0,
    ClearOffsetRecord = 1,
    PutStoreVersionState = 2,
    ClearStoreVersionState = 3,
}

///////////////////////////////////////////////////////////////////////////////
// Shutdown Component /////////////////////////////////////////////////////////

/// The payload of the SHUTDOWN_COMPONENT action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessShutdownCommand {
    #[prost(enumeration = "IngestionComponentType", tag = "1")]
    pub component_type: i32,
}

/// A worker component which may be shutdown individually.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IngestionComponentType {
    ConsumptionService = 0,
    StorageService = 1,
}
