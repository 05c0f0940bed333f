//! Hadron ingestion error abstractions.

use http::StatusCode;
use thiserror::Error;

use crate::models::Role;

/// The cause kind used for errors which carry no typed ingestion error.
pub const CAUSE_KIND_UNKNOWN: &str = "Exception";

/// Application error variants.
///
/// These govern how a request is answered at the transport level.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The ingestion service has not completed its INIT action.
    #[error("ingestion service has not been initiated")]
    NotInitiated,
    /// The ingestion service has already been initiated.
    #[error("ingestion service has already been initiated")]
    AlreadyInitiated,
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

impl AppError {
    /// Get the HTTP status code and message for this error.
    pub fn into_status(self) -> (StatusCode, String) {
        match self {
            AppError::InvalidInput(_) | AppError::NotInitiated | AppError::AlreadyInitiated => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Ise(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)),
        }
    }
}

/// Errors raised while executing ingestion commands and partition transitions.
///
/// Each variant has a stable cause kind which prefixes negative report messages.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("ingestion service has not been initiated")]
    NotInitiated,
    #[error("ingestion isolation is not enabled")]
    IsolationDisabled,
    #[error("invalid transition for {key} from {from} to {to}")]
    InvalidTransition { key: String, from: Role, to: Role },
    #[error("replica {key} is in the ERROR state and must be reset first")]
    ReplicaInError { key: String },
    #[error("partition {key} is being unsubscribed")]
    Fenced { key: String },
    #[error("stale section {section} for partition {key}, current section is {current}")]
    StaleSection { key: String, section: u64, current: u64 },
    #[error("timed out after {hours}h waiting for partition {key} to complete consumption")]
    Timeout { key: String, hours: u64 },
    #[error("partition {key} did not stop consuming after {retries} checks")]
    StopTimeout { key: String, retries: u32 },
    #[error("consumption of {key} was killed")]
    Killed { key: String },
    #[error("consumption of {key} failed: {reason}")]
    ConsumptionFailed { key: String, reason: String },
    #[error("unsupported command type {0}")]
    UnsupportedCommand(i32),
    #[error("unsupported metadata update type {0}")]
    UnsupportedMetadataUpdate(i32),
    #[error("unsupported component type {0}")]
    UnsupportedComponent(i32),
    #[error("invalid resource name {0}")]
    InvalidResource(String),
}

impl IngestionError {
    /// The machine parsable kind of this error.
    pub fn cause_kind(&self) -> &'static str {
        match self {
            Self::NotInitiated => "NotInitiated",
            Self::IsolationDisabled => "IsolationDisabled",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::ReplicaInError { .. } => "ReplicaInError",
            Self::Fenced { .. } => "Fenced",
            Self::StaleSection { .. } => "StaleSection",
            Self::Timeout { .. } => "Timeout",
            Self::StopTimeout { .. } => "StopTimeout",
            Self::Killed { .. } => "Killed",
            Self::ConsumptionFailed { .. } => "ConsumptionFailed",
            Self::UnsupportedCommand(_) => "UnsupportedCommand",
            Self::UnsupportedMetadataUpdate(_) => "UnsupportedMetadataUpdate",
            Self::UnsupportedComponent(_) => "UnsupportedComponent",
            Self::InvalidResource(_) => "InvalidResource",
        }
    }
}

/// Render the given error as a `<causeKind>_<detail>` message for negative reports.
pub fn cause_message(err: &anyhow::Error) -> String {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<IngestionError>())
        .map(IngestionError::cause_kind)
        .unwrap_or(CAUSE_KIND_UNKNOWN);
    format!("{}_{:#}", kind, err)
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
