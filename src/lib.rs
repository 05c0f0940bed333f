//! The Hadron isolated ingestion worker.
//!
//! A control plane which drives per-partition replica roles over a consumption engine & a
//! storage engine, serves the ingestion control protocol to its supervising process, pushes
//! lifecycle reports back to it, and reclaims leaked storage engines.

pub mod app;
pub mod backend;
pub mod cleaner;
pub mod client;
pub mod collectors;
pub mod config;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod notifier;
pub mod server;
pub mod state_model;
pub mod storage;
pub mod utils;

// Public exports for binaries.
pub use crate::app::{init_tracing, App};
pub use crate::backend::{ComponentFactory, Components};
pub use crate::client::IngestionClient;
pub use crate::config::{Config, IngestionConfig};
pub use crate::notifier::IngestionNotifier;
