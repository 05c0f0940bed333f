//! Data models.

pub mod proto;
mod resource;

pub use proto::*;
pub use resource::{PartitionKey, Replica, ResourceId, Role, Store};
