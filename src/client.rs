//! The supervisor side of the control protocol.
//!
//! `IngestionClient` drives a worker through the same POST-per-action contract that the
//! worker's control server serves, and `HttpTransport` is shared with the worker's report
//! sink which POSTs reports back to the supervisor.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use prost::Message;

use crate::models::{
    IngestionAction, IngestionCommandType, IngestionComponentType, IngestionMetricsReport, IngestionStorageMetadata, IngestionTaskCommand, IngestionTaskReport,
    InitializationConfig, PartitionKey, ProcessShutdownCommand,
};
use crate::utils;

/// A non-200 answer from the remote end.
#[derive(Debug, thiserror::Error)]
#[error("request failed with status {status}: {body}")]
pub struct StatusError {
    pub status: StatusCode,
    pub body: String,
}

/// A minimal HTTP/1 transport for protobuf payloads.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector>,
    base: String,
}

impl HttpTransport {
    /// Create a new instance targeting the given base URL, e.g. `http://127.0.0.1:7000`.
    pub fn new(base: &str) -> Result<Self> {
        let base = base.trim_end_matches('/').to_string();
        let _uri: Uri = base.parse().with_context(|| format!("invalid base url {}", base))?;
        Ok(Self { client: Client::new(), base })
    }

    /// POST the given raw body to the given path, returning the body of a 200 response.
    pub async fn post_bytes(&self, path: &str, body: Vec<u8>) -> Result<Bytes> {
        let uri: Uri = format!("{}/{}", self.base, path.trim_start_matches('/'))
            .parse()
            .context("error building request uri")?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::from(body))
            .context("error building request")?;
        let res = self.client.request(req).await.context("error sending request")?;
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await.context("error reading response body")?;
        if status != StatusCode::OK {
            bail!(StatusError {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    /// POST the given model to the given path, returning the body of a 200 response.
    pub async fn post<M: Message>(&self, path: &str, model: &M) -> Result<Bytes> {
        let body = utils::encode_model(model)?;
        self.post_bytes(path, body).await
    }

    /// POST the given model to the given path, decoding the response as `R`.
    pub async fn request<M: Message, R: Message + Default>(&self, path: &str, model: &M) -> Result<R> {
        let body = self.post(path, model).await?;
        utils::decode_model(&body)
    }
}

/// A client of an ingestion worker's control server.
#[derive(Clone)]
pub struct IngestionClient {
    transport: HttpTransport,
}

impl IngestionClient {
    /// Create a client of the worker listening on the given local port.
    pub fn new(port: u16) -> Result<Self> {
        Self::with_base(&format!("http://127.0.0.1:{}", port))
    }

    /// Create a client of the worker at the given base URL.
    pub fn with_base(base: &str) -> Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(base)?,
        })
    }

    /// Initialize the worker with the given aggregated configs.
    pub async fn init(&self, aggregated_configs: HashMap<String, String>) -> Result<()> {
        let payload = InitializationConfig { aggregated_configs };
        self.transport
            .post(IngestionAction::Init.path_segment(), &payload)
            .await
            .context("error initializing ingestion worker")?;
        Ok(())
    }

    /// Execute a command against the given partition.
    pub async fn command(&self, command_type: IngestionCommandType, key: &PartitionKey) -> Result<IngestionTaskReport> {
        let mut command = IngestionTaskCommand {
            topic_name: key.resource.name(),
            partition_id: key.partition as i32,
            ..Default::default()
        };
        command.set_command_type(command_type);
        self.send_command(&command).await
    }

    /// Execute the given raw command.
    pub async fn send_command(&self, command: &IngestionTaskCommand) -> Result<IngestionTaskReport> {
        self.transport
            .request(IngestionAction::Command.path_segment(), command)
            .await
            .with_context(|| format!("error executing command {} on {}/{}", command.command_type, command.topic_name, command.partition_id))
    }

    /// Fetch the worker's current metrics.
    pub async fn metric(&self) -> Result<IngestionMetricsReport> {
        self.transport
            .post_bytes(IngestionAction::Metric.path_segment(), vec![])
            .await
            .and_then(|body| utils::decode_model(&body))
            .context("error fetching worker metrics")
    }

    /// Let the worker know that its supervisor is alive.
    pub async fn heartbeat(&self) -> Result<()> {
        self.transport
            .post_bytes(IngestionAction::Heartbeat.path_segment(), vec![])
            .await
            .context("error sending heartbeat")?;
        Ok(())
    }

    /// Apply a storage metadata update on the worker.
    pub async fn update_metadata(&self, metadata: &IngestionStorageMetadata) -> Result<IngestionTaskReport> {
        self.transport
            .request(IngestionAction::UpdateMetadata.path_segment(), metadata)
            .await
            .context("error updating worker storage metadata")
    }

    /// Shutdown one component of the worker.
    pub async fn shutdown_component(&self, component: IngestionComponentType) -> Result<IngestionTaskReport> {
        let mut command = ProcessShutdownCommand::default();
        command.set_component_type(component);
        self.transport
            .request(IngestionAction::ShutdownComponent.path_segment(), &command)
            .await
            .with_context(|| format!("error shutting down worker component {:?}", component))
    }
}
