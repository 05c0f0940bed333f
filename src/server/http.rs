use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONNECTION};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::IngestionService;
use crate::config::Config;

/// The HTTP/1 server carrying the ingestion control protocol.
pub struct ControlServer {
    service: Arc<IngestionService>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,

    listener: TcpListener,
}

impl ControlServer {
    /// Construct a new instance, binding the control protocol port.
    pub async fn new(config: &Config, service: Arc<IngestionService>, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.service_port))
            .await
            .context("error binding socket address for control server")?;
        Ok(Self {
            service,
            shutdown_rx: shutdown.subscribe(),
            shutdown_tx: shutdown,
            listener,
        })
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error reading control server address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "control server is listening");
        loop {
            tokio::select! {
                sock_res = self.listener.accept() => {
                    let (stream, addr) = match sock_res {
                        Ok((stream, addr)) => (stream, addr),
                        Err(err) => {
                            tracing::error!(error = ?err, "error accepting control socket connection");
                            let _res = self.shutdown_tx.send(());
                            break;
                        }
                    };
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        let svc = service_fn(move |req| handle(service.clone(), req));
                        if let Err(err) = Http::new().http1_only(true).serve_connection(stream, svc).await {
                            tracing::debug!(error = ?err, %addr, "control connection closed with error");
                        }
                    });
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("control server has shutdown");
        Ok(())
    }
}

async fn handle(service: Arc<IngestionService>, req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
    let (parts, body) = req.into_parts();
    let res = match hyper::body::to_bytes(body).await {
        Ok(body) => service.handle_request(&parts.method, parts.uri.path(), body).await,
        Err(err) => {
            tracing::error!(error = ?err, "error reading control request body");
            return Ok(close_with(http::StatusCode::INTERNAL_SERVER_ERROR, Body::from(err.to_string())));
        }
    };
    if res.close {
        return Ok(close_with(res.status, Body::from(res.body)));
    }
    let mut response = Response::new(Body::from(res.body));
    *response.status_mut() = res.status;
    Ok(response)
}

/// Build a response which instructs hyper to close the connection once written.
fn close_with(status: http::StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
