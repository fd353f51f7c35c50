//! Management API server
//!
//! Thin HTTP layer over the lifecycle controller and the proxy reconciler.
//! Each connection is served as an independent task; `GET /servers/{id}/logs`
//! upgrades to the WebSocket log-stream channel.

use crate::error::{Error, Result as CoreResult};
use crate::logs;
use crate::proxy::ProxyReconciler;
use crate::runtime::LogChunk;
use crate::server::{CreateServerRequest, ServerManager};
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, UPGRADE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Request to update the proxy's default connection target
#[derive(Debug, Deserialize)]
struct UpdateProxyRequest {
    #[serde(default)]
    default_server_id: Option<String>,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Management API server
pub struct ApiServer {
    addr: SocketAddr,
    servers: Arc<ServerManager>,
    proxy: Arc<ProxyReconciler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        addr: SocketAddr,
        servers: Arc<ServerManager>,
        proxy: Arc<ProxyReconciler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            addr,
            servers,
            proxy,
            shutdown_rx,
        }
    }

    /// Run the API server until shutdown is signalled
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Management API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        // with_upgrades keeps the connection alive for the log-stream channel
        AutoBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .map(|s| s.to_string())
            .collect();
        let segments: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

        debug!(%method, %path, "API request");

        match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => Ok(json_response(
                StatusCode::OK,
                r#"{"status":"healthy"}"#.to_string(),
            )),

            // Servers
            (Method::POST, ["servers"]) => self.create_server(req).await,
            (Method::GET, ["servers"]) => Ok(self.list_servers().await),
            (Method::GET, ["servers", id, "logs"]) if !id.is_empty() => {
                let id = id.to_string();
                self.stream_logs(req, id).await
            }
            (Method::GET, ["servers", id]) if !id.is_empty() => {
                Ok(self.get_server(id).await)
            }
            (Method::DELETE, ["servers", id]) if !id.is_empty() => {
                Ok(self.delete_server(id).await)
            }
            (Method::POST, ["servers", id, "start"]) if !id.is_empty() => {
                Ok(respond(self.servers.start_server(id).await))
            }
            (Method::POST, ["servers", id, "stop"]) if !id.is_empty() => {
                Ok(respond(self.servers.stop_server(id).await))
            }

            // Proxy
            (Method::GET, ["proxy"]) => Ok(self.get_proxy().await),
            (Method::PATCH, ["proxy"]) => self.update_proxy(req).await,
            (Method::POST, ["proxy", "start"]) => Ok(self.start_proxy().await),
            (Method::POST, ["proxy", "stop"]) => Ok(respond(self.proxy.stop_proxy().await)),
            (Method::POST, ["proxy", "regenerate-config"]) => {
                Ok(self.regenerate_proxy_config().await)
            }

            _ => Ok(json_response(
                StatusCode::NOT_FOUND,
                serde_json::to_string(&ApiResponse::<()>::error("not found"))
                    .unwrap_or_default(),
            )),
        }
    }

    async fn create_server(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let body = req.collect().await?.to_bytes();
        let request: CreateServerRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return Ok(error_response(&Error::Validation(format!(
                    "invalid request body: {}",
                    e
                ))));
            }
        };

        match self.servers.create_server(request).await {
            Ok(server) => Ok(json_response(
                StatusCode::CREATED,
                serde_json::to_string(&ApiResponse::ok(server)).unwrap_or_default(),
            )),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn list_servers(&self) -> Response<Full<Bytes>> {
        respond(self.servers.list_servers().await)
    }

    async fn get_server(&self, id: &str) -> Response<Full<Bytes>> {
        respond(self.servers.get_server(id).await)
    }

    async fn delete_server(&self, id: &str) -> Response<Full<Bytes>> {
        match self.servers.delete_server(id).await {
            Ok(()) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .expect("valid response"),
            Err(e) => error_response(&e),
        }
    }

    async fn get_proxy(&self) -> Response<Full<Bytes>> {
        // First access creates the proxy; afterwards this is a synced read
        match self.proxy.ensure_proxy_exists().await {
            Ok(_) => respond(self.proxy.get_proxy().await),
            Err(e) => error_response(&e),
        }
    }

    async fn update_proxy(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let body = req.collect().await?.to_bytes();
        let request: UpdateProxyRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return Ok(error_response(&Error::Validation(format!(
                    "invalid request body: {}",
                    e
                ))));
            }
        };

        Ok(respond(
            self.proxy
                .update_default_target(request.default_server_id)
                .await,
        ))
    }

    async fn start_proxy(&self) -> Response<Full<Bytes>> {
        let proxy = match self.proxy.ensure_proxy_exists().await {
            Ok(proxy) => proxy,
            Err(e) => return error_response(&e),
        };

        if proxy.status != crate::db::Status::Running {
            if let Err(e) = self.proxy.start_proxy().await {
                return error_response(&e);
            }
        }

        // Refresh the deployed routing table now that the proxy is up
        if let Err(e) = self.proxy.regenerate_config().await {
            warn!(error = %e, "Failed to regenerate proxy config after start");
        }

        respond(self.proxy.get_proxy().await)
    }

    async fn regenerate_proxy_config(&self) -> Response<Full<Bytes>> {
        match self.proxy.regenerate_config().await {
            Ok(()) => json_response(
                StatusCode::OK,
                serde_json::to_string(&ApiResponse::ok("configuration regenerated"))
                    .unwrap_or_default(),
            ),
            Err(e) => error_response(&e),
        }
    }

    async fn stream_logs(
        &self,
        req: Request<Incoming>,
        id: String,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let (follow, tail) = parse_log_query(req.uri().query());

        // Verify the server exists before upgrading
        if let Err(e) = self.servers.get_server(&id).await {
            return Ok(error_response(&e));
        }

        if !is_upgrade_request(&req) {
            return Ok(self.collect_logs(&id, tail).await);
        }

        let client_key = match req
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
        {
            Some(key) => key.to_string(),
            None => {
                return Ok(error_response(&Error::Validation(
                    "missing Sec-WebSocket-Key header".to_string(),
                )));
            }
        };

        let log_stream = match self.servers.logs(&id, follow, Some(tail)).await {
            Ok(stream) => stream,
            Err(e) => return Ok(error_response(&e)),
        };

        let manager = Arc::clone(&self.servers);
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    logs::run_session(upgraded, manager, id, log_stream, shutdown_rx).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to upgrade log-stream connection");
                }
            }
        });

        Ok(Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header("Sec-WebSocket-Accept", logs::accept_key(&client_key))
            .body(Full::new(Bytes::new()))
            .expect("valid response"))
    }

    /// Plain GET without an upgrade returns a bounded log tail
    async fn collect_logs(&self, id: &str, tail: u32) -> Response<Full<Bytes>> {
        let mut stream = match self.servers.logs(id, false, Some(tail)).await {
            Ok(stream) => stream,
            Err(e) => return error_response(&e),
        };

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogChunk::Stdout(bytes)) | Ok(LogChunk::Stderr(bytes)) => {
                    output.push_str(&String::from_utf8_lossy(&bytes));
                }
                Err(e) => {
                    warn!(server_id = id, error = %e, "Error collecting logs");
                    break;
                }
            }
        }

        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(output)))
            .expect("valid response")
    }
}

/// Check whether a request asks for a connection upgrade
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Parse `follow` (default true) and `tail` (default 100) query parameters
fn parse_log_query(query: Option<&str>) -> (bool, u32) {
    let mut follow = true;
    let mut tail = 100u32;

    if let Some(query) = query {
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("follow", value)) => follow = value != "false",
                Some(("tail", value)) => {
                    if let Ok(n) = value.parse() {
                        tail = n;
                    }
                }
                _ => {}
            }
        }
    }

    (follow, tail)
}

fn respond<T: Serialize>(result: CoreResult<T>) -> Response<Full<Bytes>> {
    match result {
        Ok(data) => json_response(
            StatusCode::OK,
            serde_json::to_string(&ApiResponse::ok(data)).unwrap_or_default(),
        ),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &Error) -> Response<Full<Bytes>> {
    json_response(
        error.status_code(),
        serde_json::to_string(&ApiResponse::<()>::error(error.to_string()))
            .unwrap_or_default(),
    )
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_query_defaults() {
        assert_eq!(parse_log_query(None), (true, 100));
        assert_eq!(parse_log_query(Some("")), (true, 100));
    }

    #[test]
    fn test_parse_log_query_values() {
        assert_eq!(parse_log_query(Some("follow=false&tail=50")), (false, 50));
        assert_eq!(parse_log_query(Some("tail=abc")), (true, 100));
        assert_eq!(parse_log_query(Some("follow=true")), (true, 100));
    }

    #[test]
    fn test_api_response_shapes() {
        let ok = serde_json::to_string(&ApiResponse::ok(42)).unwrap();
        assert_eq!(ok, r#"{"success":true,"data":42}"#);

        let err = serde_json::to_string(&ApiResponse::<()>::error("nope")).unwrap();
        assert_eq!(err, r#"{"success":false,"error":"nope"}"#);
    }
}
