//! Reverse Proxy Layer (C6) — per-instance proxy and OpenAI-compatible
//! front door.
//!
//! Grounded in the teacher's `ProxyServer`/`handle_connection`/`handle_request`
//! accept loop and its WebSocket-upgrade machinery (`is_upgrade_request`,
//! `build_upgrade_request`, `parse_upgrade_response`, `forward_bidirectional`),
//! which is kept close to verbatim. Host-header backend dispatch is replaced
//! with path-based instance dispatch through the registry and activator;
//! ACME/TLS/HTTPS-redirect are dropped (out of spec scope).

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activator::Activator;
use crate::api::Dispatcher;
use crate::error::{self, json_error_response, Error};
use crate::pool::{strip_cors_headers, ConnectionPool, PoolConfig};
use crate::registry::Registry;

const X_REQUEST_ID: &str = "x-request-id";

/// Matches the routing table in spec.md §6: a per-instance proxy mounted
/// under `/api/v1/instances/{name}/proxy`, an OpenAI front door under
/// `/v1/*`, and everything else delegated to the management-API dispatcher.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    activator: Arc<Activator>,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        activator: Arc<Activator>,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, registry, activator, dispatcher, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        activator: Arc<Activator>,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            activator,
            dispatcher,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let activator = Arc::clone(&self.activator);
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, activator, dispatcher, pool).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    activator: Arc<Activator>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let activator = Arc::clone(&activator);
        let dispatcher = Arc::clone(&dispatcher);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registry, activator, dispatcher, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    activator: Arc<Activator>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), path, request_id, client = %client_addr, "incoming request");

    if let Some(name) = instance_proxy_name(&path) {
        if !dispatcher.authorize_management(&req) {
            return Ok(unauthorized_response());
        }
        return Ok(proxy_to_instance(req, &name, &registry, &activator, &pool).await);
    }

    if path == "/v1/models" && req.method() == hyper::Method::GET {
        if !dispatcher.authorize_inference(&req) {
            return Ok(unauthorized_response());
        }
        return Ok(dispatcher.list_openai_models(&registry));
    }

    if path.starts_with("/v1/") {
        if !dispatcher.authorize_inference(&req) {
            return Ok(unauthorized_response());
        }
        let max_body_bytes = registry.config().server.max_body_bytes;
        return Ok(dispatch_openai(req, &registry, &activator, &pool, max_body_bytes).await);
    }

    Ok(dispatcher.handle(req, &registry).await)
}

/// `/api/v1/instances/{name}/proxy` and everything under it.
fn instance_proxy_name(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/api/v1/instances/")?;
    let (name, tail) = rest.split_once('/')?;
    if tail == "proxy" || tail.starts_with("proxy/") {
        Some(name.to_string())
    } else {
        None
    }
}

fn strip_proxy_prefix(path_and_query: &str, name: &str) -> String {
    let prefix = format!("/api/v1/instances/{name}/proxy");
    let rest = path_and_query.strip_prefix(&prefix).unwrap_or(path_and_query);
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

/// Forwards every method/header/body to the instance's backend port,
/// activating it on demand if needed. Response `Access-Control-*` headers
/// are stripped; a successful forward touches `last-request-time`.
async fn proxy_to_instance(
    req: Request<Incoming>,
    name: &str,
    registry: &Arc<Registry>,
    activator: &Arc<Activator>,
    pool: &Arc<ConnectionPool>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let view = match activator.ensure_ready(name).await {
        Ok(view) => view,
        Err(e) => return json_error_response(&e),
    };
    let Some(port) = view.port else {
        return json_error_response(&error::not_running(format!("instance '{name}' has no bound port")));
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, name, port, registry).await;
    }

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    let forward_path = strip_proxy_prefix(&path_and_query, name);

    match pool.send_request(req, port, Some(&forward_path)).await {
        Ok(mut response) => {
            strip_cors_headers(&mut response);
            if let Some(instance) = registry.find_by_name(name) {
                instance.touch();
            }
            response
        }
        Err(e) => {
            error!(name, port, error = %e, "failed to forward request to instance");
            json_error_response(&error::upstream(format!("failed to connect to backend: {e}")))
        }
    }
}

/// `POST /v1/*`: peek the buffered body's `model` field, activate the named
/// instance on demand, then forward. Oversized bodies are rejected with 413
/// before the instance is even resolved.
async fn dispatch_openai(
    req: Request<Incoming>,
    registry: &Arc<Registry>,
    activator: &Arc<Activator>,
    pool: &Arc<ConnectionPool>,
    max_body_bytes: usize,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (parts, body) = req.into_parts();

    let collected = match http_body_util::Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected,
        Err(_) => {
            return Response::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .body(
                    http_body_util::Full::new(Bytes::from_static(b"request body too large"))
                        .map_err(|e| match e {})
                        .boxed(),
                )
                .expect("valid response");
        }
    };
    let body_bytes = collected.to_bytes();

    let model = match extract_model_field(&body_bytes) {
        Some(model) => model,
        None => return json_error_response(&error::invalid_options("request body missing a 'model' string field")),
    };

    let view = match activator.ensure_ready(&model).await {
        Ok(view) => view,
        Err(e) => return json_error_response(&e),
    };
    let Some(port) = view.port else {
        return json_error_response(&error::not_running(format!("instance '{model}' has no bound port")));
    };

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    match pool.send_buffered_request(parts.method, path_and_query, &parts.headers, body_bytes, port).await {
        Ok(mut response) => {
            strip_cors_headers(&mut response);
            if let Some(instance) = registry.find_by_name(&model) {
                instance.touch();
            }
            response
        }
        Err(e) => {
            error!(model, port, error = %e, "failed to forward OpenAI request to instance");
            json_error_response(&error::upstream(format!("failed to connect to backend: {e}")))
        }
    }
}

/// Unauthenticated/mismatched key response. Not part of the `ErrorKind`
/// taxonomy (§7) since key extraction and comparison are an external
/// middleware concern the core only consumes the outcome of.
fn unauthorized_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .body(
            http_body_util::Full::new(Bytes::from_static(br#"{"error":{"message":"unauthorized","kind":"ErrUnauthorized"}}"#))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response")
}

fn extract_model_field(body: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type(req: &Request<Incoming>) -> Option<String> {
    req.headers().get(hyper::header::UPGRADE).and_then(|v| v.to_str().ok()).map(|s| s.to_lowercase())
}

async fn forward_bidirectional(client: Upgraded, backend: TcpStream, name: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((to_backend, to_client)) => {
            debug!(name, to_backend, to_client, "upgraded connection closed normally")
        }
        Err(e) => debug!(name, error = %e, "upgraded connection closed with error"),
    }
}

fn build_upgrade_request(req: &Request<Incoming>, name: &str, port: u16) -> Vec<u8> {
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    let path = strip_proxy_prefix(&path_and_query, name);
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (key, value) in req.headers() {
        if key == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{key}: {v}\r\n"));
        }
    }
    request.push_str(&format!("Host: 127.0.0.1:{port}\r\n\r\n"));
    request.into_bytes()
}

fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    name: &str,
    port: u16,
    registry: &Arc<Registry>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    let raw_request = build_upgrade_request(&req, name, port);

    let mut backend_stream = match TcpStream::connect(format!("127.0.0.1:{port}")).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(name, port, error = %e, "failed to connect to backend for upgrade");
            return json_error_response(&error::upstream(format!("failed to connect to backend: {e}")));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        return json_error_response(&error::upstream(format!("failed to send upgrade request: {e}")));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        _ => return json_error_response(&error::upstream("backend closed connection before responding to upgrade")),
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => return json_error_response(&error::upstream("invalid upgrade response from backend")),
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(name, status = %status, "backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (header_name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(header_name.as_str(), hv);
            }
        }
        return response
            .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
            .expect("valid response builder");
    }

    info!(name, upgrade_type, "upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (header_name, value) in &response_headers {
        let lower = header_name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(header_name.as_str(), hv);
        }
    }
    let response = response.body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed()).expect("valid response builder");

    let name = name.to_string();
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Some(instance) = registry.find_by_name(&name) {
                    instance.touch();
                }
                forward_bidirectional(upgraded, backend_stream, &name).await;
            }
            Err(e) => error!(name, error = %e, "failed to upgrade client connection"),
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_proxy_name_matches_proxy_subtree() {
        assert_eq!(instance_proxy_name("/api/v1/instances/llama-a/proxy"), Some("llama-a".to_string()));
        assert_eq!(instance_proxy_name("/api/v1/instances/llama-a/proxy/v1/completions"), Some("llama-a".to_string()));
        assert_eq!(instance_proxy_name("/api/v1/instances/llama-a/start"), None);
        assert_eq!(instance_proxy_name("/api/v1/instances"), None);
    }

    #[test]
    fn strip_proxy_prefix_leaves_backend_relative_path() {
        assert_eq!(strip_proxy_prefix("/api/v1/instances/llama-a/proxy/v1/completions", "llama-a"), "/v1/completions");
        assert_eq!(strip_proxy_prefix("/api/v1/instances/llama-a/proxy", "llama-a"), "/");
    }

    #[test]
    fn extract_model_field_reads_string() {
        let body = Bytes::from_static(br#"{"model":"llama-a","prompt":"hi"}"#);
        assert_eq!(extract_model_field(&body), Some("llama-a".to_string()));
        let missing = Bytes::from_static(br#"{"prompt":"hi"}"#);
        assert_eq!(extract_model_field(&missing), None);
    }
}
