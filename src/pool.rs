//! Connection pool for backend HTTP connections
//!
//! This module provides connection pooling for efficient reuse of HTTP connections
//! to backend servers, reducing latency and resource usage.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// CORS response headers stripped from proxied backend responses — the
/// control plane, not the backend, owns CORS.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
    "access-control-allow-credentials",
    "access-control-expose-headers",
    "access-control-max-age",
];

pub fn strip_cors_headers(response: &mut Response<BoxBody<Bytes, hyper::Error>>) {
    for name in STRIPPED_RESPONSE_HEADERS {
        response.headers_mut().remove(*name);
    }
}

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Total number of health check requests
    pub health_checks: AtomicU64,
}

impl PoolStats {
    /// Record a regular request
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a health check request
    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for health checks (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
    /// Client for forwarding requests whose body has already been buffered
    /// into memory (OpenAI front-door dispatch, which must peek the body
    /// before it knows which instance to forward to).
    buffered_client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // Build the main client with connection pooling
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Build a dedicated health check client (reused across health checks)
        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let buffered_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            buffered_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request through the connection pool, forwarding the path
    /// verbatim except for replacing it with `path_override` when set (used
    /// by the per-instance proxy to strip its own route prefix).
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        path_override: Option<&str>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = path_override.map(str::to_string).unwrap_or_else(|| {
            req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string())
        });
        let uri = format!("http://127.0.0.1:{port}{path}");

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();
        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Forward a request whose body has already been buffered into memory
    /// (the OpenAI front-door must peek the body's `model` field before it
    /// knows which instance to forward to).
    pub async fn send_buffered_request(
        &self,
        method: hyper::Method,
        uri_path_and_query: &str,
        headers: &hyper::HeaderMap,
        body: Bytes,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://127.0.0.1:{port}{uri_path_and_query}");
        let mut builder = Request::builder().method(method).uri(&uri);
        for (key, value) in headers.iter() {
            builder = builder.header(key, value);
        }
        let backend_req = builder
            .body(Full::new(body).map_err(|e| match e {}).boxed())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();
        let response = self.buffered_client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Check if a backend is reachable (useful for health checks)
    /// Uses the dedicated health check client for connection reuse
    pub async fn check_backend(&self, port: u16, path: &str) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        // Record health check
        self.stats.record_health_check();

        // Use the dedicated health client (reused across checks)
        match self.health_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
