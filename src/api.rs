//! External Interfaces (C10) — Management API and OpenAI-compatible model
//! listing (§6). The reverse-proxy passthrough routes themselves live in
//! `proxy.rs`; this module owns everything else under `/api/v1`, plus the
//! `/v1/models` listing the proxy's front door calls into.
//!
//! Grounded in the teacher's `PlatformApi`/`ApiResponse<T>` dispatcher shape
//! (one method per route, a thin hyper-service wrapper owned by the caller)
//! generalized from app/addon/domain CRUD to instance/job/cache CRUD.
//!
//! Authentication (key extraction, constant-time compare) is named out of
//! scope for the core — spec.md §1 describes it only by the interface the
//! core consumes. `Dispatcher` therefore takes an `Arc<dyn Authorizer>`
//! rather than deciding auth policy itself; `BearerKeyAuthorizer` below is
//! one such implementation (a direct port of the bearer-token check this
//! crate needs by default), not something `Dispatcher`/`ProxyServer` are
//! hardwired to.

use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::warn;

use crate::cache;
use crate::config::Config;
use crate::download::DownloadEngine;
use crate::error::{self, json_error_response, Error};
use crate::instance::InstanceOptions;
use crate::registry::Registry;

/// Request body for `POST /backends/llama-cpp/models/download`.
#[derive(Debug, serde::Deserialize)]
pub struct DownloadRequest {
    pub repo: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadAccepted {
    pub job_id: String,
    pub repo: String,
    pub tag: String,
}

#[derive(Debug, Serialize)]
struct OpenAiModelList {
    object: &'static str,
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Serialize)]
struct OpenAiModel {
    id: String,
    object: &'static str,
    owned_by: &'static str,
    created: i64,
}

/// Decides whether a request may proceed, for the management API and the
/// OpenAI front door respectively. Authentication policy (how a caller is
/// identified, what "authorized" means) is an external collaborator's
/// decision per spec.md §1 — the core only consumes this interface.
pub trait Authorizer: Send + Sync {
    fn authorize_management(&self, req: &Request<Incoming>) -> bool;
    fn authorize_inference(&self, req: &Request<Incoming>) -> bool;
}

/// Default `Authorizer`: a bearer token compared in constant time against
/// the configured management/inference keys, absent when neither is set.
pub struct BearerKeyAuthorizer {
    config: Arc<Config>,
}

impl BearerKeyAuthorizer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Authorizer for BearerKeyAuthorizer {
    fn authorize_management(&self, req: &Request<Incoming>) -> bool {
        match &self.config.server.management_key {
            None => true,
            Some(key) => bearer_token(req).map(|token| constant_time_eq(token.as_bytes(), key.as_bytes())).unwrap_or(false),
        }
    }

    /// Either the inference key or the management key authorizes `/v1/*`.
    fn authorize_inference(&self, req: &Request<Incoming>) -> bool {
        if self.config.server.inference_key.is_none() && self.config.server.management_key.is_none() {
            return true;
        }
        let Some(token) = bearer_token(req) else { return false };
        let matches_inference = self
            .config
            .server
            .inference_key
            .as_ref()
            .map(|key| constant_time_eq(token.as_bytes(), key.as_bytes()))
            .unwrap_or(false);
        let matches_management = self
            .config
            .server
            .management_key
            .as_ref()
            .map(|key| constant_time_eq(token.as_bytes(), key.as_bytes()))
            .unwrap_or(false);
        matches_inference || matches_management
    }
}

/// Owns everything the management API and OpenAI front door need besides
/// the registry itself (which the caller threads through per-call, since
/// the registry is shared with the proxy layer).
pub struct Dispatcher {
    config: Arc<Config>,
    downloads: Arc<DownloadEngine>,
    authorizer: Arc<dyn Authorizer>,
}

impl Dispatcher {
    /// Wires up the default `BearerKeyAuthorizer`. Use `with_authorizer` to
    /// inject a different auth policy (e.g. one backed by an external
    /// auth service) without changing anything else about the dispatcher.
    pub fn new(config: Arc<Config>, downloads: Arc<DownloadEngine>) -> Self {
        let authorizer: Arc<dyn Authorizer> = Arc::new(BearerKeyAuthorizer::new(Arc::clone(&config)));
        Self::with_authorizer(config, downloads, authorizer)
    }

    pub fn with_authorizer(config: Arc<Config>, downloads: Arc<DownloadEngine>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { config, downloads, authorizer }
    }

    pub fn authorize_management(&self, req: &Request<Incoming>) -> bool {
        self.authorizer.authorize_management(req)
    }

    pub fn authorize_inference(&self, req: &Request<Incoming>) -> bool {
        self.authorizer.authorize_inference(req)
    }

    pub fn list_openai_models(&self, registry: &Arc<Registry>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let data = registry
            .list()
            .into_iter()
            .filter(|v| v.status == crate::instance::InstanceStatus::Ready)
            .map(|v| OpenAiModel {
                id: v.name,
                object: "model",
                owned_by: "llamactl",
                created: v.created_at.timestamp(),
            })
            .collect();
        json_response(StatusCode::OK, &OpenAiModelList { object: "list", data })
    }

    pub async fn handle(&self, req: Request<Incoming>, registry: &Arc<Registry>) -> Response<BoxBody<Bytes, hyper::Error>> {
        if !self.authorize_management(&req) {
            return unauthorized();
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();

        match (&method, segments.as_slice()) {
            (&Method::GET, ["api", "v1", "instances"]) => json_response(StatusCode::OK, &registry.list()),

            (&Method::POST, ["api", "v1", "instances", name]) => match read_json::<InstanceOptions>(req).await {
                Ok(options) => result_response(registry.create(name, options), StatusCode::CREATED),
                Err(resp) => resp,
            },

            (&Method::GET, ["api", "v1", "instances", name]) => result_response(registry.get(name), StatusCode::OK),

            (&Method::PUT, ["api", "v1", "instances", name]) => match read_json::<InstanceOptions>(req).await {
                Ok(options) => match registry.update(name, options).await {
                    Ok(view) => json_response(StatusCode::OK, &view),
                    Err(e) => json_error_response(&e),
                },
                Err(resp) => resp,
            },

            (&Method::DELETE, ["api", "v1", "instances", name]) => match registry.delete(name).await {
                Ok(()) => empty_response(StatusCode::NO_CONTENT),
                Err(e) => json_error_response(&e),
            },

            (&Method::POST, ["api", "v1", "instances", name, "start"]) => match registry.start(name).await {
                Ok(view) => json_response(StatusCode::OK, &view),
                Err(e) => json_error_response(&e),
            },

            (&Method::POST, ["api", "v1", "instances", name, "stop"]) => match registry.stop(name).await {
                Ok(view) => json_response(StatusCode::OK, &view),
                Err(e) => json_error_response(&e),
            },

            (&Method::POST, ["api", "v1", "instances", name, "restart"]) => match registry.restart(name).await {
                Ok(view) => json_response(StatusCode::OK, &view),
                Err(e) => json_error_response(&e),
            },

            (&Method::GET, ["api", "v1", "instances", name, "logs"]) => {
                let lines = query
                    .as_deref()
                    .and_then(|q| query_param(q, "lines"))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(100);
                match registry.logs(name, lines).await {
                    Ok(text) => text_response(StatusCode::OK, text),
                    Err(e) => json_error_response(&e),
                }
            }

            (&Method::POST, ["api", "v1", "backends", "llama-cpp", "models", "download"]) => {
                match read_json::<DownloadRequest>(req).await {
                    Ok(body) => match self.downloads.start_download(&body.repo, body.tag.as_deref()) {
                        Ok(job) => json_response(
                            StatusCode::ACCEPTED,
                            &DownloadAccepted { job_id: job.id, repo: job.repo, tag: job.tag },
                        ),
                        Err(e) => json_error_response(&e),
                    },
                    Err(resp) => resp,
                }
            }

            (&Method::GET, ["api", "v1", "backends", "llama-cpp", "models"]) => {
                match cache::list_cached(std::path::Path::new(&self.config.cache_dir.cache_dir)).await {
                    Ok(models) => json_response(StatusCode::OK, &models),
                    Err(e) => json_error_response(&e),
                }
            }

            (&Method::DELETE, ["api", "v1", "backends", "llama-cpp", "models"]) => {
                let q = query.unwrap_or_default();
                let Some(repo) = query_param(&q, "repo") else {
                    return json_error_response(&error::invalid_options("missing required query parameter 'repo'"));
                };
                let tag = query_param(&q, "tag");
                match cache::delete_model(std::path::Path::new(&self.config.cache_dir.cache_dir), &repo, tag.as_deref()).await {
                    Ok(()) => empty_response(StatusCode::NO_CONTENT),
                    Err(e) => json_error_response(&e),
                }
            }

            (&Method::GET, ["api", "v1", "backends", "llama-cpp", "jobs"]) => {
                json_response(StatusCode::OK, &self.downloads.list_jobs())
            }

            (&Method::GET, ["api", "v1", "backends", "llama-cpp", "jobs", id]) => {
                result_response(self.downloads.get_job(id), StatusCode::OK)
            }

            (&Method::DELETE, ["api", "v1", "backends", "llama-cpp", "jobs", id]) => match self.downloads.delete_job(id) {
                Ok(()) => empty_response(StatusCode::NO_CONTENT),
                Err(e) => json_error_response(&e),
            },

            (&Method::POST, ["api", "v1", "backends", "llama-cpp", "jobs", id, "cancel"]) => {
                match self.downloads.cancel_job(id) {
                    Ok(()) => empty_response(StatusCode::NO_CONTENT),
                    Err(e) => json_error_response(&e),
                }
            }

            _ => json_error_response(&error::not_found(format!("no route for {method} {path}"))),
        }
    }
}

fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Compares two byte strings in time proportional to the longer input,
/// independent of where they first differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(percent_decode(v))
        } else {
            None
        }
    })
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok().and_then(|s| u8::from_str_radix(s, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<BoxBody<Bytes, hyper::Error>>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return Err(json_error_response(&error::invalid_options("failed to read request body")));
        }
    };
    serde_json::from_slice(&body).map_err(|e| json_error_response(&error::invalid_options(format!("malformed request body: {e}"))))
}

fn result_response<T: Serialize>(result: Result<T, Error>, status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    match result {
        Ok(value) => json_response(status, &value),
        Err(e) => json_error_response(&e),
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response")
}

fn text_response(status: StatusCode, text: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(text)).map_err(|e| match e {}).boxed())
        .expect("valid response")
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder().status(status).body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed()).expect("valid response")
}

fn unauthorized() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from_static(br#"{"error":{"message":"unauthorized","kind":"ErrUnauthorized"}}"#))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_and_rejects_different_lengths() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"SECRET"));
    }

    #[test]
    fn query_param_decodes_percent_and_plus() {
        let q = "repo=org%2Fmodel&tag=Q4_K_M";
        assert_eq!(query_param(q, "repo"), Some("org/model".to_string()));
        assert_eq!(query_param(q, "tag"), Some("Q4_K_M".to_string()));
        assert_eq!(query_param(q, "missing"), None);
    }

    #[test]
    fn percent_decode_handles_space_encodings() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
    }
}
