//! Error taxonomy and JSON error responses for the control plane.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Error kinds named by the control plane's taxonomy (not Rust types — a
/// single flat enum, matching the way every external error surfaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    ErrInvalidName,
    ErrInvalidOptions,
    ErrInvalidPort,
    ErrPortInUse,
    ErrNoPorts,
    ErrDuplicate,
    ErrNotFound,
    ErrRunning,
    ErrNotRunning,
    ErrQuotaInstances,
    ErrRunningCap,
    ErrSpawn,
    ErrReadinessTimeout,
    ErrActivationTimeout,
    ErrUpstream,
    ErrManifestMalformed,
    ErrDiskIO,
    ErrCancelled,
}

impl ErrorKind {
    /// HTTP status derived from the kind, per the error handling design.
    pub fn status_code(&self) -> StatusCode {
        use ErrorKind::*;
        match self {
            ErrInvalidName | ErrInvalidOptions | ErrInvalidPort => StatusCode::BAD_REQUEST,
            ErrNotFound => StatusCode::NOT_FOUND,
            ErrRunning | ErrNotRunning | ErrDuplicate => StatusCode::CONFLICT,
            ErrRunningCap => StatusCode::TOO_MANY_REQUESTS,
            ErrActivationTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrUpstream => StatusCode::BAD_GATEWAY,
            ErrPortInUse | ErrNoPorts | ErrQuotaInstances | ErrSpawn | ErrReadinessTimeout
            | ErrManifestMalformed | ErrDiskIO | ErrCancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            ErrInvalidName => "ErrInvalidName",
            ErrInvalidOptions => "ErrInvalidOptions",
            ErrInvalidPort => "ErrInvalidPort",
            ErrPortInUse => "ErrPortInUse",
            ErrNoPorts => "ErrNoPorts",
            ErrDuplicate => "ErrDuplicate",
            ErrNotFound => "ErrNotFound",
            ErrRunning => "ErrRunning",
            ErrNotRunning => "ErrNotRunning",
            ErrQuotaInstances => "ErrQuotaInstances",
            ErrRunningCap => "ErrRunningCap",
            ErrSpawn => "ErrSpawn",
            ErrReadinessTimeout => "ErrReadinessTimeout",
            ErrActivationTimeout => "ErrActivationTimeout",
            ErrUpstream => "ErrUpstream",
            ErrManifestMalformed => "ErrManifestMalformed",
            ErrDiskIO => "ErrDiskIO",
            ErrCancelled => "ErrCancelled",
        }
    }
}

/// The crate's error type. Every fallible public operation returns this (or
/// wraps it via `anyhow` at the operational edges — process spawn, fs, HTTP).
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }
}

/// Helper macro-like constructors for call sites that just want a kind.
macro_rules! error_ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> Error {
            Error::new(ErrorKind::$kind, message)
        }
    };
}

error_ctor!(invalid_name, ErrInvalidName);
error_ctor!(invalid_options, ErrInvalidOptions);
error_ctor!(invalid_port, ErrInvalidPort);
error_ctor!(port_in_use, ErrPortInUse);
error_ctor!(no_ports, ErrNoPorts);
error_ctor!(duplicate, ErrDuplicate);
error_ctor!(not_found, ErrNotFound);
error_ctor!(running, ErrRunning);
error_ctor!(not_running, ErrNotRunning);
error_ctor!(quota_instances, ErrQuotaInstances);
error_ctor!(running_cap, ErrRunningCap);
error_ctor!(spawn, ErrSpawn);
error_ctor!(readiness_timeout, ErrReadinessTimeout);
error_ctor!(activation_timeout, ErrActivationTimeout);
error_ctor!(upstream, ErrUpstream);
error_ctor!(manifest_malformed, ErrManifestMalformed);
error_ctor!(disk_io, ErrDiskIO);
error_ctor!(cancelled, ErrCancelled);

/// JSON error response body: `{ "error": { "message": ..., "kind": ... } }`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub kind: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        ErrorResponse {
            error: ErrorBody {
                message: err.message.clone(),
                kind: err.kind.as_str().to_string(),
            },
        }
    }
}

impl ErrorResponse {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":{{"message":"{}","kind":"{}"}}}}"#,
                self.error.message.replace('\"', "\\\""),
                self.error.kind
            )
        })
    }
}

/// Build a hyper JSON error response from an `Error`.
pub fn json_error_response(err: &Error) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = err.status_code();
    let body = ErrorResponse::from(err).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
