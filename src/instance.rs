//! Instance State Machine (C3) — data model, option-bag validation, and
//! the readiness probe. The transitions themselves (start/stop/restart,
//! restart policy, idle timer) are driven by the registry (`registry.rs`),
//! which owns the collaborators (port allocator, process runner, docker
//! manager) a transition needs — mirroring the teacher's `ProcessManager`,
//! which fuses the same two concerns into one struct.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::BackendKind;
use crate::error::{self, Error};
use crate::process::ChildHandle;

/// Per-instance status, per spec.md §3/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Ready,
    Error,
    Restarting,
    Failed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Error => "error",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl InstanceStatus {
    /// `starting`, `ready`, `restarting` count against the running cap.
    pub fn counts_as_running(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Ready | InstanceStatus::Restarting
        )
    }
}

/// A dynamically-typed option-bag value: the tagged-variant capture of the
/// source's dynamic typing (design notes §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Number(f64),
    String(String),
    StringList(Vec<String>),
    Map(HashMap<String, String>),
}

/// Everything that describes how to launch and manage one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOptions {
    pub backend: BackendKind,

    #[serde(default)]
    pub backend_options: HashMap<String, OptionValue>,

    /// 0 = auto-assign from the port pool.
    #[serde(default)]
    pub port: u16,

    /// Empty = local. At most one node name (spec.md's "0..1 node name").
    #[serde(default)]
    pub node: Option<String>,

    #[serde(default)]
    pub docker_enabled: bool,

    /// Mutually exclusive with `docker_enabled = true`.
    #[serde(default)]
    pub command_override: Option<String>,

    #[serde(default)]
    pub auto_restart: bool,

    /// 0 = unlimited.
    #[serde(default)]
    pub max_restarts: u32,

    #[serde(default)]
    pub restart_delay_seconds: u64,

    #[serde(default)]
    pub on_demand_start: bool,

    /// 0 disables idle eviction.
    #[serde(default)]
    pub idle_timeout_minutes: u64,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::LlamaCpp,
            backend_options: HashMap::new(),
            port: 0,
            node: None,
            docker_enabled: false,
            command_override: None,
            auto_restart: false,
            max_restarts: 0,
            restart_delay_seconds: 5,
            on_demand_start: false,
            idle_timeout_minutes: 0,
        }
    }
}

impl InstanceOptions {
    /// Cross-field + option-bag validation. Mirrors spec.md §3 invariants
    /// and §7's shell-metacharacter / control-character screen.
    pub fn validate(&self) -> Result<(), Error> {
        if self.docker_enabled {
            if self.command_override.is_some() {
                return Err(error::invalid_options(
                    "docker_enabled=true is mutually exclusive with command_override",
                ));
            }
            if self.backend == BackendKind::MlxLm {
                return Err(error::invalid_options(
                    "docker_enabled is not valid for the mlx_lm backend",
                ));
            }
        }
        validate_option_bag(&self.backend_options)?;
        Ok(())
    }
}

/// Name validation: ASCII `[A-Za-z0-9_-]`, <=50 chars, non-empty.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(error::invalid_name("instance name must not be empty"));
    }
    if name.chars().count() > 50 {
        return Err(error::invalid_name("instance name must be at most 50 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(error::invalid_name(
            "instance name must match [A-Za-z0-9_-]+",
        ));
    }
    Ok(())
}

const FORBIDDEN_CHARS: &[char] = &[';', '&', '|', '$', '`'];

fn contains_forbidden(s: &str) -> bool {
    s.chars()
        .any(|c| FORBIDDEN_CHARS.contains(&c) || (c as u32) <= 0x1F || (c as u32) == 0x7F)
}

/// Recursively reject option values (scalar strings, string-list elements,
/// and nested map values) containing shell metacharacters or control
/// characters, per spec.md §7.
fn validate_option_bag(bag: &HashMap<String, OptionValue>) -> Result<(), Error> {
    for (key, value) in bag {
        validate_option_value(key, value)?;
    }
    Ok(())
}

fn validate_option_value(key: &str, value: &OptionValue) -> Result<(), Error> {
    match value {
        OptionValue::String(s) => {
            if contains_forbidden(s) {
                return Err(error::invalid_options(format!(
                    "option '{key}' contains a forbidden character"
                )));
            }
        }
        OptionValue::StringList(items) => {
            for item in items {
                if contains_forbidden(item) {
                    return Err(error::invalid_options(format!(
                        "option '{key}' contains a list element with a forbidden character"
                    )));
                }
            }
        }
        OptionValue::Map(map) => {
            for (k, v) in map {
                if contains_forbidden(k) || contains_forbidden(v) {
                    return Err(error::invalid_options(format!(
                        "option '{key}' contains a map entry with a forbidden character"
                    )));
                }
            }
        }
        OptionValue::Bool(_) | OptionValue::Number(_) => {}
    }
    Ok(())
}

/// Broadcast to waiters of an in-flight `start()`, grounded in the
/// teacher's `ready_tx: broadcast::Sender<()>` single-flight pattern,
/// generalized to carry the outcome instead of a bare unit.
#[derive(Debug, Clone)]
pub enum ReadyEvent {
    Ready,
    Failed(String),
}

/// A trivial cooperative cancellation flag for the one cancellable sleep
/// the state machine needs (a pending auto-restart backoff).
#[derive(Clone)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// The live, mutable record for one instance. Holds the child process
/// handle by owned value (design notes §9: "single-owner instance record
/// holding child supervisors by owned handle").
pub struct Instance {
    pub name: String,
    pub options: parking_lot::RwLock<InstanceOptions>,
    pub status: parking_lot::Mutex<InstanceStatus>,
    pub port: parking_lot::Mutex<Option<u16>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_request: parking_lot::Mutex<Instant>,
    pub restart_count: std::sync::atomic::AtomicU32,
    pub child: tokio::sync::Mutex<Option<ChildHandle>>,
    ready_tx: broadcast::Sender<ReadyEvent>,
    /// Serializes start/stop/restart transitions for this instance.
    pub transition_lock: tokio::sync::Mutex<()>,
    /// Cancels a pending auto-restart sleep when `stop()`/`delete()` runs.
    pub restart_cancel: parking_lot::Mutex<Option<CancelFlag>>,
}

impl Instance {
    pub fn new(name: String, options: InstanceOptions) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            name,
            options: parking_lot::RwLock::new(options),
            status: parking_lot::Mutex::new(InstanceStatus::Stopped),
            port: parking_lot::Mutex::new(None),
            created_at: chrono::Utc::now(),
            last_request: parking_lot::Mutex::new(Instant::now()),
            restart_count: std::sync::atomic::AtomicU32::new(0),
            child: tokio::sync::Mutex::new(None),
            ready_tx,
            transition_lock: tokio::sync::Mutex::new(()),
            restart_cancel: parking_lot::Mutex::new(None),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.lock() = status;
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock()
    }

    pub fn touch(&self) {
        *self.last_request.lock() = Instant::now();
    }

    pub fn idle_since(&self) -> Instant {
        *self.last_request.lock()
    }

    pub fn subscribe_ready(&self) -> broadcast::Receiver<ReadyEvent> {
        self.ready_tx.subscribe()
    }

    pub fn notify_ready(&self) {
        let _ = self.ready_tx.send(ReadyEvent::Ready);
    }

    pub fn notify_failed(&self, message: impl Into<String>) {
        let _ = self.ready_tx.send(ReadyEvent::Failed(message.into()));
    }

    pub fn options_snapshot(&self) -> InstanceOptions {
        self.options.read().clone()
    }

    /// Cancel any pending auto-restart backoff sleep, guaranteeing that
    /// after `stop()` returns no further automatic start occurs.
    pub fn cancel_pending_restart(&self) {
        if let Some(flag) = self.restart_cancel.lock().take() {
            flag.cancel();
        }
    }
}

/// HTTP GET against `http://127.0.0.1:{port}{path}`, expecting 2xx. Grounded
/// in the teacher's raw TCP+HTTP/1.1 `check_health` (no external HTTP
/// client needed for a local-loopback probe).
pub async fn probe_http(port: u16, path: &str) -> bool {
    let addr = format!("127.0.0.1:{port}");
    let stream = match tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(&addr)).await
    {
        Ok(Ok(s)) => s,
        _ => return false,
    };

    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    let mut stream = stream;
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read = tokio::time::timeout(Duration::from_secs(2), async {
        let mut reader = BufReader::new(&mut stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read {
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Bare TCP-accept readiness check, for backends with no health endpoint
/// (the mlx_lm open question in DESIGN.md).
pub async fn probe_tcp(port: u16) -> bool {
    let addr = format!("127.0.0.1:{port}");
    matches!(
        tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

/// Dispatch to the appropriate probe for a backend kind, honoring a
/// config-level override of the default readiness path.
pub async fn probe_ready(port: u16, backend: BackendKind, readiness_path_override: Option<&str>) -> bool {
    let path = readiness_path_override
        .map(str::to_string)
        .or_else(|| backend.default_readiness_path().map(str::to_string));
    match path {
        Some(path) => {
            let ok = probe_http(port, &path).await;
            if !ok {
                debug!(port, %path, "readiness probe not yet healthy");
            }
            ok
        }
        None => probe_tcp(port).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_boundaries() {
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(50)).is_ok());
        assert!(validate_name(&"a".repeat(51)).is_err());
        assert!(validate_name("a;b").is_err());
        assert!(validate_name("llama-a_1").is_ok());
    }

    #[test]
    fn docker_enabled_rejects_command_override() {
        let mut options = InstanceOptions {
            docker_enabled: true,
            command_override: Some("/bin/true".to_string()),
            ..Default::default()
        };
        assert!(options.validate().is_err());
        options.command_override = None;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn docker_enabled_rejects_mlx_lm() {
        let options = InstanceOptions {
            backend: BackendKind::MlxLm,
            docker_enabled: true,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn option_bag_rejects_shell_metacharacters() {
        let mut bag = HashMap::new();
        bag.insert(
            "model".to_string(),
            OptionValue::String("/m.gguf; rm -rf /".to_string()),
        );
        let options = InstanceOptions {
            backend_options: bag,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn option_bag_rejects_control_characters_in_nested_map() {
        let mut nested = HashMap::new();
        nested.insert("KEY".to_string(), "value\u{0007}".to_string());
        let mut bag = HashMap::new();
        bag.insert("environment".to_string(), OptionValue::Map(nested));
        let options = InstanceOptions {
            backend_options: bag,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn option_bag_accepts_clean_values() {
        let mut bag = HashMap::new();
        bag.insert(
            "model".to_string(),
            OptionValue::String("/models/m.gguf".to_string()),
        );
        bag.insert(
            "extra_args".to_string(),
            OptionValue::StringList(vec!["--ctx-size".to_string(), "4096".to_string()]),
        );
        let options = InstanceOptions {
            backend_options: bag,
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn status_running_classification() {
        assert!(InstanceStatus::Starting.counts_as_running());
        assert!(InstanceStatus::Ready.counts_as_running());
        assert!(InstanceStatus::Restarting.counts_as_running());
        assert!(!InstanceStatus::Stopped.counts_as_running());
        assert!(!InstanceStatus::Error.counts_as_running());
        assert!(!InstanceStatus::Failed.counts_as_running());
    }

    #[test]
    fn cancel_flag_round_trip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }
}
