//! Configuration Surface (C9) — the immutable snapshot the core consumes.
//!
//! Parsing the CLI/env-var layering that produces this TOML is named an
//! external collaborator; this module only owns the typed, validated,
//! immutable result of that process.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration snapshot.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub defaults: InstanceDefaults,

    #[serde(default)]
    pub cache_dir: PathConfig,

    #[serde(default)]
    pub log_rotation: LogRotationConfig,

    /// Per-backend-kind command templates and Docker settings.
    #[serde(default = "default_backends")]
    pub backends: HashMap<String, BackendKindConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            defaults: InstanceDefaults::default(),
            cache_dir: PathConfig::default(),
            log_rotation: LogRotationConfig::default(),
            backends: default_backends(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Inclusive low end of the port range instances are allocated from.
    #[serde(default = "default_port_low")]
    pub port_range_low: u16,

    /// Inclusive high end of the port range.
    #[serde(default = "default_port_high")]
    pub port_range_high: u16,

    /// Total instance cap, -1 = unlimited.
    #[serde(default = "default_max_instances")]
    pub max_instances: i64,

    /// Cap on instances simultaneously in starting/ready/restarting, -1 = unlimited.
    #[serde(default = "default_max_running_instances")]
    pub max_running_instances: i64,

    /// Whether LRU eviction may free a running slot for an on-demand start.
    #[serde(default = "default_true")]
    pub enable_lru_eviction: bool,

    /// Deadline for an on-demand activation wait, in seconds.
    #[serde(default = "default_on_demand_start_timeout")]
    pub on_demand_start_timeout_secs: u64,

    /// Interval between idle-timeout sweeps, in minutes.
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_minutes: u64,

    /// Maximum buffered OpenAI request body size before a 413, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Management key required on `/api/v1/*` when set.
    pub management_key: Option<String>,

    /// Inference key accepted on `/v1/*` in addition to the management key.
    pub inference_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_range_low: default_port_low(),
            port_range_high: default_port_high(),
            max_instances: default_max_instances(),
            max_running_instances: default_max_running_instances(),
            enable_lru_eviction: default_true(),
            on_demand_start_timeout_secs: default_on_demand_start_timeout(),
            idle_check_interval_minutes: default_idle_check_interval(),
            max_body_bytes: default_max_body_bytes(),
            management_key: None,
            inference_key: None,
        }
    }
}

/// Defaults applied to an instance's options unless overridden per-instance.
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceDefaults {
    #[serde(default)]
    pub auto_restart: bool,

    #[serde(default)]
    pub max_restarts: u32,

    #[serde(default = "default_restart_delay")]
    pub restart_delay_seconds: u64,

    #[serde(default)]
    pub on_demand_start: bool,

    #[serde(default)]
    pub idle_timeout_minutes: u64,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            auto_restart: false,
            max_restarts: 0,
            restart_delay_seconds: default_restart_delay(),
            on_demand_start: false,
            idle_timeout_minutes: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogRotationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default)]
    pub compress: bool,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: default_max_size_mb(),
            compress: false,
        }
    }
}

/// The three backend kinds the control plane knows how to launch.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LlamaCpp,
    MlxLm,
    Vllm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LlamaCpp => "llama_cpp",
            BackendKind::MlxLm => "mlx_lm",
            BackendKind::Vllm => "vllm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llama_cpp" => Some(BackendKind::LlamaCpp),
            "mlx_lm" => Some(BackendKind::MlxLm),
            "vllm" => Some(BackendKind::Vllm),
            _ => None,
        }
    }

    /// Readiness probe path for this backend kind, or `None` meaning
    /// "consider ready once the TCP port accepts" (open question #1 in
    /// DESIGN.md: mlx_lm's OpenAI-compatible server has no documented
    /// health endpoint, so it falls back to the TCP probe).
    pub fn default_readiness_path(&self) -> Option<&'static str> {
        match self {
            BackendKind::LlamaCpp => Some("/health"),
            BackendKind::Vllm => Some("/health"),
            BackendKind::MlxLm => None,
        }
    }
}

/// Image pull policy for docker-backed instances.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    #[default]
    IfNotPresent,
    Always,
    Never,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerSettings {
    #[serde(default)]
    pub enabled: bool,
    pub image: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

/// Per-backend-kind command template.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendKindConfig {
    /// Program to invoke when `command_override` is not set.
    pub command: String,

    /// Fixed args always prepended (e.g. `serve` for vllm).
    #[serde(default)]
    pub fixed_args: Vec<String>,

    /// Environment variables always injected.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub docker: DockerSettings,

    /// Response headers the proxy adds for this backend's responses.
    #[serde(default)]
    pub response_headers: HashMap<String, String>,

    /// Override of `BackendKind::default_readiness_path`.
    pub readiness_path: Option<String>,
}

fn default_backends() -> HashMap<String, BackendKindConfig> {
    let mut m = HashMap::new();
    m.insert(
        "llama_cpp".to_string(),
        BackendKindConfig {
            command: "llama-server".to_string(),
            fixed_args: Vec::new(),
            env: HashMap::new(),
            docker: DockerSettings::default(),
            response_headers: HashMap::new(),
            readiness_path: None,
        },
    );
    m.insert(
        "mlx_lm".to_string(),
        BackendKindConfig {
            command: "mlx_lm.server".to_string(),
            fixed_args: Vec::new(),
            env: HashMap::new(),
            docker: DockerSettings::default(),
            response_headers: HashMap::new(),
            readiness_path: None,
        },
    );
    m.insert(
        "vllm".to_string(),
        BackendKindConfig {
            command: "vllm".to_string(),
            fixed_args: vec!["serve".to_string()],
            env: HashMap::new(),
            docker: DockerSettings::default(),
            response_headers: HashMap::new(),
            readiness_path: None,
        },
    );
    m
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {}", path, e))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config file {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the port range alone, so the CLI wrapper can tell a
    /// port-range failure (exit code 3) apart from any other config
    /// failure (exit code 2) per spec.md §6.
    pub fn validate_port_range(&self) -> anyhow::Result<()> {
        if self.server.port_range_low == 0
            || self.server.port_range_high == 0
            || self.server.port_range_low > self.server.port_range_high
        {
            anyhow::bail!(
                "invalid port range: {}-{}",
                self.server.port_range_low,
                self.server.port_range_high
            );
        }
        Ok(())
    }

    /// Validate cross-field invariants. Returns a human-readable error;
    /// the CLI wrapper maps a validation failure to exit code 2 (or 3 for
    /// a port-range-specific failure, per spec.md §6) by calling
    /// `validate_port_range` first.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_port_range()?;
        if self.server.max_instances < -1 {
            anyhow::bail!("max_instances must be >= -1");
        }
        if self.server.max_running_instances < -1 {
            anyhow::bail!("max_running_instances must be >= -1");
        }
        for kind in ["llama_cpp", "mlx_lm", "vllm"] {
            if !self.backends.contains_key(kind) {
                anyhow::bail!("missing backend configuration for '{}'", kind);
            }
        }
        Ok(())
    }

    pub fn backend_config(&self, kind: BackendKind) -> &BackendKindConfig {
        self.backends
            .get(kind.as_str())
            .expect("validate() ensures every backend kind has a config")
    }
}

/// Parse a port-range string like `"8000-9000"` or `"8000,9000"`.
pub fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let sep = if s.contains('-') {
        '-'
    } else if s.contains(',') {
        ','
    } else {
        return None;
    };
    let mut parts = s.splitn(2, sep);
    let low: u16 = parts.next()?.trim().parse().ok()?;
    let high: u16 = parts.next()?.trim().parse().ok()?;
    if low == 0 || high == 0 || low > high {
        return None;
    }
    Some((low, high))
}

fn default_port_low() -> u16 {
    8000
}
fn default_port_high() -> u16 {
    9000
}
fn default_max_instances() -> i64 {
    -1
}
fn default_max_running_instances() -> i64 {
    -1
}
fn default_true() -> bool {
    true
}
fn default_on_demand_start_timeout() -> u64 {
    120
}
fn default_idle_check_interval() -> u64 {
    5
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_restart_delay() -> u64 {
    5
}
fn default_cache_dir() -> String {
    "./data/models".to_string()
}
fn default_log_dir() -> String {
    "./data/logs".to_string()
}
fn default_max_size_mb() -> u64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = Config::default();
        config.server.port_range_low = 9000;
        config.server.port_range_high = 8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_port_range_bound() {
        let mut config = Config::default();
        config.server.port_range_low = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_kind_roundtrip() {
        assert_eq!(BackendKind::parse("llama_cpp"), Some(BackendKind::LlamaCpp));
        assert_eq!(BackendKind::parse("vllm"), Some(BackendKind::Vllm));
        assert_eq!(BackendKind::parse("nope"), None);
        assert_eq!(BackendKind::LlamaCpp.as_str(), "llama_cpp");
    }

    #[test]
    fn readiness_path_defaults() {
        assert_eq!(BackendKind::LlamaCpp.default_readiness_path(), Some("/health"));
        assert_eq!(BackendKind::Vllm.default_readiness_path(), Some("/health"));
        assert_eq!(BackendKind::MlxLm.default_readiness_path(), None);
    }

    #[test]
    fn port_range_parser() {
        assert_eq!(parse_port_range("8000-9000"), Some((8000, 9000)));
        assert_eq!(parse_port_range("8000,9000"), Some((8000, 9000)));
        assert_eq!(parse_port_range("x-y"), None);
        assert_eq!(parse_port_range("8000"), None);
        assert_eq!(parse_port_range(""), None);
        assert_eq!(parse_port_range("9000-8000"), None);
    }

    #[test]
    fn default_backends_cover_all_three_kinds() {
        let backends = default_backends();
        assert!(backends.contains_key("llama_cpp"));
        assert!(backends.contains_key("mlx_lm"));
        assert!(backends.contains_key("vllm"));
        assert_eq!(backends["vllm"].fixed_args, vec!["serve".to_string()]);
    }
}
