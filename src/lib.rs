//! llamactl-core - a lifecycle manager for local inference-server processes
//!
//! This library provides a control plane that:
//! - Allocates ports and spawns llama.cpp/MLX/vLLM backends, native or Docker
//! - Tracks each instance through a start/ready/stop state machine with
//!   readiness probing, auto-restart, and idle-timeout eviction
//! - Activates instances on demand on first inbound request, evicting the
//!   least-recently-used running instance under a running-instance cap
//! - Reverse-proxies both a per-instance path and an OpenAI-compatible
//!   front door that resolves `model` to an instance
//! - Downloads and caches model files, scanning and pruning the cache

pub mod activator;
pub mod api;
pub mod cache;
pub mod config;
pub mod docker;
pub mod download;
pub mod error;
pub mod instance;
pub mod pool;
pub mod port;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod store;
