//! Process Runner (C2) — launches a backend child process (native or
//! containerized), assembles its command line deterministically, tees its
//! output into a rotating log, and exposes a handle for waiting/signalling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::BackendKindConfig;
use crate::docker::SharedDockerManager;
use crate::error::{self, Error};
use crate::instance::{InstanceOptions, OptionValue};

/// Why a child process stopped running.
#[derive(Debug, Clone)]
pub enum ExitReason {
    /// The process exited on its own (unexpectedly, while it should have
    /// been ready) with the given status description.
    Exited(String),
    /// `signal_stop()` was called and the process honored it.
    Stopped,
}

/// Handle to a launched backend, local or containerized.
pub enum ChildHandle {
    Local(Child),
    Docker {
        container_id: String,
        docker: SharedDockerManager,
        log_shutdown: Option<tokio::sync::watch::Sender<bool>>,
    },
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ChildHandle::Local(child) => child.id(),
            ChildHandle::Docker { .. } => None,
        }
    }

    /// Block until the process exits, returning an `ExitReason`.
    pub async fn wait(&mut self) -> ExitReason {
        match self {
            ChildHandle::Local(child) => match child.wait().await {
                Ok(status) => ExitReason::Exited(status.to_string()),
                Err(e) => ExitReason::Exited(format!("wait failed: {e}")),
            },
            ChildHandle::Docker { container_id, docker, .. } => {
                match docker.wait_container(container_id).await {
                    Ok(code) => ExitReason::Exited(format!("container exited with code {code}")),
                    Err(e) => ExitReason::Exited(format!("wait failed: {e}")),
                }
            }
        }
    }

    /// Graceful-then-hard stop: SIGTERM (or `docker stop`), wait up to
    /// `grace_period`, then SIGKILL (or `docker kill`).
    pub async fn signal_stop(&mut self, grace_period: Duration) {
        match self {
            ChildHandle::Local(child) => stop_local_process(child, grace_period).await,
            ChildHandle::Docker { container_id, docker, log_shutdown } => {
                if let Some(shutdown) = log_shutdown.take() {
                    let _ = shutdown.send(true);
                }
                if let Err(e) = docker.stop_container(container_id, grace_period).await {
                    warn!(container_id, error = %e, "error stopping container, killing");
                    let _ = docker.kill_container(container_id).await;
                }
            }
        }
    }
}

async fn stop_local_process(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(pid, "sending SIGTERM to instance process");
        #[cfg(unix)]
        unsafe {
            // Negative pid targets the whole process group (see spawn_local,
            // which places the child in its own group) so descendants are
            // reaped too.
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "instance process exited gracefully"),
        Ok(Err(e)) => warn!(error = %e, "error waiting for instance process to exit"),
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Assemble `(program, args, env)` for launching a backend, per spec.md
/// §4.2: command_override (or config default) + fixed args + flattened
/// option bag (+ verbatim extra_args) + injected --host/--port.
pub fn assemble_command_line(
    options: &InstanceOptions,
    backend_config: &BackendKindConfig,
    port: u16,
) -> (String, Vec<String>, HashMap<String, String>) {
    let program = options
        .command_override
        .clone()
        .unwrap_or_else(|| backend_config.command.clone());

    let mut args = backend_config.fixed_args.clone();
    let mut saw_host = false;
    let mut saw_port = false;

    for (key, value) in &options.backend_options {
        if key == "extra_args" || key == "environment" {
            continue;
        }
        if key == "host" {
            saw_host = true;
        }
        if key == "port" {
            saw_port = true;
        }
        flatten_option(key, value, &mut args);
    }

    if let Some(OptionValue::StringList(extra)) = options.backend_options.get("extra_args") {
        args.extend(extra.iter().cloned());
    }

    if !saw_host {
        args.push("--host".to_string());
        args.push("127.0.0.1".to_string());
    }
    if !saw_port {
        args.push("--port".to_string());
        args.push(port.to_string());
    }

    let mut env = backend_config.env.clone();
    if let Some(OptionValue::Map(extra_env)) = options.backend_options.get("environment") {
        for (k, v) in extra_env {
            env.insert(k.clone(), v.clone());
        }
    }

    (program, args, env)
}

fn flatten_option(key: &str, value: &OptionValue, args: &mut Vec<String>) {
    match value {
        OptionValue::Bool(true) => args.push(format!("--{key}")),
        OptionValue::Bool(false) => {}
        OptionValue::String(s) => {
            args.push(format!("--{key}"));
            args.push(s.clone());
        }
        OptionValue::Number(n) => {
            args.push(format!("--{key}"));
            args.push(n.to_string());
        }
        OptionValue::StringList(items) => {
            for item in items {
                args.push(format!("--{key}"));
                args.push(item.clone());
            }
        }
        OptionValue::Map(_) => {
            // Only `environment` is a legal map-valued key, handled separately.
        }
    }
}

/// Launch a backend directly as a native child process, in its own process
/// group (unix) so a hard stop can reap descendants.
pub fn spawn_local(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    working_dir: Option<&Path>,
) -> Result<Child, Error> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.envs(env);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    cmd.spawn()
        .map_err(|e| error::spawn(format!("failed to spawn '{program}': {e}")))
}

/// A per-instance rotating log sink. Stdout/stderr lines are appended to
/// the active segment; when it exceeds `max_size_bytes` it is rotated —
/// renamed to `{path}.1` (optionally gzip-compressed to `{path}.1.gz`) —
/// and a fresh segment is opened. Single-writer: callers serialize writes
/// through `&mut self`, matching the "log writes are ordered per instance"
/// guarantee in the concurrency model.
pub struct RotatingWriter {
    path: PathBuf,
    file: File,
    written_bytes: u64,
    max_size_bytes: u64,
    compress: bool,
}

impl RotatingWriter {
    pub async fn open(path: PathBuf, max_size_bytes: u64, compress: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let written_bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written_bytes,
            max_size_bytes,
            compress,
        })
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.max_size_bytes > 0 && self.written_bytes >= self.max_size_bytes {
            self.rotate().await?;
        }
        let bytes = format!("{line}\n");
        self.file.write_all(bytes.as_bytes()).await?;
        self.written_bytes += bytes.len() as u64;
        Ok(())
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let rotated_path = self.path.with_extension("log.1");
        self.file.flush().await?;
        tokio::fs::rename(&self.path, &rotated_path).await?;

        if self.compress {
            let compress_path = rotated_path.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let data = std::fs::read(&compress_path)?;
                let gz_path = compress_path.with_extension("1.gz");
                let gz_file = std::fs::File::create(&gz_path)?;
                let mut encoder = GzEncoder::new(gz_file, Compression::default());
                encoder.write_all(&data)?;
                encoder.finish()?;
                std::fs::remove_file(&compress_path)?;
                Ok(())
            })
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        }

        self.file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        self.written_bytes = 0;
        Ok(())
    }
}

/// Spawn a task that drains a child's stdout/stderr into a `RotatingWriter`.
/// Mirrors the teacher's `DockerManager::stream_logs` spawned-task shape,
/// applied to a file sink instead of `tracing`.
pub fn spawn_log_drain<R>(instance_name: String, mut reader: BufReader<R>, mut writer: RotatingWriter)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if let Err(e) = writer.write_line(trimmed).await {
                        error!(instance = %instance_name, error = %e, "failed to write instance log line");
                    }
                }
                Err(e) => {
                    debug!(instance = %instance_name, error = %e, "log stream closed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn backend_config(command: &str, fixed_args: Vec<&str>) -> BackendKindConfig {
        BackendKindConfig {
            command: command.to_string(),
            fixed_args: fixed_args.into_iter().map(String::from).collect(),
            env: Map::new(),
            docker: Default::default(),
            response_headers: Map::new(),
            readiness_path: None,
        }
    }

    #[test]
    fn assembles_bool_string_and_list_options() {
        let mut options = InstanceOptions::default();
        options.backend_options.insert("verbose".to_string(), OptionValue::Bool(true));
        options.backend_options.insert("quiet".to_string(), OptionValue::Bool(false));
        options.backend_options.insert(
            "model".to_string(),
            OptionValue::String("/models/m.gguf".to_string()),
        );
        options.backend_options.insert(
            "extra_args".to_string(),
            OptionValue::StringList(vec!["--foo".to_string(), "bar".to_string()]),
        );

        let config = backend_config("llama-server", vec![]);
        let (program, args, _env) = assemble_command_line(&options, &config, 8001);

        assert_eq!(program, "llama-server");
        assert!(args.contains(&"--verbose".to_string()));
        assert!(!args.iter().any(|a| a == "--quiet"));
        assert!(args.windows(2).any(|w| w == ["--model", "/models/m.gguf"]));
        assert!(args.windows(2).any(|w| w == ["--host", "127.0.0.1"]));
        assert!(args.windows(2).any(|w| w == ["--port", "8001"]));
        assert_eq!(args.last().unwrap(), "bar");
    }

    #[test]
    fn command_override_wins_over_config_default() {
        let mut options = InstanceOptions::default();
        options.command_override = Some("/custom/llama-server".to_string());
        let config = backend_config("llama-server", vec![]);
        let (program, _, _) = assemble_command_line(&options, &config, 8000);
        assert_eq!(program, "/custom/llama-server");
    }

    #[test]
    fn fixed_args_come_before_option_bag_args() {
        let options = InstanceOptions::default();
        let config = backend_config("vllm", vec!["serve"]);
        let (_, args, _) = assemble_command_line(&options, &config, 8000);
        assert_eq!(args[0], "serve");
    }

    #[test]
    fn environment_map_merges_over_config_env() {
        let mut options = InstanceOptions::default();
        let mut env_override = Map::new();
        env_override.insert("CUDA_VISIBLE_DEVICES".to_string(), "0".to_string());
        options
            .backend_options
            .insert("environment".to_string(), OptionValue::Map(env_override));

        let mut config = backend_config("llama-server", vec![]);
        config.env.insert("LOG_LEVEL".to_string(), "info".to_string());

        let (_, _, env) = assemble_command_line(&options, &config, 8000);
        assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("info"));
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("0"));
    }
}
