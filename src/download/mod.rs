//! Model Download Engine (C7) — job-oriented, parallel, resumable
//! multi-file download into a content-addressed cache with manifest + ETag
//! sidecars.
//!
//! Grounded in the teacher's `docker.rs` `pull_image_if_needed`/
//! `stream_logs` for the "spawn a task, stream, report progress" shape; the
//! manifest/ETag/atomic-rename protocol itself has no teacher analogue (the
//! teacher never downloads models) and is built directly to spec.md §4.7.

pub mod manifest;
pub mod path;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::error::{self, Error};
use manifest::Manifest;

const MAX_PARALLEL_PARTS: usize = 5;
const RETENTION_HOURS: i64 = 24;
const JANITOR_SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub current_file: Option<String>,
}

/// A snapshot of one download job's state, safe to hand to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub repo: String,
    pub tag: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct Job {
    id: String,
    repo: String,
    tag: String,
    state: parking_lot::Mutex<JobState>,
    cancel: watch::Sender<bool>,
    created_at: chrono::DateTime<chrono::Utc>,
    /// Every `.tmp` path registered during the job, for cleanup on
    /// cancellation or failure. Guarded by its own mutex since it's touched
    /// from concurrent split-part tasks.
    tempfiles: std::sync::Mutex<HashSet<PathBuf>>,
}

struct JobState {
    status: JobStatus,
    progress: JobProgress,
    error: Option<String>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Job {
    fn view(&self) -> JobView {
        let state = self.state.lock();
        JobView {
            id: self.id.clone(),
            repo: self.repo.clone(),
            tag: self.tag.clone(),
            status: state.status,
            progress: state.progress.clone(),
            error: state.error.clone(),
            created_at: self.created_at,
            completed_at: state.completed_at,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn register_tempfile(&self, path: PathBuf) {
        self.tempfiles.lock().unwrap().insert(path);
    }

    fn clear_tempfile(&self, path: &PathBuf) {
        self.tempfiles.lock().unwrap().remove(path);
    }

    async fn cleanup_tempfiles(&self) {
        let paths: Vec<PathBuf> = self.tempfiles.lock().unwrap().drain().collect();
        for path in paths {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    fn add_progress(&self, delta: u64, total: Option<u64>, current_file: Option<&str>) {
        let mut state = self.state.lock();
        state.progress.bytes_downloaded += delta;
        if let Some(total) = total {
            state.progress.total_bytes += total;
        }
        if let Some(file) = current_file {
            state.progress.current_file = Some(file.to_string());
        }
    }
}

/// Owns every in-flight and recently-finished download job.
pub struct DownloadEngine {
    jobs: DashMap<String, Arc<Job>>,
    client: reqwest::Client,
    cache_dir: PathBuf,
    version: String,
}

impl DownloadEngine {
    pub fn new(cache_dir: PathBuf, version: impl Into<String>) -> Self {
        Self {
            jobs: DashMap::new(),
            client: reqwest::Client::new(),
            cache_dir,
            version: version.into(),
        }
    }

    /// Spawn the 1h janitor sweep that purges jobs finished >24h ago.
    pub fn spawn_janitor(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(JANITOR_SWEEP_INTERVAL_SECS)).await;
                engine.sweep_expired();
            }
        });
    }

    fn sweep_expired(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(RETENTION_HOURS);
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| {
                let state = e.value().state.lock();
                matches!(state.status, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
                    && state.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();
        for id in expired {
            self.jobs.remove(&id);
        }
    }

    /// `start_download(repo, tag) → job_id`. Validates `repo` contains `/`;
    /// empty `tag` defaults to `latest`.
    pub fn start_download(self: &Arc<Self>, repo: &str, tag: Option<&str>) -> Result<JobView, Error> {
        if !repo.contains('/') {
            return Err(error::manifest_malformed("repo must be of the form 'owner/name'"));
        }
        let tag = match tag {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => "latest".to_string(),
        };

        let id = random_job_id();
        let (cancel_tx, _) = watch::channel(false);
        let job = Arc::new(Job {
            id: id.clone(),
            repo: repo.to_string(),
            tag,
            state: parking_lot::Mutex::new(JobState {
                status: JobStatus::Queued,
                progress: JobProgress::default(),
                error: None,
                completed_at: None,
            }),
            cancel: cancel_tx,
            created_at: chrono::Utc::now(),
            tempfiles: std::sync::Mutex::new(HashSet::new()),
        });

        self.jobs.insert(id.clone(), Arc::clone(&job));

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_job(job).await;
        });

        Ok(self.get_job(&id)?)
    }

    pub fn get_job(&self, id: &str) -> Result<JobView, Error> {
        self.jobs
            .get(id)
            .map(|j| j.view())
            .ok_or_else(|| error::not_found(format!("download job '{id}' does not exist")))
    }

    pub fn list_jobs(&self) -> Vec<JobView> {
        self.jobs.iter().map(|e| e.value().view()).collect()
    }

    /// Fires the job's cancel token; in-flight HTTP reads observe it within
    /// O(100ms) and terminate, then tempfile cleanup runs.
    pub fn cancel_job(&self, id: &str) -> Result<(), Error> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| error::not_found(format!("download job '{id}' does not exist")))?;
        let _ = job.cancel.send(true);
        Ok(())
    }

    pub fn delete_job(&self, id: &str) -> Result<(), Error> {
        self.jobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| error::not_found(format!("download job '{id}' does not exist")))
    }

    async fn run_job(&self, job: Arc<Job>) {
        job.state.lock().status = JobStatus::Downloading;

        let result = self.download(&job).await;

        let mut state = job.state.lock();
        match result {
            Ok(()) => {
                state.status = JobStatus::Completed;
                state.completed_at = Some(chrono::Utc::now());
                info!(job = %job.id, repo = %job.repo, tag = %job.tag, "download job completed");
            }
            Err(e) if e.kind == error::ErrorKind::ErrCancelled => {
                state.status = JobStatus::Cancelled;
                state.completed_at = Some(chrono::Utc::now());
                info!(job = %job.id, "download job cancelled");
            }
            Err(e) => {
                state.error = Some(e.message.clone());
                state.status = JobStatus::Failed;
                state.completed_at = Some(chrono::Utc::now());
                warn!(job = %job.id, error = %e, "download job failed");
            }
        }
        drop(state);

        if !matches!(job.state.lock().status, JobStatus::Completed) {
            job.cleanup_tempfiles().await;
        }
    }

    async fn download(&self, job: &Arc<Job>) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| error::disk_io(format!("failed to create cache dir: {e}")))?;

        let manifest = manifest::fetch_manifest(&self.client, &job.repo, &job.tag, &self.version).await?;
        self.persist_manifest(&job.repo, &job.tag, &manifest).await?;

        if job.is_cancelled() {
            return Err(error::cancelled("download cancelled before start"));
        }

        let primary_name = path::safe_basename(&manifest.gguf_file.rfilename);
        let primary_final = self.cache_dir.join(path::cache_filename(&job.repo, &manifest.gguf_file.rfilename));

        self.download_file(job, &primary_name, &primary_final).await?;

        if let Some(split) = path::parse_split_filename(&primary_name) {
            let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_PARTS));
            let mut tasks = Vec::new();
            for part in 2..=split.total {
                let permit = Arc::clone(&semaphore);
                let part_name = path::split_part_filename(&split, part);
                let part_final = self.cache_dir.join(path::cache_filename(&job.repo, &part_name));
                let job = Arc::clone(job);
                let engine_cache_dir = self.cache_dir.clone();
                let client = self.client.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                    download_one_file(&client, &job, &part_name, &part_final, &engine_cache_dir).await
                }));
            }
            for task in tasks {
                task.await.map_err(|e| error::disk_io(format!("split download task panicked: {e}")))??;
            }
        }

        if let Some(mmproj) = &manifest.mmproj_file {
            let name = path::safe_basename(&mmproj.rfilename);
            let final_path = self.cache_dir.join(path::cache_filename(&job.repo, &mmproj.rfilename));
            self.download_file(job, &name, &final_path).await?;
        }

        // `preset.ini`: non-fatal on failure.
        let preset_url = format!("https://huggingface.co/{}/resolve/{}/preset.ini", job.repo, job.tag);
        let preset_final = self.cache_dir.join(path::cache_filename(&job.repo, "preset.ini"));
        if let Err(e) = fetch_to_file(&self.client, &preset_url, &preset_final, job, None).await {
            warn!(job = %job.id, error = %e, "optional preset.ini download failed, continuing");
        }

        Ok(())
    }

    async fn persist_manifest(&self, repo: &str, tag: &str, manifest: &Manifest) -> Result<(), Error> {
        let final_path = self.cache_dir.join(path::manifest_filename(repo, tag));
        let tmp_path = final_path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(manifest)
            .map_err(|e| error::manifest_malformed(format!("failed to serialize manifest: {e}")))?;
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|e| error::disk_io(format!("failed to write manifest tmp file: {e}")))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| error::disk_io(format!("failed to publish manifest: {e}")))?;
        Ok(())
    }

    async fn download_file(&self, job: &Arc<Job>, rfilename: &str, final_path: &PathBuf) -> Result<(), Error> {
        let url = format!(
            "https://huggingface.co/{}/resolve/{}/{}",
            job.repo, job.tag, rfilename
        );
        fetch_to_file(&self.client, &url, final_path, job, Some(rfilename)).await
    }
}

async fn download_one_file(
    client: &reqwest::Client,
    job: &Arc<Job>,
    rfilename: &str,
    final_path: &PathBuf,
    _cache_dir: &PathBuf,
) -> Result<(), Error> {
    let url = format!("https://huggingface.co/{}/resolve/{}/{}", job.repo, job.tag, rfilename);
    fetch_to_file(client, &url, final_path, job, Some(rfilename)).await
}

/// Stream `url` into `final_path` via a `.tmp` sidecar, publishing
/// byte-delta progress, honoring cancellation, and writing a `.etag`
/// sidecar alongside the final atomic rename.
async fn fetch_to_file(
    client: &reqwest::Client,
    url: &str,
    final_path: &PathBuf,
    job: &Arc<Job>,
    progress_label: Option<&str>,
) -> Result<(), Error> {
    let tmp_path = PathBuf::from(format!("{}.tmp", final_path.display()));
    job.register_tempfile(tmp_path.clone());

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| error::upstream(format!("failed to fetch {url}: {e}")))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        job.clear_tempfile(&tmp_path);
        return Err(error::not_found(format!("upstream file not found: {url}")));
    }
    if !response.status().is_success() {
        job.clear_tempfile(&tmp_path);
        return Err(error::upstream(format!("upstream returned {} for {url}", response.status())));
    }

    let total_bytes = response.content_length().unwrap_or(0);
    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(parent) = tmp_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| error::disk_io(format!("failed to create cache dir: {e}")))?;
    }

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| error::disk_io(format!("failed to create tmp file: {e}")))?;

    job.add_progress(0, Some(total_bytes), progress_label);

    let mut stream = response.bytes_stream();
    use futures::StreamExt;

    let mut cancel_rx = job.cancel.subscribe();
    if job.is_cancelled() {
        drop(file);
        job.clear_tempfile(&tmp_path);
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(error::cancelled("download cancelled"));
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                if job.is_cancelled() {
                    drop(file);
                    job.clear_tempfile(&tmp_path);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(error::cancelled("download cancelled"));
                }
            }
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                let chunk = chunk.map_err(|e| error::upstream(format!("stream read error: {e}")))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| error::disk_io(format!("failed writing tmp file: {e}")))?;
                job.add_progress(chunk.len() as u64, None, None);
            }
        }
    }
    file.flush().await.map_err(|e| error::disk_io(format!("failed flushing tmp file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, final_path)
        .await
        .map_err(|e| error::disk_io(format!("failed to publish {}: {e}", final_path.display())))?;
    job.clear_tempfile(&tmp_path);

    let etag_path = PathBuf::from(format!("{}.etag", final_path.display()));
    tokio::fs::write(&etag_path, etag.unwrap_or_default())
        .await
        .map_err(|e| error::disk_io(format!("failed writing etag sidecar: {e}")))?;

    Ok(())
}

fn random_job_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_job_id_is_16_hex_chars() {
        let id = random_job_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn start_download_rejects_repo_without_slash() {
        let engine = Arc::new(DownloadEngine::new(PathBuf::from("/tmp/llamactl-test-cache"), "0.1.0"));
        let err = engine.start_download("no-slash-repo", None).unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::ErrManifestMalformed);
    }

    #[tokio::test]
    async fn start_download_defaults_empty_tag_to_latest() {
        let engine = Arc::new(DownloadEngine::new(PathBuf::from("/tmp/llamactl-test-cache-2"), "0.1.0"));
        let view = engine.start_download("org/model", Some("")).unwrap();
        assert_eq!(view.tag, "latest");
        assert_eq!(view.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_then_get_job_reports_cancelled_eventually() {
        let engine = Arc::new(DownloadEngine::new(PathBuf::from("/tmp/llamactl-test-cache-3"), "0.1.0"));
        let view = engine.start_download("org/unreachable-model", None).unwrap();
        engine.cancel_job(&view.id).unwrap();
        // The in-flight job will observe cancellation or a network error and
        // settle to a terminal, non-"queued" status; we only assert the
        // cancel call itself is accepted for a real job id.
        assert!(engine.get_job(&view.id).is_ok());
    }

    #[test]
    fn get_job_not_found() {
        let engine = Arc::new(DownloadEngine::new(PathBuf::from("/tmp/llamactl-test-cache-4"), "0.1.0"));
        let err = engine.get_job("deadbeefdeadbeef").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::ErrNotFound);
    }
}
