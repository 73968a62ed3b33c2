//! Cache Scanner (C8) — recovers which models are actually materialized on
//! disk by reading manifest sidecars back out of the cache directory, and
//! removes a model's files on request.
//!
//! Grounded in the teacher's `docker.rs` image-listing pass (stat a
//! directory, turn filenames back into structured records) generalized to
//! the manifest-filename grammar in [`crate::download::path`].

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::download::manifest::Manifest;
use crate::download::path;
use crate::error::{self, Error};

#[derive(Debug, Clone, Serialize)]
pub struct CachedModel {
    pub repo: String,
    pub tag: String,
    pub files: Vec<CachedFile>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedFile {
    pub filename: String,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub kind: CachedFileKind,
}

/// Which role a cached file plays in its model, per spec.md §4.8 step 2
/// ("collect (name, path, size, type∈{gguf,mmproj,preset})").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedFileKind {
    Gguf,
    Mmproj,
    Preset,
}

/// Scan `cache_dir` for `manifest=*.json` files, resolve every file each
/// manifest references, and report only models with at least one file
/// actually present on disk.
pub async fn list_cached(cache_dir: &Path) -> Result<Vec<CachedModel>, Error> {
    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(error::disk_io(format!("failed to read cache dir: {e}"))),
    };

    let mut models = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| error::disk_io(format!("failed to read cache dir entry: {e}")))?
    {
        let filename = entry.file_name();
        let filename = filename.to_string_lossy();
        let Some((repo, tag)) = path::parse_manifest_filename(&filename) else {
            continue;
        };

        let manifest_path = cache_dir.join(filename.as_ref());
        let manifest = match read_manifest(&manifest_path).await {
            Ok(m) => m,
            Err(e) => {
                warn!(manifest = %manifest_path.display(), error = %e, "skipping unreadable manifest");
                continue;
            }
        };

        let expected = expected_filenames(&repo, &manifest);
        let mut files = Vec::new();
        let mut total_bytes = 0u64;
        for (candidate, kind) in expected {
            let file_path = cache_dir.join(&candidate);
            if let Ok(metadata) = tokio::fs::metadata(&file_path).await {
                total_bytes += metadata.len();
                files.push(CachedFile { filename: candidate, size_bytes: metadata.len(), kind });
            }
        }

        if files.is_empty() {
            continue;
        }

        models.push(CachedModel { repo, tag, files, total_bytes });
    }

    Ok(models)
}

/// Every filename a manifest references, tagged with the role it plays: the
/// primary gguf (plus its split parts, if any), the optional mmproj file, and
/// the optional preset.ini.
fn expected_filenames(repo: &str, manifest: &Manifest) -> Vec<(String, CachedFileKind)> {
    let mut names = Vec::new();

    let primary_basename = path::safe_basename(&manifest.gguf_file.rfilename);
    names.push((path::cache_filename(repo, &manifest.gguf_file.rfilename), CachedFileKind::Gguf));

    if let Some(split) = path::parse_split_filename(&primary_basename) {
        for part in 2..=split.total {
            let part_name = path::split_part_filename(&split, part);
            names.push((path::cache_filename(repo, &part_name), CachedFileKind::Gguf));
        }
    }

    if let Some(mmproj) = &manifest.mmproj_file {
        names.push((path::cache_filename(repo, &mmproj.rfilename), CachedFileKind::Mmproj));
    }

    names.push((path::cache_filename(repo, "preset.ini"), CachedFileKind::Preset));
    names
}

async fn read_manifest(path: &Path) -> Result<Manifest, Error> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| error::disk_io(format!("failed to read manifest: {e}")))?;
    serde_json::from_str(&body).map_err(|e| error::manifest_malformed(format!("malformed cached manifest: {e}")))
}

/// Delete every file for `repo`, optionally scoped to one `tag`: every
/// matching manifest, every file it references, and any `.etag` sidecars.
pub async fn delete_model(cache_dir: &Path, repo: &str, tag: Option<&str>) -> Result<(), Error> {
    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(error::disk_io(format!("failed to read cache dir: {e}"))),
    };

    let mut manifests_to_remove: Vec<PathBuf> = Vec::new();
    let mut files_to_remove: Vec<PathBuf> = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| error::disk_io(format!("failed to read cache dir entry: {e}")))?
    {
        let filename = entry.file_name();
        let filename = filename.to_string_lossy().to_string();
        let Some((entry_repo, entry_tag)) = path::parse_manifest_filename(&filename) else {
            continue;
        };
        if entry_repo != repo {
            continue;
        }
        if let Some(tag) = tag {
            if entry_tag != tag {
                continue;
            }
        }

        let manifest_path = cache_dir.join(&filename);
        if let Ok(manifest) = read_manifest(&manifest_path).await {
            for (name, _kind) in expected_filenames(&entry_repo, &manifest) {
                let file_path = cache_dir.join(&name);
                files_to_remove.push(file_path.clone());
                files_to_remove.push(PathBuf::from(format!("{}.etag", file_path.display())));
            }
        }
        manifests_to_remove.push(manifest_path);
    }

    if manifests_to_remove.is_empty() {
        return Err(error::not_found(format!(
            "no cached model found for repo '{repo}'{}",
            tag.map(|t| format!(" tag '{t}'")).unwrap_or_default()
        )));
    }

    for file in files_to_remove {
        let _ = tokio::fs::remove_file(&file).await;
    }
    for manifest in manifests_to_remove {
        let _ = tokio::fs::remove_file(&manifest).await;
    }

    Ok(())
}
