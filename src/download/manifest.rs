//! HuggingFace-compatible manifest fetch/parse (C7 step 1).

use serde::{Deserialize, Serialize};

use crate::error::{self, Error};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestFile {
    pub rfilename: String,
}

/// The manifest body: `GET https://huggingface.co/v2/{repo}/manifests/{tag}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(rename = "ggufFile")]
    pub gguf_file: ManifestFile,
    #[serde(rename = "mmprojFile", default)]
    pub mmproj_file: Option<ManifestFile>,
}

const USER_AGENT_PREFIX: &str = "llamactl/";

pub fn manifest_url(repo: &str, tag: &str) -> String {
    format!("https://huggingface.co/v2/{repo}/manifests/{tag}")
}

/// Fetch and parse the manifest for `(repo, tag)`. 404 → `ErrNotFound`;
/// other non-2xx → `ErrUpstream`; unparseable body → `ErrManifestMalformed`.
pub async fn fetch_manifest(client: &reqwest::Client, repo: &str, tag: &str, version: &str) -> Result<Manifest, Error> {
    let url = manifest_url(repo, tag);
    let mut request = client.get(&url).header("User-Agent", format!("{USER_AGENT_PREFIX}{version}"));
    if let Ok(token) = std::env::var("HF_TOKEN") {
        request = request.header("Authorization", format!("Bearer {token}"));
    }

    let response = request
        .send()
        .await
        .map_err(|e| error::upstream(format!("failed to reach manifest endpoint: {e}")))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(error::not_found(format!("no manifest for {repo}:{tag}")));
    }
    if !response.status().is_success() {
        return Err(error::upstream(format!(
            "manifest endpoint returned {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| error::upstream(format!("failed to read manifest body: {e}")))?;

    serde_json::from_str(&body).map_err(|e| error::manifest_malformed(format!("malformed manifest JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_url_shape() {
        assert_eq!(
            manifest_url("org/model", "Q4_K_M"),
            "https://huggingface.co/v2/org/model/manifests/Q4_K_M"
        );
    }

    #[test]
    fn manifest_parses_required_and_optional_fields() {
        let json = r#"{"ggufFile":{"rfilename":"m.gguf"},"mmprojFile":{"rfilename":"mmproj.gguf"}}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.gguf_file.rfilename, "m.gguf");
        assert_eq!(manifest.mmproj_file.unwrap().rfilename, "mmproj.gguf");
    }

    #[test]
    fn manifest_allows_missing_mmproj() {
        let json = r#"{"ggufFile":{"rfilename":"m.gguf"}}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(manifest.mmproj_file.is_none());
    }
}
