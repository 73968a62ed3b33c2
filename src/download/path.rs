//! Path-safety and filename-grammar helpers shared between the download
//! engine and the cache scanner (C7 §4.7 "Path safety", C8 §4.8).

use regex::Regex;
use std::sync::OnceLock;

/// `{base}-{NNNNN}-of-{MMMMM}.gguf`, zero-padded to 5 digits (spec.md §6).
fn split_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)-(\d{5})-of-(\d{5})\.gguf$").unwrap())
}

/// Parsed split-file descriptor: the base name (without the `-NNNNN-of-MMMMM`
/// suffix), the 1-based part number, and the total part count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitFile {
    pub base: String,
    pub part: u32,
    pub total: u32,
}

/// Detect whether `filename` matches the split-file grammar.
pub fn parse_split_filename(filename: &str) -> Option<SplitFile> {
    let caps = split_pattern().captures(filename)?;
    let base = caps.get(1)?.as_str().to_string();
    let part: u32 = caps.get(2)?.as_str().parse().ok()?;
    let total: u32 = caps.get(3)?.as_str().parse().ok()?;
    Some(SplitFile { base, part, total })
}

/// Build the filename for part `n` of `total` of a split file, given the
/// part-1 filename (used to recover `base`).
pub fn split_part_filename(first_part: &SplitFile, part: u32) -> String {
    format!("{}-{:05}-of-{:05}.gguf", first_part.base, part, first_part.total)
}

/// Reduce a manifest-supplied `rfilename` to a safe basename: strip any
/// directory components, reject `..`/`\`, and fall back to `unknown` if
/// nothing safe remains.
pub fn safe_basename(rfilename: &str) -> String {
    let candidate = rfilename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(rfilename)
        .trim_start_matches('.');
    if candidate.is_empty() || candidate == ".." {
        "unknown".to_string()
    } else {
        candidate.to_string()
    }
}

/// Sanitize a `repo` (e.g. `"org/model"`) into safe, joined components: each
/// `/`-separated segment has `..`, `\`, and leading dots stripped; empty
/// segments collapse to `unknown`; segments are joined with `sep` (`_` for
/// filenames, `=` for manifest names).
pub fn sanitize_repo(repo: &str, sep: char) -> String {
    repo.split('/')
        .map(|segment| {
            let cleaned: String = segment
                .replace("..", "")
                .replace('\\', "")
                .trim_start_matches('.')
                .to_string();
            if cleaned.is_empty() {
                "unknown".to_string()
            } else {
                cleaned
            }
        })
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}

/// Final model-file name under the cache directory:
/// `{repo-with-_}_{basename}`.
pub fn cache_filename(repo: &str, rfilename: &str) -> String {
    format!("{}_{}", sanitize_repo(repo, '_'), safe_basename(rfilename))
}

/// Manifest filename: `manifest={repo-with-=}={tag}.json`.
pub fn manifest_filename(repo: &str, tag: &str) -> String {
    format!("manifest={}={}.json", sanitize_repo(repo, '='), sanitize_tag(tag))
}

fn sanitize_tag(tag: &str) -> String {
    let cleaned: String = tag.replace("..", "").replace(['\\', '/'], "").trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Recover `(repo, tag)` from a manifest filename, per spec.md §4.8 step 1:
/// split on `=`, last segment is the tag, prior segments join with `/`.
pub fn parse_manifest_filename(filename: &str) -> Option<(String, String)> {
    let stem = filename.strip_prefix("manifest=")?.strip_suffix(".json")?;
    let mut segments: Vec<&str> = stem.split('=').collect();
    if segments.len() < 2 {
        return None;
    }
    let tag = segments.pop()?.to_string();
    let repo = segments.join("/");
    Some((repo, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_filename_grammar() {
        let parsed = parse_split_filename("m-00001-of-00003.gguf").unwrap();
        assert_eq!(parsed.base, "m");
        assert_eq!(parsed.part, 1);
        assert_eq!(parsed.total, 3);
        assert!(parse_split_filename("m.gguf").is_none());
        assert!(parse_split_filename("m-1-of-3.gguf").is_none());
    }

    #[test]
    fn split_part_filename_builds_expected_names() {
        let first = SplitFile { base: "m".to_string(), part: 1, total: 3 };
        assert_eq!(split_part_filename(&first, 2), "m-00002-of-00003.gguf");
    }

    #[test]
    fn safe_basename_strips_directories_and_traversal() {
        assert_eq!(safe_basename("../../etc/passwd"), "passwd");
        assert_eq!(safe_basename("sub/dir/model.gguf"), "model.gguf");
        assert_eq!(safe_basename(".."), "unknown");
        assert_eq!(safe_basename("..\\..\\model.gguf"), "model.gguf");
    }

    #[test]
    fn sanitize_repo_strips_traversal_and_joins() {
        assert_eq!(sanitize_repo("org/model", '_'), "org_model");
        assert_eq!(sanitize_repo("../org/model", '_'), "org_model");
        assert_eq!(sanitize_repo("org/model", '='), "org=model");
        assert!(!sanitize_repo("../../x", '_').contains(".."));
    }

    #[test]
    fn cache_and_manifest_filenames_never_contain_traversal_or_leading_separator() {
        let cache = cache_filename("../org/model", "../../m.gguf");
        assert!(!cache.contains(".."));
        assert!(!cache.starts_with('/'));
        let manifest = manifest_filename("org/model", "Q4_K_M");
        assert_eq!(manifest, "manifest=org=model=Q4_K_M.json");
    }

    #[test]
    fn parse_manifest_filename_recovers_repo_and_tag() {
        let (repo, tag) = parse_manifest_filename("manifest=org=model=Q4_K_M.json").unwrap();
        assert_eq!(repo, "org/model");
        assert_eq!(tag, "Q4_K_M");
    }
}
