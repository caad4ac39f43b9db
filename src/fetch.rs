//! Weight retrieval from the Hugging Face Hub.
//!
//! Downloads go through the hub cache and are hard-linked (or copied) into
//! the local `models/` layout. Every file placed for conversion is verified
//! to be a real payload: a Git LFS pointer header fails the fetch instead of
//! handing the converter a 133-byte text file.

use crate::errors::WeightsmithError;
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

/// Marker at the head of a Git LFS pointer file.
pub const LFS_POINTER_MARKER: &[u8] = b"version https://git-lfs.github.com";
/// How much of the head of a file payload verification inspects.
const HEADER_PROBE_LEN: usize = 100;

/// Hub client; `token` falls back to cached credentials when `None`.
pub fn build_api(token: Option<String>) -> Result<Api, WeightsmithError> {
    Ok(ApiBuilder::new().with_token(token).build()?)
}

fn repo_handle(api: &Api, repo_id: &str) -> ApiRepo {
    api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        "main".to_string(),
    ))
}

/// File names (relative paths) in a model repository.
pub fn list_repo_files(api: &Api, repo_id: &str) -> Result<Vec<String>, WeightsmithError> {
    let info = repo_handle(api, repo_id).info()?;
    Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
}

/// Fetch every file of a repository into `dest`, preserving relative paths.
pub fn fetch_snapshot(
    api: &Api,
    repo_id: &str,
    dest: &Path,
) -> Result<Vec<PathBuf>, WeightsmithError> {
    fs::create_dir_all(dest)?;
    let handle = repo_handle(api, repo_id);
    let info = handle.info()?;
    let mut fetched = Vec::with_capacity(info.siblings.len());
    for sibling in info.siblings {
        let cached = handle.get(&sibling.rfilename)?;
        let local = dest.join(&sibling.rfilename);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        place(&cached, &local)?;
        info!("fetched {}", local.display());
        fetched.push(local);
    }
    Ok(fetched)
}

/// Fetch the first repository file matching `prefix`/`suffix` into
/// `dest_dir/<basename>`, then verify it is a real payload.
pub fn fetch_file_matching(
    api: &Api,
    repo_id: &str,
    prefix: Option<&str>,
    suffix: &str,
    dest_dir: &Path,
) -> Result<PathBuf, WeightsmithError> {
    let files = list_repo_files(api, repo_id)?;
    let wanted = files
        .iter()
        .find(|f| prefix.map_or(true, |p| f.starts_with(p)) && f.ends_with(suffix))
        .ok_or_else(|| WeightsmithError::NoMatchingFile {
            repo: repo_id.to_string(),
            pattern: format!("{}*{}", prefix.unwrap_or(""), suffix),
        })?;

    let cached = repo_handle(api, repo_id).get(wanted)?;
    fs::create_dir_all(dest_dir)?;
    let base = Path::new(wanted)
        .file_name()
        .ok_or_else(|| WeightsmithError::InvalidFormat(format!("bad repo path {}", wanted)))?;
    let target = dest_dir.join(base);
    place(&cached, &target)?;
    let size = verify_payload(&target)?;
    info!(
        "fetched {} ({:.1} MB), payload verified",
        target.display(),
        size as f64 / 1e6
    );
    Ok(target)
}

/// Hard-link out of the hub cache; fall back to a copy across filesystems.
fn place(cached: &Path, local: &Path) -> Result<(), WeightsmithError> {
    if local.exists() {
        fs::remove_file(local)?;
    }
    if fs::hard_link(cached, local).is_err() {
        fs::copy(cached, local)?;
    }
    Ok(())
}

/// Check that a file is actual content and not a Git LFS pointer marker.
/// Returns the payload size in bytes.
pub fn verify_payload(path: &Path) -> Result<u64, WeightsmithError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_PROBE_LEN];
    let mut read = 0;
    while read < header.len() {
        match file.read(&mut header[read..])? {
            0 => break,
            n => read += n,
        }
    }
    let seen = &header[..read];
    if seen.len() >= LFS_POINTER_MARKER.len()
        && seen
            .windows(LFS_POINTER_MARKER.len())
            .any(|w| w == LFS_POINTER_MARKER)
    {
        return Err(WeightsmithError::LfsPointer(path.to_path_buf()));
    }
    Ok(fs::metadata(path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn real_payload_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        fs::write(&path, [0x50u8, 0x4b, 0x03, 0x04, 0xde, 0xad]).unwrap();
        assert_eq!(verify_payload(&path).unwrap(), 6);
    }

    #[test]
    fn lfs_pointer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "version https://git-lfs.github.com/spec/v1").unwrap();
        writeln!(file, "oid sha256:abc123").unwrap();
        drop(file);
        assert!(matches!(
            verify_payload(&path).unwrap_err(),
            WeightsmithError::LfsPointer(_)
        ));
    }

    #[test]
    fn short_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");
        fs::write(&path, b"ok").unwrap();
        assert_eq!(verify_payload(&path).unwrap(), 2);
    }
}
