//! Local mirror of remote items shared by concurrent processes.
//!
//! Every remote item maps to one directory under the cache root. Next to it
//! live two siblings: `<entry>.sha256.json`, the manifest of checksums the
//! remote reported for the cached copy, and `<entry>.download`, which exists
//! only while some process is downloading the item. Creating the download
//! directory is the claim on the download; the claimant fetches into its own
//! staging directory inside it and promotes only that. Every other process
//! waits for the entry to be promoted, and takes over if the download stops
//! making progress. A claimant whose staging directory disappeared was taken
//! over and waits like everyone else.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::error::KiraError;
use crate::fs_util::{
    acquire_lock, copy_dir_recursive, dir_modtime, extract_zip, list_dir, read_json, remove_path,
    utf8_path, walk_dir, write_json_atomic,
};
use crate::item::split_name;

/// Checksums keyed by `/`-separated path relative to the item directory.
pub type Checksums = BTreeMap<String, String>;

pub const MANIFEST_SUFFIX: &str = ".sha256.json";
pub const DOWNLOAD_SUFFIX: &str = ".download";

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: Utf8PathBuf,
    /// Pause between checks on another process's download.
    pub race_condition_delay: Duration,
    /// Number of checks before giving up with [`KiraError::CacheTimeout`].
    pub max_wait_retries: u32,
    pub verify_checksums: bool,
}

impl CacheSettings {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            race_condition_delay: Duration::from_secs(30),
            max_wait_retries: 20,
            verify_checksums: true,
        }
    }
}

/// How a remote delivered the files of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    /// The files were written into the target directory.
    Directory,
    /// A zip archive holding the files was written at the given path, inside
    /// the target directory.
    ZipArchive(Utf8PathBuf),
}

pub trait RemoteFiles: Send + Sync {
    fn download_files(&self, uri: &str, target: &Utf8Path) -> Result<Download, KiraError>;

    /// Stores the files below `source` at `uri`, replacing what was there.
    fn upload_files(&self, source: &Utf8Path, uri: &str) -> Result<(), KiraError>;

    fn get_checksums(&self, uri: &str) -> Result<Checksums, KiraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedItem {
    pub path: Utf8PathBuf,
    pub checksums: Checksums,
}

enum WaitOutcome {
    Ready,
    Restart,
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    settings: CacheSettings,
}

impl CacheManager {
    pub fn new(settings: CacheSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn root(&self) -> &Utf8Path {
        &self.settings.root
    }

    /// Cache directory of a remote item: the URI without its scheme, below
    /// the cache root.
    pub fn cache_path(&self, uri: &str) -> Result<Utf8PathBuf, KiraError> {
        let relative = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
        let mut path = self.settings.root.clone();
        let mut depth = 0;
        for part in relative.split('/').filter(|part| !part.is_empty()) {
            if part == "." || part == ".." {
                return Err(KiraError::Remote(format!(
                    "refusing to cache {uri}: relative path components"
                )));
            }
            path.push(part);
            depth += 1;
        }
        if depth == 0 {
            return Err(KiraError::Remote(format!("cannot derive a cache path from '{uri}'")));
        }
        Ok(path)
    }

    pub fn manifest_path(entry: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{entry}{MANIFEST_SUFFIX}"))
    }

    pub fn download_path(entry: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{entry}{DOWNLOAD_SUFFIX}"))
    }

    pub fn read_manifest(entry: &Utf8Path) -> Option<Checksums> {
        let path = Self::manifest_path(entry);
        if !path.as_std_path().exists() {
            return None;
        }
        match read_json(&path) {
            Ok(checksums) => Some(checksums),
            Err(err) => {
                warn!(path = %path, "ignoring unreadable cache manifest: {err}");
                None
            }
        }
    }

    fn is_fresh(&self, entry: &Utf8Path, remote: Option<&Checksums>) -> bool {
        if !entry.as_std_path().exists() {
            return false;
        }
        let Some(remote) = remote else {
            return true;
        };
        let fresh = Self::read_manifest(entry).as_ref() == Some(remote);
        if !fresh {
            let mismatch = KiraError::ChecksumMismatch {
                uri: entry.to_string(),
            };
            debug!("{mismatch}, fetching again");
        }
        fresh
    }

    /// Makes the files of `uri` available locally and returns their directory.
    pub fn get(&self, remote: &dyn RemoteFiles, uri: &str) -> Result<Utf8PathBuf, KiraError> {
        let entry = self.cache_path(uri)?;
        let expected = if self.settings.verify_checksums {
            Some(remote.get_checksums(uri)?)
        } else {
            None
        };
        let download_dir = Self::download_path(&entry);
        let mut attempts = 0u32;
        loop {
            if self.is_fresh(&entry, expected.as_ref()) {
                debug!(uri = %uri, "cache hit");
                return Ok(entry);
            }
            if let Some(parent) = entry.parent() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| KiraError::Filesystem(format!("create {parent}: {err}")))?;
            }
            match fs::create_dir(download_dir.as_std_path()) {
                Ok(()) => {
                    // Another process may have promoted the entry between the
                    // check above and the claim.
                    if self.is_fresh(&entry, expected.as_ref()) {
                        release_claim(&download_dir);
                        return Ok(entry);
                    }
                    let staging = Builder::new()
                        .prefix(".kira-ds-fetch")
                        .tempdir_in(download_dir.as_std_path())
                        .map_err(|err| {
                            KiraError::Filesystem(format!("stage {download_dir}: {err}"))
                        })?;
                    let staged = utf8_path(staging.path().to_path_buf())?;
                    match self.download(remote, uri, &entry, &staged, expected.as_ref()) {
                        Ok(()) => {
                            release_claim(&download_dir);
                            return Ok(entry);
                        }
                        Err(err) if !staged.as_std_path().exists() => {
                            warn!(uri = %uri, "download was taken over by another process: {err}");
                            continue;
                        }
                        Err(err) => {
                            release_claim(&download_dir);
                            return Err(err);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match self.wait_for_download(
                        uri,
                        &entry,
                        &download_dir,
                        expected.as_ref(),
                        &mut attempts,
                    )? {
                        WaitOutcome::Ready => return Ok(entry),
                        WaitOutcome::Restart => continue,
                    }
                }
                Err(err) => {
                    return Err(KiraError::Filesystem(format!(
                        "create {download_dir}: {err}"
                    )));
                }
            }
        }
    }

    fn wait_for_download(
        &self,
        uri: &str,
        entry: &Utf8Path,
        download_dir: &Utf8Path,
        expected: Option<&Checksums>,
        attempts: &mut u32,
    ) -> Result<WaitOutcome, KiraError> {
        info!(uri = %uri, "waiting for another process to finish downloading");
        let mut last_modified = dir_modtime(download_dir.as_std_path());
        loop {
            if *attempts >= self.settings.max_wait_retries {
                return Err(KiraError::CacheTimeout {
                    uri: uri.to_string(),
                    attempts: *attempts,
                });
            }
            thread::sleep(self.settings.race_condition_delay);
            *attempts += 1;
            if self.is_fresh(entry, expected) {
                debug!(uri = %uri, "adopting copy downloaded by another process");
                return Ok(WaitOutcome::Ready);
            }
            if !download_dir.as_std_path().exists() {
                return Ok(WaitOutcome::Restart);
            }
            let modified = dir_modtime(download_dir.as_std_path());
            if modified > last_modified {
                last_modified = modified;
                continue;
            }
            warn!(uri = %uri, "download by another process stalled, restarting it");
            remove_path(download_dir)?;
            return Ok(WaitOutcome::Restart);
        }
    }

    fn download(
        &self,
        remote: &dyn RemoteFiles,
        uri: &str,
        entry: &Utf8Path,
        staged: &Utf8Path,
        expected: Option<&Checksums>,
    ) -> Result<(), KiraError> {
        info!(uri = %uri, "downloading into cache");
        if let Download::ZipArchive(archive) = remote.download_files(uri, staged)? {
            extract_zip(archive.as_std_path(), staged.as_std_path())?;
            remove_path(&archive)?;
        }
        let reported = match expected {
            Some(checksums) => checksums.clone(),
            None => remote.get_checksums(uri)?,
        };
        let local = compute_checksums(staged)?;
        // The manifest always lists what was actually cached.
        if local != reported {
            let mismatch = KiraError::ChecksumMismatch {
                uri: uri.to_string(),
            };
            warn!("{mismatch}, the next get fetches it again");
        }
        if !staged.as_std_path().exists() {
            return Err(KiraError::Filesystem(format!(
                "staging directory {staged} was removed"
            )));
        }
        let manifest = Self::manifest_path(entry);
        remove_path(&manifest)?;
        remove_path(entry)?;
        write_json_atomic(&manifest, &local)?;
        fs::rename(staged.as_std_path(), entry.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("promote {staged}: {err}")))?;
        Ok(())
    }

    /// Uploads `sources` to `uri` and mirrors what was stored into the cache.
    /// When `stem` is given, files are renamed to it keeping their extensions.
    pub fn put(
        &self,
        remote: &dyn RemoteFiles,
        uri: &str,
        sources: &[Utf8PathBuf],
        stem: Option<&str>,
    ) -> Result<CachedItem, KiraError> {
        let entry = self.cache_path(uri)?;
        let parent = entry
            .parent()
            .ok_or_else(|| KiraError::Filesystem(format!("invalid cache entry {entry}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {parent}: {err}")))?;
        let staging = Builder::new()
            .prefix(".kira-ds-put")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let staged = utf8_path(staging.path().join("files"))?;
        stage_files(sources, stem, &staged)?;

        remote.upload_files(&staged, uri)?;
        let local = compute_checksums(&staged)?;
        let stored = remote.get_checksums(uri)?;
        if local != stored {
            warn!(uri = %uri, "remote checksums differ from the uploaded files, re-downloading");
            self.invalidate(uri)?;
            drop(staging);
            let path = self.get(remote, uri)?;
            let checksums = Self::read_manifest(&path).unwrap_or(stored);
            return Ok(CachedItem { path, checksums });
        }

        let _lock = acquire_lock(&entry)?;
        let manifest = Self::manifest_path(&entry);
        if entry.as_std_path().exists() {
            if let Some(previous) = Self::read_manifest(&entry) {
                if compute_checksums(&entry)? != previous {
                    warn!(uri = %uri, "overwriting local edits to the cached copy");
                }
            }
            remove_path(&manifest)?;
            remove_path(&entry)?;
        }
        fs::rename(staged.as_std_path(), entry.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("mirror {uri}: {err}")))?;
        write_json_atomic(&manifest, &stored)?;
        Ok(CachedItem {
            path: entry,
            checksums: stored,
        })
    }

    pub fn invalidate(&self, uri: &str) -> Result<(), KiraError> {
        let entry = self.cache_path(uri)?;
        remove_path(&Self::manifest_path(&entry))?;
        remove_path(&entry)
    }

    /// Removes every cached item.
    pub fn clear(&self) -> Result<(), KiraError> {
        if !self.settings.root.as_std_path().exists() {
            return Ok(());
        }
        for child in list_dir(&self.settings.root)? {
            remove_path(&child)?;
        }
        info!(root = %self.settings.root, "cleared cache");
        Ok(())
    }
}

fn release_claim(download_dir: &Utf8Path) {
    if let Err(err) = remove_path(download_dir) {
        warn!(path = %download_dir, "leaving download directory behind: {err}");
    }
}

fn stage_files(
    sources: &[Utf8PathBuf],
    stem: Option<&str>,
    staged: &Utf8Path,
) -> Result<(), KiraError> {
    fs::create_dir_all(staged.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for source in sources {
        let name = source
            .file_name()
            .ok_or_else(|| KiraError::Filesystem(format!("invalid source path {source}")))?;
        let target_name = match stem {
            Some(stem) => format!("{stem}{}", split_name(name).1),
            None => name.to_string(),
        };
        let target = staged.join(target_name);
        if source.as_std_path().is_dir() {
            copy_dir_recursive(source, &target)?;
        } else {
            fs::copy(source.as_std_path(), target.as_std_path())
                .map_err(|err| KiraError::Filesystem(format!("copy {source}: {err}")))?;
        }
    }
    Ok(())
}

/// SHA-256 of every file below `dir`, keyed by `/`-separated relative path.
pub fn compute_checksums(dir: &Utf8Path) -> Result<Checksums, KiraError> {
    let mut checksums = Checksums::new();
    if dir.as_std_path().is_file() {
        let name = dir.file_name().unwrap_or_default().to_string();
        checksums.insert(name, file_checksum(dir.as_std_path())?);
        return Ok(checksums);
    }
    for path in walk_dir(dir.as_std_path())? {
        if path.is_dir() {
            continue;
        }
        let relative = path
            .strip_prefix(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        checksums.insert(relative, file_checksum(&path)?);
    }
    Ok(checksums)
}

pub fn file_checksum(path: &Path) -> Result<String, KiraError> {
    let mut file = File::open(path)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_strips_scheme() {
        let manager = CacheManager::new(CacheSettings::new(Utf8PathBuf::from("/cache")));
        assert_eq!(
            manager
                .cache_path("archive://study/01/MR1/resources/T1w")
                .unwrap(),
            Utf8PathBuf::from("/cache/study/01/MR1/resources/T1w")
        );
        assert!(manager.cache_path("archive://study/../etc").is_err());
        assert!(manager.cache_path("archive://").is_err());
    }

    #[test]
    fn checksums_use_relative_slash_paths() {
        let temp = tempfile::tempdir().unwrap();
        let dir = utf8_path(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(dir.join("sub").as_std_path()).unwrap();
        fs::write(dir.join("a.txt").as_std_path(), b"abc").unwrap();
        fs::write(dir.join("sub").join("b.txt").as_std_path(), b"").unwrap();
        let checksums = compute_checksums(&dir).unwrap();
        assert_eq!(
            checksums.get("a.txt").map(String::as_str),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert!(checksums.contains_key("sub/b.txt"));
    }
}
