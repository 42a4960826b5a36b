use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;
use zip::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::KiraError;

pub const LOCK_SUFFIX: &str = ".lock";

pub fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf, KiraError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| KiraError::Filesystem(format!("non UTF-8 path: {}", path.display())))
}

fn lock_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}{LOCK_SUFFIX}"))
}

fn open_lock(path: &Utf8Path) -> Result<File, KiraError> {
    let path = lock_path(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {parent}: {err}")))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("open lock {path}: {err}")))
}

/// Takes an exclusive inter-process lock on `<path>.lock`. The lock is held
/// until the returned file is dropped.
pub fn acquire_lock(path: &Utf8Path) -> Result<File, KiraError> {
    let file = open_lock(path)?;
    file.lock_exclusive()
        .map_err(|err| KiraError::Filesystem(format!("lock {path}: {err}")))?;
    Ok(file)
}

pub fn acquire_shared_lock(path: &Utf8Path) -> Result<File, KiraError> {
    let file = open_lock(path)?;
    file.lock_shared()
        .map_err(|err| KiraError::Filesystem(format!("lock {path}: {err}")))?;
    Ok(file)
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".kira-ds-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Writes sorted-key, indented JSON atomically.
pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, KiraError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| KiraError::Filesystem(format!("parse {path}: {err}")))
}

/// Copies everything below `source` into `dest`, creating it if needed.
pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), KiraError> {
    create_dir(dest.as_std_path())?;
    for entry in walk_dir(source.as_std_path())? {
        let relative = entry
            .strip_prefix(source.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let target = dest.as_std_path().join(relative);
        if entry.is_dir() {
            create_dir(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            create_dir(parent)?;
        }
        fs::copy(&entry, &target).map_err(|err| {
            KiraError::Filesystem(format!("copy {} to {}: {err}", entry.display(), target.display()))
        })?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), KiraError> {
    fs::create_dir_all(path)
        .map_err(|err| KiraError::Filesystem(format!("create {}: {err}", path.display())))
}

fn destination_parent(dest: &Utf8Path) -> Result<&Utf8Path, KiraError> {
    let parent = dest
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path {dest}")))?;
    create_dir(parent.as_std_path())?;
    Ok(parent)
}

/// Copies a directory next to `dest` first and then renames it into place.
pub fn copy_dir_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), KiraError> {
    let parent = destination_parent(dest)?;
    let staging = Builder::new()
        .prefix(".kira-ds-copy")
        .tempdir_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("stage copy in {parent}: {err}")))?;
    let staged = utf8_path(staging.path().to_path_buf())?;
    copy_dir_recursive(source, &staged)?;
    atomic_rename_dir(staged.as_std_path(), dest.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("move {staged} to {dest}: {err}")))
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), KiraError> {
    let parent = destination_parent(dest)?;
    let staging = Builder::new()
        .prefix(".kira-ds-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("stage copy in {parent}: {err}")))?;
    fs::copy(source.as_std_path(), staging.path())
        .map_err(|err| KiraError::Filesystem(format!("copy {source}: {err}")))?;
    staging
        .persist(dest.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("move into {dest}: {err}")))?;
    Ok(())
}

pub fn remove_path(path: &Utf8Path) -> Result<(), KiraError> {
    let std_path = path.as_std_path();
    let result = if std_path.is_dir() {
        fs::remove_dir_all(std_path)
    } else {
        fs::remove_file(std_path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(KiraError::Filesystem(format!("remove {path}: {err}"))),
    }
}

/// All entries below `root`, sorted.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

/// Direct children of `dir` as UTF-8 paths, sorted by name.
pub fn list_dir(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("read {dir}: {err}")))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
        paths.push(utf8_path(entry.path())?);
    }
    paths.sort();
    Ok(paths)
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

/// Latest modification time of `path` or anything below it.
pub fn dir_modtime(path: &Path) -> Option<SystemTime> {
    let mut latest = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    if path.is_dir() {
        for entry in walk_dir(path).ok()? {
            if let Ok(modified) = fs::metadata(&entry).and_then(|meta| meta.modified()) {
                latest = latest.max(modified);
            }
        }
    }
    Some(latest)
}

/// Unpacks `zip_path` into `target_dir`, refusing entries that escape it.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), KiraError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| KiraError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| KiraError::Filesystem(err.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(KiraError::Filesystem(format!(
                "zip entry '{}' escapes the extraction directory",
                entry.name()
            )));
        };
        let entry_path = target_dir.join(relative);
        if entry.is_dir() {
            create_dir(&entry_path)?;
            continue;
        }
        if let Some(parent) = entry_path.parent() {
            create_dir(parent)?;
        }
        let mut outfile = fs::File::create(&entry_path).map_err(|err| {
            KiraError::Filesystem(format!("create {}: {err}", entry_path.display()))
        })?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| KiraError::Filesystem(format!("unpack {}: {err}", entry_path.display())))?;
    }
    Ok(())
}

/// Packs the files below `source` into a zip archive at `zip_path`.
pub fn write_zip(source: &Path, zip_path: &Path) -> Result<(), KiraError> {
    let file = fs::File::create(zip_path)
        .map_err(|err| KiraError::Filesystem(format!("create zip {}: {err}", zip_path.display())))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for entry in walk_dir(source)? {
        if entry.is_dir() {
            continue;
        }
        let relative = entry
            .strip_prefix(source)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer
            .start_file(name, options)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut input =
            fs::File::open(&entry).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        io::copy(&mut input, &mut writer).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_round_trip_preserves_layout() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::write(source.join("nested").join("b.txt"), b"beta").unwrap();

        let archive = temp.path().join("bundle.zip");
        write_zip(&source, &archive).unwrap();
        let target = temp.path().join("target");
        extract_zip(&archive, &target).unwrap();

        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(target.join("nested").join("b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = utf8_path(temp.path().join("out").join("value.json")).unwrap();
        write_json_atomic(&path, &serde_json::json!({"b": 1, "a": 2})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"c": 3})).unwrap();
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value, serde_json::json!({"c": 3}));
    }
}
