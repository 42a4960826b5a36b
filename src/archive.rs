//! A remote archive served from a directory, reached through the cache.
//!
//! Rows are nested directories under `<root>/<dataset id>`; each keeps its
//! resources in `resources/<name>/` with `resources/<name>.meta.json` holding
//! their quality and header, `resources/<name>.__prov__.json` their
//! provenance, and `__fields__.json` the fields of the row. Resources are
//! addressed as `archive://<dataset id>/<row path>/resources/<name>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::backend::{BackendArgs, SharedBackend};
use crate::cache::{CacheManager, Checksums, Download, RemoteFiles, compute_checksums};
use crate::codec::is_special;
use crate::error::KiraError;
use crate::fs_util::{
    copy_dir_atomic, copy_dir_recursive, list_dir, read_json, remove_path, walk_dir,
    write_json_atomic, write_zip,
};
use crate::item::DataQuality;
use crate::provenance::{PROVENANCE_SUFFIX, Provenance};
use crate::registry::Registry;
use crate::remote::{RemoteClient, RemoteEntry, RemoteStore};
use crate::sidetable::{FIELDS_FILE, FieldMap};

pub const SCHEME: &str = "archive://";
pub const RESOURCES_DIR: &str = "resources";
const META_SUFFIX: &str = ".meta.json";
const ZIP_NAME: &str = ".archive.zip";

#[derive(Debug, Default, Deserialize)]
struct ResourceMeta {
    #[serde(default)]
    quality: DataQuality,
    #[serde(default)]
    header: BTreeMap<String, Value>,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct DirArchiveClient {
    root: Utf8PathBuf,
    serve_zip: bool,
}

impl DirArchiveClient {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            serve_zip: false,
        }
    }

    /// Deliver downloads as zip archives instead of plain directories.
    pub fn with_zip(mut self, serve_zip: bool) -> Self {
        self.serve_zip = serve_zip;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, uri: &str) -> Result<Utf8PathBuf, KiraError> {
        let relative = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| KiraError::Remote(format!("not an archive URI: {uri}")))?;
        if relative
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(KiraError::Remote(format!("invalid archive URI: {uri}")));
        }
        Ok(self.root.join(relative))
    }

    fn row_dir(&self, dataset_id: &str, row_path: &[String]) -> Utf8PathBuf {
        let mut dir = self.root.join(dataset_id);
        for segment in row_path {
            dir.push(segment);
        }
        dir
    }

    fn collect_rows(
        dir: &Utf8Path,
        remaining: usize,
        path: &mut Vec<String>,
        rows: &mut Vec<Vec<String>>,
    ) -> Result<(), KiraError> {
        if remaining == 0 {
            rows.push(path.clone());
            return Ok(());
        }
        for child in list_dir(dir)? {
            if !child.as_std_path().is_dir() {
                continue;
            }
            let Some(name) = child.file_name() else {
                continue;
            };
            if name == RESOURCES_DIR || is_special(name) {
                continue;
            }
            path.push(name.to_string());
            Self::collect_rows(&child, remaining - 1, path, rows)?;
            path.pop();
        }
        Ok(())
    }

    fn entry(&self, uri: String, dir: &Utf8Path, name: &str) -> Result<RemoteEntry, KiraError> {
        let meta_path = dir.with_file_name(format!("{name}{META_SUFFIX}"));
        let meta = if meta_path.as_std_path().is_file() {
            read_json::<ResourceMeta>(&meta_path)?
        } else {
            ResourceMeta::default()
        };
        let mut files = Vec::new();
        for file in walk_dir(dir.as_std_path())? {
            if file.is_dir() {
                continue;
            }
            if let Ok(relative) = file.strip_prefix(dir.as_std_path()) {
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(RemoteEntry {
            name: name.to_string(),
            uri,
            files,
            is_dir: meta.is_dir,
            quality: meta.quality,
            header: meta.header,
            checksums: Some(compute_checksums(dir)?),
        })
    }

    fn provenance_path(&self, uri: &str) -> Result<Utf8PathBuf, KiraError> {
        let path = self.resolve(uri)?;
        let name = path
            .file_name()
            .ok_or_else(|| KiraError::Remote(format!("invalid archive URI: {uri}")))?
            .to_string();
        Ok(path.with_file_name(format!("{name}{PROVENANCE_SUFFIX}")))
    }
}

impl RemoteFiles for DirArchiveClient {
    fn download_files(&self, uri: &str, target: &Utf8Path) -> Result<Download, KiraError> {
        let source = self.resolve(uri)?;
        if !source.as_std_path().is_dir() {
            return Err(KiraError::MissingData(uri.to_string()));
        }
        if self.serve_zip {
            let zip_path = target.join(ZIP_NAME);
            write_zip(source.as_std_path(), zip_path.as_std_path())?;
            debug!(uri, "served archive resource as zip");
            return Ok(Download::ZipArchive(zip_path));
        }
        copy_dir_recursive(&source, target)?;
        Ok(Download::Directory)
    }

    fn upload_files(&self, source: &Utf8Path, uri: &str) -> Result<(), KiraError> {
        let dest = self.resolve(uri)?;
        // Provenance of the replaced files no longer describes the item.
        remove_path(&self.provenance_path(uri)?)?;
        copy_dir_atomic(source, &dest)
    }

    fn get_checksums(&self, uri: &str) -> Result<Checksums, KiraError> {
        let path = self.resolve(uri)?;
        if !path.as_std_path().is_dir() {
            return Err(KiraError::MissingData(uri.to_string()));
        }
        compute_checksums(&path)
    }
}

impl RemoteClient for DirArchiveClient {
    fn list_rows(&self, dataset_id: &str, depth: usize) -> Result<Vec<Vec<String>>, KiraError> {
        let dataset_dir = self.root.join(dataset_id);
        if !dataset_dir.as_std_path().is_dir() {
            return Err(KiraError::DatasetNotFound(format!("{SCHEME}{dataset_id}")));
        }
        let mut rows = Vec::new();
        Self::collect_rows(&dataset_dir, depth, &mut Vec::new(), &mut rows)?;
        Ok(rows)
    }

    fn list_entries(
        &self,
        dataset_id: &str,
        row_path: &[String],
    ) -> Result<Vec<RemoteEntry>, KiraError> {
        let resources = self.row_dir(dataset_id, row_path).join(RESOURCES_DIR);
        if !resources.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for child in list_dir(&resources)? {
            if !child.as_std_path().is_dir() {
                continue;
            }
            let Some(name) = child.file_name() else {
                continue;
            };
            if is_special(name) {
                continue;
            }
            let uri = self.entry_uri(dataset_id, row_path, name);
            entries.push(self.entry(uri, &child, name)?);
        }
        Ok(entries)
    }

    fn entry_uri(&self, dataset_id: &str, row_path: &[String], name: &str) -> String {
        let mut parts = vec![dataset_id.to_string()];
        parts.extend(row_path.iter().cloned());
        parts.push(RESOURCES_DIR.to_string());
        parts.push(name.to_string());
        format!("{SCHEME}{}", parts.join("/"))
    }

    fn get_fields(&self, dataset_id: &str, row_path: &[String]) -> Result<FieldMap, KiraError> {
        let path = self.row_dir(dataset_id, row_path).join(FIELDS_FILE);
        if !path.as_std_path().is_file() {
            return Ok(FieldMap::new());
        }
        read_json(&path)
    }

    fn put_fields(
        &self,
        dataset_id: &str,
        row_path: &[String],
        fields: &FieldMap,
    ) -> Result<(), KiraError> {
        let path = self.row_dir(dataset_id, row_path).join(FIELDS_FILE);
        write_json_atomic(&path, fields)
    }

    fn get_provenance(&self, uri: &str) -> Result<Option<Provenance>, KiraError> {
        let path = self.provenance_path(uri)?;
        if !path.as_std_path().is_file() {
            return Ok(None);
        }
        Provenance::read(&path).map(Some)
    }

    fn put_provenance(&self, uri: &str, provenance: &Provenance) -> Result<(), KiraError> {
        provenance.save(&self.provenance_path(uri)?)
    }
}

pub fn register(registry: &mut Registry<SharedBackend, BackendArgs>) {
    registry.register("archive", |args: &BackendArgs| {
        let client = DirArchiveClient::new(args.path_param("root")?).with_zip(args.bool_param("zip"));
        let cache = CacheManager::new(args.settings.cache_settings());
        let store = RemoteStore::new("archive", client, cache)
            .with_min_provenance_version(&args.settings.min_provenance_version);
        Ok(Arc::new(store) as SharedBackend)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn archive() -> (tempfile::TempDir, DirArchiveClient) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let resource = root.join("study/01/MR1/resources/T1w");
        fs::create_dir_all(resource.as_std_path()).unwrap();
        fs::write(resource.join("T1w.nii").as_std_path(), b"image").unwrap();
        fs::write(
            root.join("study/01/MR1/resources/T1w.meta.json").as_std_path(),
            r#"{"quality": "questionable", "header": {"echo": 1}}"#,
        )
        .unwrap();
        fs::create_dir_all(root.join("study/02/MR1").as_std_path()).unwrap();
        (dir, DirArchiveClient::new(root))
    }

    #[test]
    fn rows_skip_resource_dirs() {
        let (_dir, client) = archive();
        let rows = client.list_rows("study", 2).unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["01".to_string(), "MR1".to_string()],
                vec!["02".to_string(), "MR1".to_string()],
            ]
        );
    }

    #[test]
    fn entries_carry_meta_and_checksums() {
        let (_dir, client) = archive();
        let path = vec!["01".to_string(), "MR1".to_string()];
        let entries = client.list_entries("study", &path).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.uri, "archive://study/01/MR1/resources/T1w");
        assert_eq!(entry.files, vec!["T1w.nii".to_string()]);
        assert_eq!(entry.quality, DataQuality::Questionable);
        assert_eq!(entry.header.get("echo"), Some(&Value::from(1)));
        assert!(entry.checksums.as_ref().unwrap().contains_key("T1w.nii"));
    }

    #[test]
    fn zip_download_is_flagged() {
        let (_dir, client) = archive();
        let client = client.with_zip(true);
        let target = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::from_path_buf(target.path().to_path_buf()).unwrap();
        let download = client
            .download_files("archive://study/01/MR1/resources/T1w", &target)
            .unwrap();
        assert_eq!(download, Download::ZipArchive(target.join(ZIP_NAME)));
    }

    #[test]
    fn escaping_uris_are_rejected() {
        let (_dir, client) = archive();
        assert!(client.get_checksums("archive://study/../x").is_err());
        assert!(client.get_checksums("file:///etc").is_err());
    }
}
