//! Backends over a remote archive, with file-groups served from the cache.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, RowContext, StoredItem};
use crate::cache::{CacheManager, Checksums, RemoteFiles};
use crate::codec::is_special;
use crate::error::KiraError;
use crate::fs_util::{acquire_lock, list_dir};
use crate::item::{DataItem, DataQuality, Field, FileGroup, Item};
use crate::provenance::{PROVENANCE_VERSION, Provenance};
use crate::sidetable::{FIELDS_FILE, FieldEntry, FieldMap};
use crate::tree::DataTree;

/// A resource listed in a remote row.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub name: String,
    pub uri: String,
    pub files: Vec<String>,
    pub is_dir: bool,
    pub quality: DataQuality,
    pub header: BTreeMap<String, Value>,
    pub checksums: Option<Checksums>,
}

pub trait RemoteClient: RemoteFiles {
    /// Label paths of every leaf row, one label per hierarchy layer.
    fn list_rows(&self, dataset_id: &str, depth: usize) -> Result<Vec<Vec<String>>, KiraError>;

    fn list_entries(
        &self,
        dataset_id: &str,
        row_path: &[String],
    ) -> Result<Vec<RemoteEntry>, KiraError>;

    /// URI a new resource of the row would be stored at.
    fn entry_uri(&self, dataset_id: &str, row_path: &[String], name: &str) -> String;

    fn get_fields(&self, dataset_id: &str, row_path: &[String]) -> Result<FieldMap, KiraError>;

    fn put_fields(
        &self,
        dataset_id: &str,
        row_path: &[String],
        fields: &FieldMap,
    ) -> Result<(), KiraError>;

    fn get_provenance(&self, uri: &str) -> Result<Option<Provenance>, KiraError>;

    fn put_provenance(&self, uri: &str, provenance: &Provenance) -> Result<(), KiraError>;
}

pub struct RemoteStore<C> {
    name: String,
    client: C,
    cache: CacheManager,
    min_provenance_version: String,
}

impl<C: RemoteClient> RemoteStore<C> {
    pub fn new(name: &str, client: C, cache: CacheManager) -> Self {
        Self {
            name: name.to_string(),
            client,
            cache,
            min_provenance_version: PROVENANCE_VERSION.to_string(),
        }
    }

    pub fn with_min_provenance_version(mut self, version: &str) -> Self {
        self.min_provenance_version = version.to_string();
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    fn item_uri(&self, row: &RowContext<'_>, item: &Item) -> Result<String, KiraError> {
        match &item.meta().uri {
            Some(uri) => Ok(uri.clone()),
            None => Ok(self
                .client
                .entry_uri(row.dataset_id, &row.path_segments()?, item.path())),
        }
    }

    /// Read-modify-writes the remote side-table of a row under a lock kept in
    /// the cache directory.
    fn update_fields<F>(&self, row: &RowContext<'_>, change: F) -> Result<(), KiraError>
    where
        F: FnOnce(&mut FieldMap) -> Result<(), KiraError>,
    {
        let segments = row.path_segments()?;
        let mut lock_target = self.cache.root().join(".locks").join(row.dataset_id);
        for segment in &segments {
            lock_target.push(segment);
        }
        lock_target.push(FIELDS_FILE);
        let _lock = acquire_lock(&lock_target)?;
        let mut fields = self.client.get_fields(row.dataset_id, &segments)?;
        change(&mut fields)?;
        self.client.put_fields(row.dataset_id, &segments, &fields)
    }

    fn locations(dir: &Utf8Path, item: &FileGroup) -> Result<Vec<Utf8PathBuf>, KiraError> {
        if item.is_dir {
            return Ok(vec![dir.to_path_buf()]);
        }
        list_dir(dir)
    }
}

impl<C: RemoteClient> Backend for RemoteStore<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_rows(&self, dataset_id: &str, tree: &mut DataTree) -> Result<(), KiraError> {
        for path in self.client.list_rows(dataset_id, tree.hierarchy().len())? {
            if path.iter().any(|label| is_special(label)) {
                continue;
            }
            tree.add_leaf(path.as_slice())?;
        }
        Ok(())
    }

    fn find_items(&self, row: &RowContext<'_>) -> Result<Vec<Item>, KiraError> {
        let segments = row.path_segments()?;
        let mut items = Vec::new();
        for entry in self.client.list_entries(row.dataset_id, &segments)? {
            let provenance = match self.client.get_provenance(&entry.uri) {
                Ok(provenance) => provenance,
                Err(err) => {
                    warn!(uri = %entry.uri, "leaving provenance unresolved: {err}");
                    None
                }
            };
            let group = FileGroup {
                is_dir: entry.is_dir,
                ..FileGroup::new(
                    entry.name.as_str(),
                    entry.files.iter().map(Utf8PathBuf::from).collect(),
                )
            };
            items.push(
                Item::FileGroup(group)
                    .with_uri(entry.uri)
                    .with_quality(entry.quality)
                    .with_header(entry.header)
                    .with_checksums(entry.checksums)
                    .with_provenance(provenance),
            );
        }
        for (name, entry) in self.client.get_fields(row.dataset_id, &segments)? {
            let provenance = entry.provenance().cloned();
            items.push(
                Item::Field(Field::new(&name, Some(entry.value().clone())))
                    .with_provenance(provenance),
            );
        }
        items.sort_by(|left, right| left.path().cmp(right.path()));
        Ok(items)
    }

    fn get_item_locations(
        &self,
        _row: &RowContext<'_>,
        item: &FileGroup,
    ) -> Result<Vec<Utf8PathBuf>, KiraError> {
        let uri = item
            .meta
            .uri
            .as_deref()
            .ok_or_else(|| KiraError::MissingData(item.meta.path.clone()))?;
        let dir = self.cache.get(&self.client, uri)?;
        if item.is_dir || item.files.is_empty() {
            return Self::locations(&dir, item);
        }
        // Only the files the item was resolved to.
        Ok(item
            .file_names()
            .into_iter()
            .map(|name| dir.join(name))
            .collect())
    }

    fn put_item_locations(
        &self,
        row: &RowContext<'_>,
        item: &FileGroup,
        sources: &[Utf8PathBuf],
    ) -> Result<StoredItem, KiraError> {
        let uri = self.item_uri(row, &Item::FileGroup(item.clone()))?;
        let cached = if item.is_dir {
            let mut contents = Vec::new();
            for source in sources {
                contents.extend(list_dir(source)?);
            }
            self.cache.put(&self.client, &uri, &contents, None)?
        } else {
            self.cache
                .put(&self.client, &uri, sources, Some(item.meta.path.as_str()))?
        };
        debug!(uri = %uri, "stored file-group in remote archive");
        Ok(StoredItem {
            uri: Some(uri),
            locations: Self::locations(&cached.path, item)?,
            checksums: cached.checksums,
        })
    }

    fn get_field_value(
        &self,
        row: &RowContext<'_>,
        field: &Field,
    ) -> Result<Option<Value>, KiraError> {
        let fields = self
            .client
            .get_fields(row.dataset_id, &row.path_segments()?)?;
        Ok(fields
            .get(&field.meta.path)
            .map(|entry| entry.value().clone()))
    }

    fn put_field_value(
        &self,
        row: &RowContext<'_>,
        field: &Field,
        value: Value,
    ) -> Result<(), KiraError> {
        self.update_fields(row, |fields| {
            fields.insert(field.meta.path.clone(), FieldEntry::new(value, None));
            Ok(())
        })
    }

    fn get_provenance(
        &self,
        row: &RowContext<'_>,
        item: &Item,
    ) -> Result<Option<Provenance>, KiraError> {
        let provenance = match item {
            Item::FileGroup(_) => self.client.get_provenance(&self.item_uri(row, item)?)?,
            Item::Field(field) => self
                .client
                .get_fields(row.dataset_id, &row.path_segments()?)?
                .get(&field.meta.path)
                .and_then(|entry| entry.provenance().cloned()),
        };
        if let Some(provenance) = &provenance {
            provenance.check_version(&self.min_provenance_version)?;
        }
        Ok(provenance)
    }

    fn put_provenance(
        &self,
        row: &RowContext<'_>,
        item: &Item,
        provenance: &Provenance,
    ) -> Result<(), KiraError> {
        match item {
            Item::FileGroup(_) => self
                .client
                .put_provenance(&self.item_uri(row, item)?, provenance),
            Item::Field(field) => self.update_fields(row, |fields| {
                let value = fields
                    .get(&field.meta.path)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| KiraError::MissingData(field.meta.path.clone()))?;
                fields.insert(
                    field.meta.path.clone(),
                    FieldEntry::new(value, Some(provenance.clone())),
                );
                Ok(())
            }),
        }
    }
}
