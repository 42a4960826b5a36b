//! A dataset stored as a plain directory tree.
//!
//! `<root>/<dataset id>/<layer 1>/.../<layer n>/` holds the items of a leaf
//! row; summary rows live below the escape token directory their path ends
//! with. Files sharing a stem form one file-group, fields are kept in the
//! row's `__fields__.json` and derived file-groups have their provenance in
//! `<stem>.__prov__.json`.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendArgs, RowContext, SharedBackend, StoredItem};
use crate::cache::{Checksums, compute_checksums};
use crate::codec::{check_identifier, is_special};
use crate::error::KiraError;
use crate::fs_util::{
    LOCK_SUFFIX, copy_dir_atomic, copy_file_atomic, list_dir, read_json, remove_path,
};
use crate::item::{DataItem, Field, FileGroup, Item, split_name};
use crate::provenance::{PROVENANCE_SUFFIX, PROVENANCE_VERSION, Provenance};
use crate::registry::Registry;
use crate::sidetable::{FIELDS_FILE, FieldEntry, FieldTable};
use crate::tree::DataTree;

#[derive(Debug, Clone)]
pub struct DirTree {
    root: Utf8PathBuf,
    min_provenance_version: String,
}

impl DirTree {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            min_provenance_version: PROVENANCE_VERSION.to_string(),
        }
    }

    pub fn with_min_provenance_version(mut self, version: &str) -> Self {
        self.min_provenance_version = version.to_string();
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn row_dir(&self, row: &RowContext<'_>) -> Result<Utf8PathBuf, KiraError> {
        let mut dir = self.root.join(row.dataset_id);
        for segment in row.path_segments()? {
            dir.push(segment);
        }
        Ok(dir)
    }

    fn provenance_path(dir: &Utf8Path, stem: &str) -> Utf8PathBuf {
        dir.join(format!("{stem}{PROVENANCE_SUFFIX}"))
    }

    fn walk(
        &self,
        dir: &Utf8Path,
        remaining: usize,
        path: &mut Vec<String>,
        tree: &mut DataTree,
    ) -> Result<(), KiraError> {
        if remaining == 0 {
            tree.add_leaf(path.as_slice())?;
            return Ok(());
        }
        for child in list_dir(dir)? {
            if !child.as_std_path().is_dir() {
                continue;
            }
            let Some(name) = child.file_name() else {
                continue;
            };
            if is_special(name) {
                continue;
            }
            path.push(name.to_string());
            self.walk(&child, remaining - 1, path, tree)?;
            path.pop();
        }
        Ok(())
    }

    fn is_item_file(name: &str) -> bool {
        !(is_special(name)
            || name == FIELDS_FILE
            || name.ends_with(LOCK_SUFFIX)
            || name.ends_with(PROVENANCE_SUFFIX))
    }

    fn file_group(&self, dir: &Utf8Path, stem: &str, files: Vec<Utf8PathBuf>) -> Item {
        let is_dir = files.len() == 1 && files[0].as_std_path().is_dir();
        let group = FileGroup {
            is_dir,
            ..FileGroup::new(stem, files)
        };
        let side_car = dir.join(format!("{stem}.json"));
        let header = if group.files.contains(&side_car) {
            match read_json::<Value>(&side_car) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                Ok(_) => BTreeMap::new(),
                Err(err) => {
                    debug!(path = %side_car, "ignoring unreadable side-car: {err}");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        // A bad record only fails lookups of this item's provenance.
        let prov_path = Self::provenance_path(dir, stem);
        let provenance = match Provenance::load_optional(&prov_path, &self.min_provenance_version) {
            Ok(provenance) => provenance,
            Err(err) => {
                warn!(path = %prov_path, "leaving provenance unresolved: {err}");
                None
            }
        };
        Item::FileGroup(group)
            .with_uri(dir.join(stem).to_string())
            .with_header(header)
            .with_provenance(provenance)
    }
}

impl Backend for DirTree {
    fn name(&self) -> &str {
        "dirtree"
    }

    fn find_rows(&self, dataset_id: &str, tree: &mut DataTree) -> Result<(), KiraError> {
        let dataset_dir = self.root.join(dataset_id);
        if !dataset_dir.as_std_path().is_dir() {
            return Err(KiraError::DatasetNotFound(dataset_dir.to_string()));
        }
        let depth = tree.hierarchy().len();
        self.walk(&dataset_dir, depth, &mut Vec::new(), tree)
    }

    fn find_items(&self, row: &RowContext<'_>) -> Result<Vec<Item>, KiraError> {
        let dir = self.row_dir(row)?;
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let mut groups: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
        for path in list_dir(&dir)? {
            let Some(name) = path.file_name() else {
                continue;
            };
            if !Self::is_item_file(name) {
                continue;
            }
            let stem = if path.as_std_path().is_dir() {
                name
            } else {
                split_name(name).0
            };
            groups.entry(stem.to_string()).or_default().push(path.clone());
        }

        let mut items = Vec::with_capacity(groups.len());
        for (stem, files) in groups {
            items.push(self.file_group(&dir, &stem, files));
        }
        for (name, entry) in FieldTable::in_dir(&dir).read()? {
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
        if !item.meta.exists || item.files.is_empty() {
            return Err(KiraError::MissingData(item.meta.path.clone()));
        }
        if let Some(missing) = item.files.iter().find(|file| !file.as_std_path().exists()) {
            return Err(KiraError::MissingData(missing.to_string()));
        }
        Ok(item.files.clone())
    }

    fn put_item_locations(
        &self,
        row: &RowContext<'_>,
        item: &FileGroup,
        sources: &[Utf8PathBuf],
    ) -> Result<StoredItem, KiraError> {
        let stem = item.meta.path.as_str();
        check_identifier(stem)?;
        let dir = self.row_dir(row)?;
        if dir.as_std_path().is_dir() {
            remove_path(&Self::provenance_path(&dir, stem))?;
            for existing in list_dir(&dir)? {
                let Some(name) = existing.file_name() else {
                    continue;
                };
                if Self::is_item_file(name) && split_name(name).0 == stem {
                    remove_path(&existing)?;
                }
            }
        }

        let mut locations = Vec::with_capacity(sources.len());
        let mut checksums = Checksums::new();
        for source in sources {
            let dest = if source.as_std_path().is_dir() {
                let dest = dir.join(stem);
                copy_dir_atomic(source, &dest)?;
                dest
            } else {
                let name = source
                    .file_name()
                    .ok_or_else(|| KiraError::Filesystem(format!("invalid source {source}")))?;
                let dest = dir.join(format!("{stem}{}", split_name(name).1));
                copy_file_atomic(source, &dest)?;
                dest
            };
            for (relative, checksum) in compute_checksums(&dest)? {
                let key = match dest.file_name() {
                    Some(name) if dest.as_std_path().is_dir() => format!("{name}/{relative}"),
                    _ => relative,
                };
                checksums.insert(key, checksum);
            }
            locations.push(dest);
        }
        debug!(row = %dir, item = %stem, "stored file-group");
        Ok(StoredItem {
            uri: Some(dir.join(stem).to_string()),
            locations,
            checksums,
        })
    }

    fn get_field_value(
        &self,
        row: &RowContext<'_>,
        field: &Field,
    ) -> Result<Option<Value>, KiraError> {
        let dir = self.row_dir(row)?;
        Ok(FieldTable::in_dir(&dir)
            .get(&field.meta.path)?
            .map(|entry| entry.value().clone()))
    }

    fn put_field_value(
        &self,
        row: &RowContext<'_>,
        field: &Field,
        value: Value,
    ) -> Result<(), KiraError> {
        let dir = self.row_dir(row)?;
        FieldTable::in_dir(&dir).put(&field.meta.path, value, None)
    }

    fn get_provenance(
        &self,
        row: &RowContext<'_>,
        item: &Item,
    ) -> Result<Option<Provenance>, KiraError> {
        let dir = self.row_dir(row)?;
        match item {
            Item::FileGroup(_) => Provenance::load_optional(
                &Self::provenance_path(&dir, item.path()),
                &self.min_provenance_version,
            ),
            Item::Field(_) => {
                let provenance = FieldTable::in_dir(&dir)
                    .get(item.path())?
                    .and_then(|entry| entry.provenance().cloned());
                if let Some(provenance) = &provenance {
                    provenance.check_version(&self.min_provenance_version)?;
                }
                Ok(provenance)
            }
        }
    }

    fn put_provenance(
        &self,
        row: &RowContext<'_>,
        item: &Item,
        provenance: &Provenance,
    ) -> Result<(), KiraError> {
        let dir = self.row_dir(row)?;
        match item {
            Item::FileGroup(_) => provenance.save(&Self::provenance_path(&dir, item.path())),
            Item::Field(_) => {
                let name = item.path().to_string();
                let mut missing = false;
                FieldTable::in_dir(&dir).update(|fields| match fields.get(&name) {
                    Some(entry) => {
                        let value = entry.value().clone();
                        fields.insert(
                            name.clone(),
                            FieldEntry::new(value, Some(provenance.clone())),
                        );
                    }
                    None => missing = true,
                })?;
                if missing {
                    return Err(KiraError::MissingData(format!("field '{name}' in {dir}")));
                }
                Ok(())
            }
        }
    }
}

pub fn register(registry: &mut Registry<SharedBackend, BackendArgs>) {
    registry.register("dirtree", |args: &BackendArgs| {
        let store = DirTree::new(args.path_param("root")?)
            .with_min_provenance_version(&args.settings.min_provenance_version);
        Ok(Arc::new(store) as SharedBackend)
    });
}
