//! The contract every store implements, and the registry of store kinds.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::Value;

use crate::cache::Checksums;
use crate::codec::encode;
use crate::config::Settings;
use crate::error::KiraError;
use crate::ids::IdentifierMap;
use crate::item::{Field, FileGroup, Item};
use crate::provenance::Provenance;
use crate::registry::Registry;
use crate::space::{DataSpace, Frequency, Hierarchy};
use crate::tree::{DataTree, RowIndex};

/// A row as seen by a backend: where it sits in the dataset.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub dataset_id: &'a str,
    pub space: &'a DataSpace,
    pub hierarchy: &'a Hierarchy,
    pub frequency: Frequency,
    pub ids: &'a IdentifierMap,
}

impl<'a> RowContext<'a> {
    pub fn new(dataset_id: &'a str, tree: &'a DataTree, row: RowIndex) -> Self {
        let row = tree.row(row);
        Self {
            dataset_id,
            space: tree.space(),
            hierarchy: tree.hierarchy(),
            frequency: row.frequency(),
            ids: row.ids(),
        }
    }

    /// Path segments of the row below the dataset root.
    pub fn path_segments(&self) -> Result<Vec<String>, KiraError> {
        encode(self.space, self.hierarchy, self.frequency, self.ids)
    }

    pub fn relative_path(&self) -> Result<String, KiraError> {
        Ok(self.path_segments()?.join("/"))
    }
}

/// Where a file-group ended up after being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub uri: Option<String>,
    pub locations: Vec<Utf8PathBuf>,
    pub checksums: Checksums,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Adds a leaf to `tree` for every row present in the store.
    fn find_rows(&self, dataset_id: &str, tree: &mut DataTree) -> Result<(), KiraError>;

    /// Lists the items stored in a row, unresolved.
    fn find_items(&self, row: &RowContext<'_>) -> Result<Vec<Item>, KiraError>;

    /// Local paths holding the files of `item` once this returns.
    fn get_item_locations(
        &self,
        row: &RowContext<'_>,
        item: &FileGroup,
    ) -> Result<Vec<Utf8PathBuf>, KiraError>;

    /// Stores `sources` as the files of `item`, durably.
    fn put_item_locations(
        &self,
        row: &RowContext<'_>,
        item: &FileGroup,
        sources: &[Utf8PathBuf],
    ) -> Result<StoredItem, KiraError>;

    fn get_field_value(
        &self,
        row: &RowContext<'_>,
        field: &Field,
    ) -> Result<Option<Value>, KiraError>;

    fn put_field_value(
        &self,
        row: &RowContext<'_>,
        field: &Field,
        value: Value,
    ) -> Result<(), KiraError>;

    fn get_provenance(
        &self,
        row: &RowContext<'_>,
        item: &Item,
    ) -> Result<Option<Provenance>, KiraError>;

    fn put_provenance(
        &self,
        row: &RowContext<'_>,
        item: &Item,
        provenance: &Provenance,
    ) -> Result<(), KiraError>;
}

/// Arguments handed to backend factories.
#[derive(Debug, Clone)]
pub struct BackendArgs {
    pub settings: Settings,
    pub params: Value,
}

impl BackendArgs {
    pub fn path_param(&self, key: &str) -> Result<Utf8PathBuf, KiraError> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(Utf8PathBuf::from)
            .ok_or_else(|| KiraError::ConfigParse(format!("store parameter '{key}' is required")))
    }

    pub fn bool_param(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

pub type SharedBackend = Arc<dyn Backend>;

pub fn backends() -> Registry<SharedBackend, BackendArgs> {
    let mut registry = Registry::new("store backend");
    crate::dirtree::register(&mut registry);
    crate::archive::register(&mut registry);
    registry
}
