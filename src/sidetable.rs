//! The per-row JSON side-table holding field values.
//!
//! Each row keeps its fields in a single `__fields__.json` mapping field name
//! to either a raw value or a `{value, provenance}` object. Reads take a
//! shared lock and updates an exclusive lock on `__fields__.json.lock`, so the
//! read-modify-write is safe across processes.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KiraError;
use crate::fs_util::{acquire_lock, acquire_shared_lock, read_json, write_json_atomic};
use crate::provenance::Provenance;

pub const FIELDS_FILE: &str = "__fields__.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldEntry {
    WithProvenance { value: Value, provenance: Provenance },
    Raw(Value),
}

impl FieldEntry {
    pub fn new(value: Value, provenance: Option<Provenance>) -> Self {
        match provenance {
            Some(provenance) => FieldEntry::WithProvenance { value, provenance },
            None => FieldEntry::Raw(value),
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            FieldEntry::WithProvenance { value, .. } => value,
            FieldEntry::Raw(value) => value,
        }
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            FieldEntry::WithProvenance { provenance, .. } => Some(provenance),
            FieldEntry::Raw(_) => None,
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldEntry>;

#[derive(Debug, Clone)]
pub struct FieldTable {
    path: Utf8PathBuf,
}

impl FieldTable {
    pub fn in_dir(dir: &Utf8Path) -> Self {
        Self {
            path: dir.join(FIELDS_FILE),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn read(&self) -> Result<FieldMap, KiraError> {
        let _lock = acquire_shared_lock(&self.path)?;
        self.read_unlocked()
    }

    pub fn get(&self, name: &str) -> Result<Option<FieldEntry>, KiraError> {
        Ok(self.read()?.remove(name))
    }

    pub fn put(
        &self,
        name: &str,
        value: Value,
        provenance: Option<Provenance>,
    ) -> Result<(), KiraError> {
        self.update(|fields| {
            fields.insert(name.to_string(), FieldEntry::new(value, provenance));
        })
    }

    /// Applies `change` to the table while holding the exclusive lock.
    pub fn update<F>(&self, change: F) -> Result<(), KiraError>
    where
        F: FnOnce(&mut FieldMap),
    {
        let _lock = acquire_lock(&self.path)?;
        let mut fields = self.read_unlocked()?;
        change(&mut fields);
        write_json_atomic(&self.path, &fields)
    }

    fn read_unlocked(&self) -> Result<FieldMap, KiraError> {
        if !self.path.as_std_path().exists() {
            return Ok(FieldMap::new());
        }
        read_json(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::fs_util::utf8_path;

    #[test]
    fn raw_and_provenance_entries_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let dir = utf8_path(temp.path().to_path_buf()).unwrap();
        let table = FieldTable::in_dir(&dir);
        table.put("age", json!(42), None).unwrap();
        let provenance = Provenance::from_map(
            json!({"pipeline": "volumetrics"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        table
            .put("brain_volume", json!(1.2), Some(provenance.clone()))
            .unwrap();

        let fields = table.read().unwrap();
        assert_eq!(fields["age"], FieldEntry::Raw(json!(42)));
        assert_eq!(fields["brain_volume"].provenance(), Some(&provenance));
        assert_eq!(fields["brain_volume"].value(), &json!(1.2));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Arc::new(utf8_path(temp.path().to_path_buf()).unwrap());
        let handles = (0..8)
            .map(|index| {
                let dir = Arc::clone(&dir);
                thread::spawn(move || {
                    FieldTable::in_dir(&dir)
                        .put(&format!("field{index}"), json!(index), None)
                        .unwrap();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(FieldTable::in_dir(&dir).read().unwrap().len(), 8);
    }
}
