use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Checksums;
use crate::error::KiraError;
use crate::provenance::Provenance;
use crate::tree::RowIndex;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Unusable,
    Questionable,
    #[default]
    Usable,
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataQuality::Unusable => write!(f, "unusable"),
            DataQuality::Questionable => write!(f, "questionable"),
            DataQuality::Usable => write!(f, "usable"),
        }
    }
}

impl FromStr for DataQuality {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "unusable" => Ok(DataQuality::Unusable),
            "questionable" => Ok(DataQuality::Questionable),
            "usable" => Ok(DataQuality::Usable),
            _ => Err(KiraError::InvalidValue {
                kind: "data quality".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Attributes shared by file-groups and fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMeta {
    /// Logical path of the item within its row, e.g. `T1w` or `derivs/brain`.
    pub path: String,
    pub datatype: Option<String>,
    /// Remote identifier; `None` until the item is stored remotely.
    pub uri: Option<String>,
    pub checksums: Option<Checksums>,
    /// `None` for acquired data, set for derived data.
    pub provenance: Option<Provenance>,
    pub quality: DataQuality,
    pub header: BTreeMap<String, Value>,
    /// False for sink placeholders that have not been written yet.
    pub exists: bool,
    pub row: Option<RowIndex>,
}

impl ItemMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exists: true,
            ..Self::default()
        }
    }
}

pub trait DataItem {
    fn meta(&self) -> &ItemMeta;

    fn path(&self) -> &str {
        &self.meta().path
    }

    fn datatype(&self) -> Option<&str> {
        self.meta().datatype.as_deref()
    }

    fn provenance(&self) -> Option<&Provenance> {
        self.meta().provenance.as_ref()
    }

    fn is_derived(&self) -> bool {
        self.meta().provenance.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileGroup {
    pub meta: ItemMeta,
    pub files: Vec<Utf8PathBuf>,
    pub is_dir: bool,
}

impl FileGroup {
    pub fn new(path: impl Into<String>, files: Vec<Utf8PathBuf>) -> Self {
        Self {
            meta: ItemMeta::new(path),
            files,
            is_dir: false,
        }
    }

    /// File names of the group, without their directories.
    pub fn file_names(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter_map(|file| file.file_name())
            .collect()
    }
}

impl DataItem for FileGroup {
    fn meta(&self) -> &ItemMeta {
        &self.meta
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub meta: ItemMeta,
    pub value: Option<Value>,
}

impl Field {
    pub fn new(path: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            meta: ItemMeta::new(path),
            value,
        }
    }
}

impl DataItem for Field {
    fn meta(&self) -> &ItemMeta {
        &self.meta
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    FileGroup(FileGroup),
    Field(Field),
}

impl Item {
    /// An item a sink has not produced yet.
    pub fn placeholder(path: &str, datatype: &str, is_field: bool) -> Self {
        let mut meta = ItemMeta::new(path);
        meta.datatype = Some(datatype.to_string());
        meta.exists = false;
        if is_field {
            Item::Field(Field { meta, value: None })
        } else {
            Item::FileGroup(FileGroup {
                meta,
                files: Vec::new(),
                is_dir: false,
            })
        }
    }

    pub fn meta_mut(&mut self) -> &mut ItemMeta {
        match self {
            Item::FileGroup(group) => &mut group.meta,
            Item::Field(field) => &mut field.meta,
        }
    }

    pub fn exists(&self) -> bool {
        self.meta().exists
    }

    pub fn as_file_group(&self) -> Option<&FileGroup> {
        match self {
            Item::FileGroup(group) => Some(group),
            Item::Field(_) => None,
        }
    }

    pub fn as_field(&self) -> Option<&Field> {
        match self {
            Item::Field(field) => Some(field),
            Item::FileGroup(_) => None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.meta_mut().uri = Some(uri.into());
        self
    }

    pub fn with_quality(mut self, quality: DataQuality) -> Self {
        self.meta_mut().quality = quality;
        self
    }

    pub fn with_header(mut self, header: BTreeMap<String, Value>) -> Self {
        self.meta_mut().header = header;
        self
    }

    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.meta_mut().provenance = provenance;
        self
    }

    pub fn with_checksums(mut self, checksums: Option<Checksums>) -> Self {
        self.meta_mut().checksums = checksums;
        self
    }

    /// Short description used in match diagnostics.
    pub fn summary(&self) -> String {
        match self {
            Item::FileGroup(group) if group.is_dir => format!("{}/", group.meta.path),
            Item::FileGroup(group) => {
                let names = group.file_names();
                if names.is_empty() {
                    group.meta.path.clone()
                } else {
                    format!("{} ({})", group.meta.path, names.join(", "))
                }
            }
            Item::Field(field) => match &field.value {
                Some(value) => format!("{}={value}", field.meta.path),
                None => field.meta.path.clone(),
            },
        }
    }
}

impl DataItem for Item {
    fn meta(&self) -> &ItemMeta {
        match self {
            Item::FileGroup(group) => &group.meta,
            Item::Field(field) => &field.meta,
        }
    }
}

/// Splits a file name into its stem (up to the first `.`) and extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.find('.') {
        Some(0) | None => (name, ""),
        Some(pos) => name.split_at(pos),
    }
}

pub fn extension_of(path: &Utf8Path) -> &str {
    path.file_name().map(|name| split_name(name).1).unwrap_or("")
}
