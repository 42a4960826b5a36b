//! Provenance records of derived items and their structural comparison.

use std::cmp::Ordering;
use std::fs;

use camino::Utf8Path;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KiraError;
use crate::fs_util::write_bytes_atomic;

pub const VERSION_KEY: &str = "__prov_version__";
pub const DATETIME_KEY: &str = "datetime";
pub const PROVENANCE_VERSION: &str = "1.0";
pub const PROVENANCE_SUFFIX: &str = ".__prov__.json";

const RESERVED_KEYS: [&str; 2] = [VERSION_KEY, DATETIME_KEY];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provenance(Map<String, Value>);

impl Provenance {
    /// Stamps caller-supplied values with the current format version and time.
    pub fn new(values: Map<String, Value>) -> Self {
        let mut record = values;
        record.insert(
            VERSION_KEY.to_string(),
            Value::String(PROVENANCE_VERSION.to_string()),
        );
        record.insert(
            DATETIME_KEY.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        Self(record)
    }

    pub fn from_map(record: Map<String, Value>) -> Self {
        Self(record)
    }

    pub fn from_value(value: Value) -> Result<Self, KiraError> {
        match value {
            Value::Object(record) => Ok(Self(record)),
            other => Err(KiraError::InvalidProvenance(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.0.get(VERSION_KEY).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn check_version(&self, minimum: &str) -> Result<(), KiraError> {
        let found = self.version().unwrap_or("0");
        if compare_versions(found, minimum) == Ordering::Less {
            return Err(KiraError::StaleFormat {
                found: found.to_string(),
                minimum: minimum.to_string(),
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), KiraError> {
        let content = serde_json::to_vec_pretty(&self.0)
            .map_err(|err| KiraError::InvalidProvenance(format!("{path}: {err}")))?;
        write_bytes_atomic(path, &content)
    }

    /// Reads a record without checking its format version.
    pub fn read(path: &Utf8Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|err| KiraError::InvalidProvenance(format!("{path}: {err}")))?;
        Self::from_value(value)
    }

    pub fn load(path: &Utf8Path, minimum: &str) -> Result<Self, KiraError> {
        let record = Self::read(path)?;
        record.check_version(minimum)?;
        Ok(record)
    }

    pub fn load_optional(path: &Utf8Path, minimum: &str) -> Result<Option<Self>, KiraError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        Self::load(path, minimum).map(Some)
    }

    /// Differences between two records restricted to the paths matching one
    /// of `include` (all paths if empty) and none of `exclude`. Patterns are
    /// regular expressions matched from the start of `/`-separated key paths.
    pub fn mismatches(
        &self,
        other: &Provenance,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<ProvenanceDiff, KiraError> {
        let include = compile_patterns(include)?;
        let exclude = compile_patterns(exclude)?;
        let mut changes = Vec::new();
        diff_maps("", &self.0, &other.0, true, &mut changes);
        changes.retain(|change| {
            (include.is_empty() || include.iter().any(|re| re.is_match(&change.path)))
                && !exclude.iter().any(|re| re.is_match(&change.path))
        });
        Ok(ProvenanceDiff { changes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvenanceDiff {
    pub changes: Vec<Change>,
}

impl ProvenanceDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.changes.iter().map(|change| change.path.as_str()).collect()
    }
}

fn compile_patterns(patterns: &[&str]) -> Result<Vec<Regex>, KiraError> {
    patterns
        .iter()
        .map(|pattern| {
            let trimmed = pattern.trim_start_matches('/');
            Regex::new(&format!("^(?:{trimmed})")).map_err(|err| KiraError::InvalidPattern {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })
        })
        .collect()
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

fn diff_maps(
    prefix: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    top_level: bool,
    changes: &mut Vec<Change>,
) {
    let skip = |key: &str| top_level && RESERVED_KEYS.contains(&key);
    for (key, old_value) in old {
        if skip(key) {
            continue;
        }
        let path = join(prefix, key);
        match new.get(key) {
            Some(new_value) => diff_values(&path, old_value, new_value, changes),
            None => changes.push(Change {
                path,
                kind: ChangeKind::Removed,
                old: Some(old_value.clone()),
                new: None,
            }),
        }
    }
    for (key, new_value) in new {
        if skip(key) || old.contains_key(key) {
            continue;
        }
        changes.push(Change {
            path: join(prefix, key),
            kind: ChangeKind::Added,
            old: None,
            new: Some(new_value.clone()),
        });
    }
}

fn diff_values(path: &str, old: &Value, new: &Value, changes: &mut Vec<Change>) {
    let equal = match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            diff_maps(path, old_map, new_map, false, changes);
            return;
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            canonical_items(old_items) == canonical_items(new_items)
        }
        _ => old == new,
    };
    if !equal {
        changes.push(Change {
            path: path.to_string(),
            kind: ChangeKind::Changed,
            old: Some(old.clone()),
            new: Some(new.clone()),
        });
    }
}

// serde_json maps are key-sorted, so the rendered form is canonical.
fn canonical_items(items: &[Value]) -> Vec<String> {
    let mut rendered = items.iter().map(Value::to_string).collect::<Vec<_>>();
    rendered.sort();
    rendered
}

fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |version: &str| {
        version
            .split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect::<Vec<_>>()
    };
    let (mut left, mut right) = (parse(left), parse(right));
    let width = left.len().max(right.len());
    left.resize(width, 0);
    right.resize(width, 0);
    left.cmp(&right)
}
