use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::{BackendArgs, SharedBackend, backends};
use crate::cache::CacheSettings;
use crate::column::ColumnSalience;
use crate::error::KiraError;
use crate::item::DataQuality;
use crate::provenance::PROVENANCE_VERSION;

pub const DEFAULT_CONFIG: &str = "kira-ds.json";

/// Process-level settings handed to stores and the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub cache_root: Utf8PathBuf,
    pub race_condition_delay: Duration,
    pub max_wait_retries: u32,
    pub verify_checksums: bool,
    pub min_provenance_version: String,
}

impl Settings {
    pub fn new() -> Result<Self, KiraError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-dataset-store"))
                    .ok()
            })
            .ok_or_else(|| {
                KiraError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self::with_cache_root(cache_root))
    }

    pub fn with_cache_root(cache_root: Utf8PathBuf) -> Self {
        let defaults = CacheSettings::new(cache_root.clone());
        Self {
            cache_root,
            race_condition_delay: defaults.race_condition_delay,
            max_wait_retries: defaults.max_wait_retries,
            verify_checksums: defaults.verify_checksums,
            min_provenance_version: PROVENANCE_VERSION.to_string(),
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            root: self.cache_root.clone(),
            race_condition_delay: self.race_condition_delay,
            max_wait_retries: self.max_wait_retries,
            verify_checksums: self.verify_checksums,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub settings: SettingsEntry,
    pub store: StoreDefinition,
    pub dataset: DatasetDefinition,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct SettingsEntry {
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub race_condition_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_wait_retries: Option<u32>,
    #[serde(default)]
    pub verify_checksums: Option<bool>,
    #[serde(default)]
    pub min_provenance_version: Option<String>,
}

/// Store kind plus the parameters its factory reads.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct StoreDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetDefinition {
    pub id: String,
    #[serde(default = "default_dataset_name")]
    pub name: String,
    #[serde(default = "default_space")]
    pub space: String,
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub id_inference: Vec<InferenceEntry>,
    #[serde(default)]
    pub include: BTreeMap<String, CriterionEntry>,
    #[serde(default)]
    pub exclude: BTreeMap<String, CriterionEntry>,
    #[serde(default)]
    pub sources: Vec<ColumnEntry>,
    #[serde(default)]
    pub sinks: Vec<ColumnEntry>,
}

impl Default for DatasetDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_dataset_name(),
            space: default_space(),
            hierarchy: Vec::new(),
            id_inference: Vec::new(),
            include: BTreeMap::new(),
            exclude: BTreeMap::new(),
            sources: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

/// `"target=source::regex"` or `{"target": .., "expression": "source::regex"}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InferenceEntry {
    Shorthand(String),
    Detailed(InferenceEntryObject),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceEntryObject {
    pub target: String,
    pub expression: String,
}

impl InferenceEntry {
    /// Target frequency name and `source::regex` expression.
    pub fn split(&self) -> Result<(&str, &str), KiraError> {
        match self {
            InferenceEntry::Shorthand(value) => value.split_once('=').ok_or_else(|| {
                KiraError::ConfigParse(format!(
                    "id inference '{value}' must look like 'target=source::regex'"
                ))
            }),
            InferenceEntry::Detailed(obj) => Ok((obj.target.as_str(), obj.expression.as_str())),
        }
    }
}

/// A list of IDs, or a regex over IDs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CriterionEntry {
    Ids(Vec<String>),
    Pattern(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ColumnEntry {
    Shorthand(String),
    Detailed(ColumnEntryObject),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ColumnEntryObject {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub order: Option<usize>,
    #[serde(default)]
    pub quality_threshold: Option<DataQuality>,
    #[serde(default)]
    pub header_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub salience: Option<ColumnSalience>,
    #[serde(default)]
    pub pipeline: Option<String>,
}

impl ColumnEntry {
    pub fn detailed(&self) -> ColumnEntryObject {
        match self {
            ColumnEntry::Shorthand(name) => ColumnEntryObject {
                name: name.clone(),
                ..ColumnEntryObject::default()
            },
            ColumnEntry::Detailed(obj) => obj.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub settings: Settings,
    pub store: StoreDefinition,
    pub dataset: DatasetDefinition,
}

impl ResolvedConfig {
    pub fn open_backend(&self) -> Result<SharedBackend, KiraError> {
        let args = BackendArgs {
            settings: self.settings.clone(),
            params: Value::Object(self.store.params.clone()),
        };
        backends().create(&self.store.kind, &args)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if config.store.kind.is_empty() {
            return Err(KiraError::ConfigParse("store type is required".to_string()));
        }
        if config.dataset.id.is_empty() {
            return Err(KiraError::ConfigParse("dataset id is required".to_string()));
        }

        let entry = config.settings;
        let mut settings = match entry.cache_root {
            Some(root) => Settings::with_cache_root(Utf8PathBuf::from(root)),
            None => Settings::new()?,
        };
        if let Some(delay) = entry.race_condition_delay_ms {
            settings.race_condition_delay = Duration::from_millis(delay);
        }
        if let Some(retries) = entry.max_wait_retries {
            settings.max_wait_retries = retries;
        }
        if let Some(verify) = entry.verify_checksums {
            settings.verify_checksums = verify;
        }
        if let Some(version) = entry.min_provenance_version {
            settings.min_provenance_version = version;
        }

        Ok(ResolvedConfig {
            schema_version,
            settings,
            store: config.store,
            dataset: config.dataset,
        })
    }
}

pub fn default_dataset_name() -> String {
    "default".to_string()
}

pub fn default_space() -> String {
    "clinical".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_column_shorthand_and_detailed() {
        let json = r#"{
            "store": {"type": "dirtree", "root": "/data"},
            "settings": {"cache_root": "/tmp/kira-cache", "race_condition_delay_ms": 50},
            "dataset": {
                "id": "study",
                "hierarchy": ["subject", "session"],
                "id_inference": ["timepoint=session::\\d+_MR(\\d+)"],
                "include": {"subject": ["01", "02"]},
                "exclude": {"session": "^.*_bad$"},
                "sources": ["T1w", {"name": "dwi", "datatype": "nifti_gz_x", "order": 1}],
                "sinks": [{"name": "brain_mask", "salience": "qa"}]
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();

        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.store.kind, "dirtree");
        assert_eq!(resolved.store.params.get("root"), Some(&Value::from("/data")));
        assert_eq!(resolved.settings.race_condition_delay, Duration::from_millis(50));
        assert_eq!(resolved.settings.max_wait_retries, 20);

        let dataset = resolved.dataset;
        assert_eq!(dataset.name, "default");
        assert_eq!(dataset.space, "clinical");
        assert_eq!(dataset.sources[0].detailed().name, "T1w");
        assert_eq!(dataset.sources[1].detailed().order, Some(1));
        assert_eq!(dataset.sinks[0].detailed().salience, Some(ColumnSalience::Qa));
        assert_eq!(
            dataset.id_inference[0].split().unwrap(),
            ("timepoint", "session::\\d+_MR(\\d+)")
        );
        assert!(matches!(dataset.include.get("subject"), Some(CriterionEntry::Ids(_))));
        assert!(matches!(dataset.exclude.get("session"), Some(CriterionEntry::Pattern(_))));
    }

    #[test]
    fn missing_store_type_is_rejected() {
        let config = Config {
            dataset: DatasetDefinition {
                id: "study".to_string(),
                ..DatasetDefinition::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            ConfigLoader::resolve_config(config),
            Err(KiraError::ConfigParse(_))
        ));
    }
}
