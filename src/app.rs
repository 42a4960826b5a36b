use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::CacheManager;
use crate::config::{ResolvedConfig, Settings};
use crate::dataset::Dataset;
use crate::error::KiraError;
use crate::item::{DataItem, Item};
use crate::provenance::{Change, Provenance};

#[derive(Debug, Clone, Serialize)]
pub struct RowsResult {
    pub dataset: String,
    pub frequency: String,
    pub rows: Vec<RowEntry>,
    pub rejected: Vec<RejectedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowEntry {
    pub id: Option<String>,
    pub ids: BTreeMap<String, String>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub column: String,
    pub matched: usize,
    pub failed: usize,
    pub rows: Vec<MatchEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchEntry {
    pub row: String,
    pub id: Option<String>,
    pub item: Option<String>,
    pub exists: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetResult {
    pub column: String,
    pub row: String,
    pub locations: Vec<String>,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvDiffResult {
    pub identical: bool,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
    pub cache_root: String,
}

/// Runs the commands of the `kira-ds` binary.
#[derive(Debug)]
pub struct App {
    settings: Settings,
    dataset: Option<Dataset>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            dataset: None,
        }
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, KiraError> {
        let backend = config.open_backend()?;
        let dataset = Dataset::from_definition(&config.dataset, backend)?;
        Ok(Self::new(config.settings.clone()).with_dataset(dataset))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn dataset(&mut self) -> Result<&mut Dataset, KiraError> {
        self.dataset.as_mut().ok_or(KiraError::MissingConfig)
    }

    /// Rows of `frequency`, the leaf frequency when not given.
    pub fn rows(&mut self, frequency: Option<&str>) -> Result<RowsResult, KiraError> {
        let dataset = self.dataset()?;
        let frequency = match frequency {
            Some(name) => dataset.frequency(name)?,
            None => dataset.space().leaf(),
        };
        let indices = dataset.rows(frequency)?;

        let mut rows = Vec::with_capacity(indices.len());
        for index in indices {
            let row = dataset.tree().row(index);
            let ids = row
                .ids()
                .iter()
                .map(|(freq, id)| (dataset.space().label(freq), id.to_string()))
                .collect();
            rows.push(RowEntry {
                id: row.id().map(str::to_string),
                ids,
                path: dataset.context(index).relative_path()?,
            });
        }
        let rejected = dataset
            .rejected_rows()
            .iter()
            .map(|rejected| RejectedEntry {
                path: rejected.path.join("/"),
                reason: rejected.reason.clone(),
            })
            .collect();

        Ok(RowsResult {
            dataset: dataset.id().to_string(),
            frequency: dataset.space().label(frequency),
            rows,
            rejected,
        })
    }

    /// Matches `column` in every row of its frequency. Failed rows are
    /// reported rather than aborting the listing.
    pub fn match_column(&mut self, column: &str) -> Result<MatchResult, KiraError> {
        let dataset = self.dataset()?;
        let frequency = dataset.column(column)?.frequency();
        let mut rows = Vec::new();
        for index in dataset.rows(frequency)? {
            let row = dataset.describe_row(index);
            let id = dataset.tree().row(index).id().map(str::to_string);
            let entry = match dataset.item(index, column) {
                Ok(item) => MatchEntry {
                    row,
                    id,
                    item: Some(item.summary()),
                    exists: item.exists(),
                    error: None,
                },
                Err(err) => {
                    debug!(column, "match failed: {err}");
                    MatchEntry {
                        row,
                        id,
                        item: None,
                        exists: false,
                        error: Some(err.to_string()),
                    }
                }
            };
            rows.push(entry);
        }
        let failed = rows.iter().filter(|entry| entry.error.is_some()).count();
        Ok(MatchResult {
            column: column.to_string(),
            matched: rows.len() - failed,
            failed,
            rows,
        })
    }

    /// Fetches the column's item of the row with ID `id`.
    pub fn get(&mut self, column: &str, id: Option<&str>) -> Result<GetResult, KiraError> {
        let dataset = self.dataset()?;
        let frequency = dataset.column(column)?.frequency();
        let index = dataset.row(frequency, id)?;
        let row = dataset.describe_row(index);
        let is_field = matches!(dataset.item(index, column)?, Item::Field(_));
        if is_field {
            let value = dataset.get_field_value(index, column)?;
            return Ok(GetResult {
                column: column.to_string(),
                row,
                locations: Vec::new(),
                value,
            });
        }
        let locations = dataset
            .get_item_locations(index, column)?
            .into_iter()
            .map(|path| path.to_string())
            .collect();
        Ok(GetResult {
            column: column.to_string(),
            row,
            locations,
            value: None,
        })
    }

    /// Compares two saved provenance records.
    pub fn prov_diff(
        &self,
        recorded: &Utf8Path,
        expected: &Utf8Path,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<ProvDiffResult, KiraError> {
        let minimum = &self.settings.min_provenance_version;
        let recorded = Provenance::load(recorded, minimum)?;
        let expected = Provenance::load(expected, minimum)?;
        let diff = recorded.mismatches(&expected, include, exclude)?;
        Ok(ProvDiffResult {
            identical: diff.is_empty(),
            changes: diff.changes,
        })
    }

    pub fn clear_cache(&self) -> Result<ClearResult, KiraError> {
        let cache = CacheManager::new(self.settings.cache_settings());
        cache.clear()?;
        Ok(ClearResult {
            cleared: true,
            cache_root: cache.root().to_string(),
        })
    }
}
