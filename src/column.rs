//! Column definitions and the selection of a row's item for a column.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datatype::Datatype;
use crate::error::KiraError;
use crate::item::{DataItem, DataQuality, Item};
use crate::space::Frequency;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnSalience {
    Primary,
    Publication,
    #[default]
    Supplementary,
    Qa,
    Debug,
    Temp,
}

impl fmt::Display for ColumnSalience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnSalience::Primary => "primary",
            ColumnSalience::Publication => "publication",
            ColumnSalience::Supplementary => "supplementary",
            ColumnSalience::Qa => "qa",
            ColumnSalience::Debug => "debug",
            ColumnSalience::Temp => "temp",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ColumnSalience {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "primary" => Ok(ColumnSalience::Primary),
            "publication" => Ok(ColumnSalience::Publication),
            "supplementary" => Ok(ColumnSalience::Supplementary),
            "qa" => Ok(ColumnSalience::Qa),
            "debug" => Ok(ColumnSalience::Debug),
            "temp" => Ok(ColumnSalience::Temp),
            _ => Err(KiraError::InvalidValue {
                kind: "column salience".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Selects existing data for each row of its frequency.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub name: String,
    pub path: String,
    pub datatype: Datatype,
    pub frequency: Frequency,
    pub quality_threshold: DataQuality,
    /// Position among the remaining candidates, counted from zero.
    pub order: Option<usize>,
    pub header_values: BTreeMap<String, Value>,
    pub is_regex: bool,
    pattern: Option<Regex>,
}

impl DataSource {
    pub fn new(name: &str, path: &str, datatype: Datatype, frequency: Frequency) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            datatype,
            frequency,
            quality_threshold: DataQuality::Usable,
            order: None,
            header_values: BTreeMap::new(),
            is_regex: false,
            pattern: None,
        }
    }

    /// A source whose path is a regular expression. It must match whole
    /// item paths unless it already ends in `$`.
    pub fn regex(
        name: &str,
        pattern: &str,
        datatype: Datatype,
        frequency: Frequency,
    ) -> Result<Self, KiraError> {
        let anchored = if pattern.ends_with('$') {
            format!("^(?:{pattern})")
        } else {
            format!("^(?:{pattern})$")
        };
        let compiled = Regex::new(&anchored).map_err(|err| KiraError::InvalidPattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?;
        let mut source = Self::new(name, pattern, datatype, frequency);
        source.is_regex = true;
        source.pattern = Some(compiled);
        Ok(source)
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_quality_threshold(mut self, threshold: DataQuality) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_header_value(mut self, key: &str, value: Value) -> Self {
        self.header_values.insert(key.to_string(), value);
        self
    }

    /// Picks this column's item out of a row's discovered items. `row`
    /// describes the row in error messages.
    pub fn match_items(&self, items: &[&Item], row: &str) -> Result<Item, KiraError> {
        let mut candidates = items
            .iter()
            .filter_map(|item| self.datatype.resolve(item))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(KiraError::NoCandidates {
                column: self.name.clone(),
                row: row.to_string(),
                datatype: self.datatype.name.clone(),
                found: items.iter().map(|item| item.summary()).collect(),
            });
        }

        candidates = match &self.pattern {
            Some(pattern) => self.narrow(
                candidates,
                &format!("with a path matching '{}'", self.path),
                row,
                |item| pattern.is_match(item.path()),
            )?,
            None => self.narrow(
                candidates,
                &format!("with the path '{}'", self.path),
                row,
                |item| item.path() == self.path,
            )?,
        };
        candidates = self.narrow(
            candidates,
            &format!("with quality of at least '{}'", self.quality_threshold),
            row,
            |item| item.meta().quality >= self.quality_threshold,
        )?;
        for (key, expected) in &self.header_values {
            candidates = self.narrow(
                candidates,
                &format!("with the header value {key}={expected}"),
                row,
                |item| {
                    item.meta()
                        .header
                        .get(key)
                        .is_some_and(|actual| header_matches(actual, expected))
                },
            )?;
        }

        match self.order {
            Some(order) => {
                if order >= candidates.len() {
                    return Err(KiraError::IndexOutOfRange {
                        column: self.name.clone(),
                        row: row.to_string(),
                        order,
                        candidates: candidates.iter().map(Item::summary).collect(),
                    });
                }
                Ok(candidates.swap_remove(order))
            }
            None if candidates.len() > 1 => Err(KiraError::AmbiguousMatch {
                column: self.name.clone(),
                row: row.to_string(),
                matches: candidates.iter().map(Item::summary).collect(),
            }),
            None => Ok(candidates.remove(0)),
        }
    }

    /// Keeps the candidates passing `keep`, failing if none would remain.
    fn narrow<F>(
        &self,
        candidates: Vec<Item>,
        criterion: &str,
        row: &str,
        keep: F,
    ) -> Result<Vec<Item>, KiraError>
    where
        F: Fn(&Item) -> bool,
    {
        if !candidates.iter().any(&keep) {
            return Err(KiraError::NoMatch {
                column: self.name.clone(),
                row: row.to_string(),
                criterion: criterion.to_string(),
                candidates: candidates.iter().map(Item::summary).collect(),
            });
        }
        Ok(candidates.into_iter().filter(|item| keep(item)).collect())
    }
}

fn header_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    let render = |value: &Value| match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    render(actual) == render(expected)
}

/// Receives derived data for each row of its frequency.
#[derive(Debug, Clone)]
pub struct DataSink {
    pub name: String,
    pub path: String,
    pub datatype: Datatype,
    pub frequency: Frequency,
    pub salience: ColumnSalience,
    pub pipeline_name: Option<String>,
}

impl DataSink {
    pub fn new(name: &str, datatype: Datatype, frequency: Frequency) -> Self {
        Self {
            name: name.to_string(),
            path: name.to_string(),
            datatype,
            frequency,
            salience: ColumnSalience::default(),
            pipeline_name: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_salience(mut self, salience: ColumnSalience) -> Self {
        self.salience = salience;
        self
    }

    pub fn with_pipeline(mut self, pipeline: &str) -> Self {
        self.pipeline_name = Some(pipeline.to_string());
        self
    }

    /// The stored item at this sink's path, or a placeholder to be filled by
    /// whatever derives it.
    pub fn match_items(&self, items: &[&Item], row: &str) -> Result<Item, KiraError> {
        let mut matches = items
            .iter()
            .filter(|item| item.path() == self.path)
            .filter_map(|item| self.datatype.resolve(item))
            .collect::<Vec<_>>();
        match matches.len() {
            0 => Ok(Item::placeholder(
                &self.path,
                &self.datatype.name,
                self.datatype.is_field(),
            )),
            1 => Ok(matches.remove(0)),
            _ => Err(KiraError::AmbiguousMatch {
                column: self.name.clone(),
                row: row.to_string(),
                matches: matches.iter().map(Item::summary).collect(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Column {
    Source(DataSource),
    Sink(DataSink),
}

impl Column {
    pub fn name(&self) -> &str {
        match self {
            Column::Source(source) => &source.name,
            Column::Sink(sink) => &sink.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Column::Source(source) => &source.path,
            Column::Sink(sink) => &sink.path,
        }
    }

    pub fn datatype(&self) -> &Datatype {
        match self {
            Column::Source(source) => &source.datatype,
            Column::Sink(sink) => &sink.datatype,
        }
    }

    pub fn frequency(&self) -> Frequency {
        match self {
            Column::Source(source) => source.frequency,
            Column::Sink(sink) => sink.frequency,
        }
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, Column::Sink(_))
    }

    pub fn match_items(&self, items: &[&Item], row: &str) -> Result<Item, KiraError> {
        match self {
            Column::Source(source) => source.match_items(items, row),
            Column::Sink(sink) => sink.match_items(items, row),
        }
    }
}
