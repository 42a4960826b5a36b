//! A dataset: rows discovered from a store plus the columns read from and
//! written to them.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{Backend, RowContext, SharedBackend, StoredItem};
use crate::column::{Column, DataSink, DataSource};
use crate::config::{ColumnEntry, CriterionEntry, DatasetDefinition};
use crate::datatype::lookup;
use crate::error::KiraError;
use crate::ids::InferenceRule;
use crate::item::{DataItem, Field, FileGroup, Item};
use crate::provenance::Provenance;
use crate::space::{DataSpace, Frequency, Hierarchy, spaces};
use crate::tree::{Criterion, DataTree, RejectedRow, RowIndex, TreeLayout, TreeState};

#[derive(Debug)]
pub struct Dataset {
    id: String,
    name: String,
    backend: SharedBackend,
    columns: BTreeMap<String, Column>,
    tree: DataTree,
}

impl Dataset {
    pub fn new(id: &str, name: &str, backend: SharedBackend, layout: TreeLayout) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            backend,
            columns: BTreeMap::new(),
            tree: DataTree::new(layout),
        }
    }

    /// Builds a dataset from its serialized definition.
    pub fn from_definition(
        definition: &DatasetDefinition,
        backend: SharedBackend,
    ) -> Result<Self, KiraError> {
        let space = spaces().create(&definition.space, &())?;
        let hierarchy = Hierarchy::new(&space, definition.hierarchy.as_slice())?;
        let rules = definition
            .id_inference
            .iter()
            .map(|entry| {
                let (target, expression) = entry.split()?;
                InferenceRule::parse(&space, target, expression)
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let mut layout = TreeLayout::new(space.clone(), hierarchy).with_rules(rules);
        for (frequency, entry) in &definition.include {
            layout = layout.include(space.frequency(frequency)?, criterion(entry)?);
        }
        for (frequency, entry) in &definition.exclude {
            layout = layout.exclude(space.frequency(frequency)?, criterion(entry)?);
        }

        let mut dataset = Self::new(&definition.id, &definition.name, backend, layout);
        for entry in &definition.sources {
            dataset.add_source(source_from_entry(&space, entry)?, false)?;
        }
        for entry in &definition.sinks {
            dataset.add_sink(sink_from_entry(&space, entry)?, false)?;
        }
        Ok(dataset)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn space(&self) -> &DataSpace {
        self.tree.space()
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        self.tree.hierarchy()
    }

    pub fn tree(&self) -> &DataTree {
        &self.tree
    }

    /// Resolves a frequency name of the dataset's space.
    pub fn frequency(&self, name: &str) -> Result<Frequency, KiraError> {
        self.space().frequency(name)
    }

    pub fn add_source(&mut self, source: DataSource, overwrite: bool) -> Result<(), KiraError> {
        self.add_column(Column::Source(source), overwrite)
    }

    pub fn add_sink(&mut self, sink: DataSink, overwrite: bool) -> Result<(), KiraError> {
        self.add_column(Column::Sink(sink), overwrite)
    }

    fn add_column(&mut self, column: Column, overwrite: bool) -> Result<(), KiraError> {
        let name = column.name().to_string();
        if !self.space().contains(column.frequency()) {
            return Err(KiraError::UnknownAxis {
                space: self.space().name().to_string(),
                axis: column.frequency().to_string(),
            });
        }
        if self.columns.contains_key(&name) {
            if !overwrite {
                return Err(KiraError::ColumnNameClash(name));
            }
            self.tree.clear_resolved(&name);
        }
        debug!(column = %name, "added column");
        self.columns.insert(name, column);
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<Column, KiraError> {
        let column = self
            .columns
            .remove(name)
            .ok_or_else(|| KiraError::UnknownColumn(name.to_string()))?;
        self.tree.clear_resolved(name);
        Ok(column)
    }

    pub fn column(&self, name: &str) -> Result<&Column, KiraError> {
        self.columns
            .get(name)
            .ok_or_else(|| KiraError::UnknownColumn(name.to_string()))
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.values()
    }

    /// Discovers the rows of the dataset unless that has already happened.
    pub fn populate(&mut self) -> Result<(), KiraError> {
        if self.tree.state() == TreeState::Populated {
            return Ok(());
        }
        self.tree.begin_discovery();
        if let Err(err) = self.backend.find_rows(&self.id, &mut self.tree) {
            self.tree.reset();
            return Err(err);
        }
        self.tree.finish_discovery();
        for rejected in self.tree.rejected() {
            warn!(
                dataset = %self.id,
                path = %rejected.path.join("/"),
                "skipping row: {}",
                rejected.reason
            );
        }
        info!(
            dataset = %self.id,
            store = %self.backend.name(),
            rows = self.tree.rows(self.space().leaf()).len(),
            "discovered dataset rows"
        );
        Ok(())
    }

    /// Drops every discovered row and item and discovers them again.
    pub fn refresh(&mut self) -> Result<(), KiraError> {
        self.tree.reset();
        self.populate()
    }

    pub fn state(&self) -> TreeState {
        self.tree.state()
    }

    pub fn row(&mut self, frequency: Frequency, id: Option<&str>) -> Result<RowIndex, KiraError> {
        self.populate()?;
        self.tree.find(frequency, id)
    }

    pub fn rows(&mut self, frequency: Frequency) -> Result<Vec<RowIndex>, KiraError> {
        self.populate()?;
        Ok(self.tree.rows(frequency))
    }

    pub fn row_ids(&mut self, frequency: Frequency) -> Result<Vec<Option<String>>, KiraError> {
        self.populate()?;
        Ok(self.tree.row_ids(frequency))
    }

    pub fn rejected_rows(&self) -> &[RejectedRow] {
        self.tree.rejected()
    }

    pub fn describe_row(&self, row: RowIndex) -> String {
        self.tree.describe_row(row)
    }

    pub fn context(&self, row: RowIndex) -> RowContext<'_> {
        RowContext::new(&self.id, &self.tree, row)
    }

    /// Unresolved items stored in a row, listed on first use.
    pub fn entries(&mut self, row: RowIndex) -> Result<Vec<&Item>, KiraError> {
        self.populate()?;
        load_entries(self.backend.as_ref(), &self.id, &mut self.tree, row)?;
        Ok(self.tree.entries(row).unwrap_or_default())
    }

    /// The item `column` selects in `row`, matched on first use.
    pub fn item(&mut self, row: RowIndex, column: &str) -> Result<&Item, KiraError> {
        self.populate()?;
        let col = self
            .columns
            .get(column)
            .ok_or_else(|| KiraError::UnknownColumn(column.to_string()))?;
        if self.tree.row(row).frequency() != col.frequency() {
            return Err(KiraError::WrongFrequency {
                column: column.to_string(),
                expected: self.tree.space().label(col.frequency()),
                row: self.tree.describe_row(row),
            });
        }
        if self.tree.resolved(row, column).is_none() {
            load_entries(self.backend.as_ref(), &self.id, &mut self.tree, row)?;
            let matched = {
                let items = self.tree.entries(row).unwrap_or_default();
                col.match_items(&items, &self.tree.describe_row(row))?
            };
            self.tree.set_resolved(row, column, matched);
        }
        self.tree
            .resolved(row, column)
            .ok_or_else(|| KiraError::MissingData(format!("'{column}' in {}", self.tree.describe_row(row))))
    }

    pub fn get_item_locations(
        &mut self,
        row: RowIndex,
        column: &str,
    ) -> Result<Vec<Utf8PathBuf>, KiraError> {
        let group = self.file_group(row, column)?;
        if !group.meta.exists {
            return Err(KiraError::MissingData(format!(
                "'{column}' in {}",
                self.describe_row(row)
            )));
        }
        self.backend.get_item_locations(&self.context(row), &group)
    }

    pub fn get_field_value(
        &mut self,
        row: RowIndex,
        column: &str,
    ) -> Result<Option<Value>, KiraError> {
        let field = self.field(row, column)?;
        if !field.meta.exists {
            return Ok(None);
        }
        self.backend.get_field_value(&self.context(row), &field)
    }

    /// Stores `sources` as the sink's item in `row`; provenance, if any, is
    /// written once the data is stored.
    pub fn put_item(
        &mut self,
        row: RowIndex,
        column: &str,
        sources: &[Utf8PathBuf],
        provenance: Option<&Provenance>,
    ) -> Result<StoredItem, KiraError> {
        self.require_sink(column)?;
        let mut group = self.file_group(row, column)?;
        if !group.meta.exists {
            group.is_dir = sources.len() == 1 && sources[0].as_std_path().is_dir();
        }
        let stored = {
            let context = self.context(row);
            let stored = self
                .backend
                .put_item_locations(&context, &group, sources)?;
            if let Some(provenance) = provenance {
                let mut written = Item::FileGroup(FileGroup {
                    files: stored.locations.clone(),
                    ..group
                });
                written.meta_mut().uri = stored.uri.clone();
                self.backend.put_provenance(&context, &written, provenance)?;
            }
            stored
        };
        self.tree.clear_entries(row);
        Ok(stored)
    }

    pub fn put_field(
        &mut self,
        row: RowIndex,
        column: &str,
        value: Value,
        provenance: Option<&Provenance>,
    ) -> Result<(), KiraError> {
        self.require_sink(column)?;
        let field = self.field(row, column)?;
        let datatype = self.column(column)?.datatype().clone();
        let candidate = Item::Field(Field::new(field.meta.path.clone(), Some(value.clone())));
        let coerced = datatype
            .resolve(&candidate)
            .and_then(|item| item.as_field().and_then(|field| field.value.clone()))
            .ok_or_else(|| KiraError::InvalidValue {
                kind: datatype.name.clone(),
                value: value.to_string(),
            })?;
        {
            let context = self.context(row);
            self.backend
                .put_field_value(&context, &field, coerced.clone())?;
            if let Some(provenance) = provenance {
                let written = Item::Field(Field::new(field.meta.path.clone(), Some(coerced)));
                self.backend.put_provenance(&context, &written, provenance)?;
            }
        }
        self.tree.clear_entries(row);
        Ok(())
    }

    /// Provenance recorded with the column's item in `row`, if it was derived.
    pub fn provenance(
        &mut self,
        row: RowIndex,
        column: &str,
    ) -> Result<Option<Provenance>, KiraError> {
        let item = self.item(row, column)?.clone();
        if !item.exists() {
            return Ok(None);
        }
        self.backend.get_provenance(&self.context(row), &item)
    }

    /// Whether the item must be derived again to match `expected`. Items
    /// without provenance are always stale.
    pub fn is_stale(
        &mut self,
        row: RowIndex,
        column: &str,
        expected: &Provenance,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<bool, KiraError> {
        match self.provenance(row, column)? {
            None => Ok(true),
            Some(recorded) => {
                let diff = recorded.mismatches(expected, include, exclude)?;
                if !diff.is_empty() {
                    debug!(
                        column,
                        row = %self.describe_row(row),
                        changed = %diff.paths().join(", "),
                        "provenance differs"
                    );
                }
                Ok(!diff.is_empty())
            }
        }
    }

    fn require_sink(&self, column: &str) -> Result<(), KiraError> {
        if self.column(column)?.is_sink() {
            Ok(())
        } else {
            Err(KiraError::NotASink(column.to_string()))
        }
    }

    fn file_group(&mut self, row: RowIndex, column: &str) -> Result<FileGroup, KiraError> {
        match self.item(row, column)? {
            Item::FileGroup(group) => Ok(group.clone()),
            Item::Field(_) => Err(KiraError::InvalidValue {
                kind: "file-group column".to_string(),
                value: column.to_string(),
            }),
        }
    }

    fn field(&mut self, row: RowIndex, column: &str) -> Result<Field, KiraError> {
        match self.item(row, column)? {
            Item::Field(field) => Ok(field.clone()),
            Item::FileGroup(_) => Err(KiraError::InvalidValue {
                kind: "field column".to_string(),
                value: column.to_string(),
            }),
        }
    }
}

fn load_entries(
    backend: &dyn Backend,
    dataset_id: &str,
    tree: &mut DataTree,
    row: RowIndex,
) -> Result<(), KiraError> {
    if tree.row(row).has_entries() {
        return Ok(());
    }
    let items = backend.find_items(&RowContext::new(dataset_id, tree, row))?;
    debug!(row = %tree.describe_row(row), items = items.len(), "listed row items");
    tree.set_entries(row, items);
    Ok(())
}

fn criterion(entry: &CriterionEntry) -> Result<Criterion, KiraError> {
    match entry {
        CriterionEntry::Ids(ids) => Ok(Criterion::Ids(ids.clone())),
        CriterionEntry::Pattern(pattern) => Criterion::pattern(pattern),
    }
}

fn entry_frequency(space: &DataSpace, frequency: Option<&str>) -> Result<Frequency, KiraError> {
    match frequency {
        Some(name) => space.frequency(name),
        None => Ok(space.leaf()),
    }
}

fn source_from_entry(space: &DataSpace, entry: &ColumnEntry) -> Result<DataSource, KiraError> {
    let obj = entry.detailed();
    let path = obj.path.clone().unwrap_or_else(|| obj.name.clone());
    let datatype = lookup(obj.datatype.as_deref().unwrap_or("fileset"))?;
    let frequency = entry_frequency(space, obj.frequency.as_deref())?;
    let mut source = if obj.is_regex {
        DataSource::regex(&obj.name, &path, datatype, frequency)?
    } else {
        DataSource::new(&obj.name, &path, datatype, frequency)
    };
    if let Some(order) = obj.order {
        source = source.with_order(order);
    }
    if let Some(threshold) = obj.quality_threshold {
        source = source.with_quality_threshold(threshold);
    }
    for (key, value) in obj.header_values {
        source = source.with_header_value(&key, value);
    }
    Ok(source)
}

fn sink_from_entry(space: &DataSpace, entry: &ColumnEntry) -> Result<DataSink, KiraError> {
    let obj = entry.detailed();
    let datatype = lookup(obj.datatype.as_deref().unwrap_or("fileset"))?;
    let frequency = entry_frequency(space, obj.frequency.as_deref())?;
    let mut sink = DataSink::new(&obj.name, datatype, frequency);
    if let Some(path) = &obj.path {
        sink = sink.with_path(path);
    }
    if let Some(salience) = obj.salience {
        sink = sink.with_salience(salience);
    }
    if let Some(pipeline) = &obj.pipeline {
        sink = sink.with_pipeline(pipeline);
    }
    Ok(sink)
}
