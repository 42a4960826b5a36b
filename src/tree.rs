//! The in-memory data tree of a dataset.
//!
//! Rows and items live in arenas owned by [`DataTree`]; rows refer to their
//! children and items by index. Leaves are added one at a time from the
//! labels found at the bottom of the store's hierarchy, and every summary row
//! above a leaf is created on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;
use tracing::{debug, warn};

use crate::codec::check_identifier;
use crate::error::KiraError;
use crate::ids::{IdentifierMap, InferenceRule, Resolution, resolve};
use crate::item::Item;
use crate::space::{DataSpace, Frequency, Hierarchy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowIndex(usize);

impl RowIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemIndex(usize);

impl ItemIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Children and index entries are keyed by row ID, which is absent for rows
/// of frequencies the data does not distinguish (e.g. `group` without groups).
type RowKey = Option<String>;

#[derive(Debug, Clone)]
pub struct Row {
    index: RowIndex,
    frequency: Frequency,
    ids: IdentifierMap,
    children: BTreeMap<Frequency, BTreeMap<RowKey, RowIndex>>,
    entries: Option<Vec<ItemIndex>>,
    resolved: BTreeMap<String, ItemIndex>,
}

impl Row {
    pub fn index(&self) -> RowIndex {
        self.index
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn ids(&self) -> &IdentifierMap {
        &self.ids
    }

    pub fn id(&self) -> Option<&str> {
        self.ids.get(self.frequency)
    }

    pub fn children(&self, frequency: Frequency) -> Vec<RowIndex> {
        self.children
            .get(&frequency)
            .map(|children| children.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_entries(&self) -> bool {
        self.entries.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum Criterion {
    Ids(Vec<String>),
    Pattern(Regex),
}

impl Criterion {
    /// Regex criteria match from the start of the ID.
    pub fn pattern(pattern: &str) -> Result<Self, KiraError> {
        Regex::new(&format!("^(?:{pattern})"))
            .map(Criterion::Pattern)
            .map_err(|err| KiraError::InvalidPattern {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })
    }

    pub fn matches(&self, id: &str) -> bool {
        match self {
            Criterion::Ids(ids) => ids.iter().any(|candidate| candidate == id),
            Criterion::Pattern(re) => re.is_match(id),
        }
    }
}

/// How rows of a dataset are laid out and which of them take part.
#[derive(Debug, Clone)]
pub struct TreeLayout {
    pub space: DataSpace,
    pub hierarchy: Hierarchy,
    pub rules: Vec<InferenceRule>,
    pub include: BTreeMap<Frequency, Criterion>,
    pub exclude: BTreeMap<Frequency, Criterion>,
}

impl TreeLayout {
    pub fn new(space: DataSpace, hierarchy: Hierarchy) -> Self {
        Self {
            space,
            hierarchy,
            rules: Vec::new(),
            include: BTreeMap::new(),
            exclude: BTreeMap::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<InferenceRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn include(mut self, frequency: Frequency, criterion: Criterion) -> Self {
        self.include.insert(frequency, criterion);
        self
    }

    pub fn exclude(mut self, frequency: Frequency, criterion: Criterion) -> Self {
        self.exclude.insert(frequency, criterion);
        self
    }

    fn is_selected(&self, ids: &IdentifierMap) -> bool {
        for (frequency, criterion) in &self.include {
            if let Some(id) = ids.get(*frequency) {
                if !criterion.matches(id) {
                    return false;
                }
            }
        }
        for (frequency, criterion) in &self.exclude {
            if let Some(id) = ids.get(*frequency) {
                if criterion.matches(id) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Unpopulated,
    Discovering,
    Populated,
}

impl fmt::Display for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeState::Unpopulated => write!(f, "unpopulated"),
            TreeState::Discovering => write!(f, "discovering"),
            TreeState::Populated => write!(f, "populated"),
        }
    }
}

/// A leaf skipped because an inference rule did not match its IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub path: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct DataTree {
    layout: TreeLayout,
    state: TreeState,
    rows: Vec<Row>,
    items: Vec<Item>,
    index: BTreeMap<Frequency, BTreeMap<RowKey, RowIndex>>,
    auto_ids: BTreeMap<Vec<String>, BTreeMap<String, String>>,
    rejected: Vec<RejectedRow>,
}

impl DataTree {
    pub fn new(layout: TreeLayout) -> Self {
        Self {
            layout,
            state: TreeState::Unpopulated,
            rows: Vec::new(),
            items: Vec::new(),
            index: BTreeMap::new(),
            auto_ids: BTreeMap::new(),
            rejected: Vec::new(),
        }
    }

    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    pub fn space(&self) -> &DataSpace {
        &self.layout.space
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.layout.hierarchy
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    /// Drops all rows and items; the next access discovers them again.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.items.clear();
        self.index.clear();
        self.auto_ids.clear();
        self.rejected.clear();
        self.state = TreeState::Unpopulated;
    }

    pub fn begin_discovery(&mut self) {
        self.reset();
        self.state = TreeState::Discovering;
        self.ensure_root();
    }

    pub fn finish_discovery(&mut self) {
        self.state = TreeState::Populated;
    }

    fn ensure_root(&mut self) {
        if !self.rows.is_empty() {
            return;
        }
        self.rows.push(Row {
            index: RowIndex(0),
            frequency: Frequency::ROOT,
            ids: IdentifierMap::new(),
            children: BTreeMap::new(),
            entries: None,
            resolved: BTreeMap::new(),
        });
        self.index
            .entry(Frequency::ROOT)
            .or_default()
            .insert(None, RowIndex(0));
    }

    pub fn root(&self) -> RowIndex {
        RowIndex(0)
    }

    /// Adds the leaf found at `tree_path` (one label per hierarchy layer) and
    /// all summary rows above it. Returns `None` if the leaf was rejected or
    /// filtered out.
    pub fn add_leaf<S: AsRef<str>>(
        &mut self,
        tree_path: &[S],
    ) -> Result<Option<RowIndex>, KiraError> {
        self.ensure_root();
        let labels = tree_path
            .iter()
            .map(|label| label.as_ref().to_string())
            .collect::<Vec<_>>();
        let layers = self.layout.hierarchy.layers().to_vec();
        if labels.len() != layers.len() {
            return Err(KiraError::DataTreeConstruction(format!(
                "tree path [{}] should have one label per layer of [{}]",
                labels.join(", "),
                self.layout.hierarchy.describe(&self.layout.space)
            )));
        }
        for label in &labels {
            check_identifier(label)?;
        }

        let explicit = layers
            .iter()
            .copied()
            .zip(labels.iter().cloned())
            .collect::<IdentifierMap>();
        let mut ids = match resolve(&self.layout.rules, &explicit) {
            Resolution::Resolved(ids) => ids,
            Resolution::Rejected { rule, source_id } => {
                let reason = format!("'{source_id}' does not match the inference rule {rule}");
                warn!(path = %labels.join("/"), "rejecting row: {reason}");
                self.rejected.push(RejectedRow {
                    path: labels,
                    reason,
                });
                return Ok(None);
            }
        };

        // Axes known to have no ID in this dataset.
        let mut absent = BTreeSet::new();
        let mut accounted = Frequency::ROOT;
        for (depth, layer) in layers.iter().copied().enumerate() {
            let previous = layer.common(accounted);
            let new = layer.difference(accounted);
            let span = layer.axes();
            let unresolved = span
                .iter()
                .copied()
                .filter(|axis| !ids.contains(*axis) && !absent.contains(axis))
                .collect::<Vec<_>>();
            if let Some((last, others)) = unresolved.split_last() {
                absent.extend(others.iter().copied());
                let assumed = if previous.is_root() && unresolved.len() == span.len() {
                    labels[depth].clone()
                } else {
                    let mut node_path = labels[..depth].to_vec();
                    node_path.extend(
                        new.axes()
                            .into_iter()
                            .filter_map(|axis| ids.get(axis).map(str::to_string)),
                    );
                    let assigned = self.auto_ids.entry(node_path).or_default();
                    let next = (assigned.len() + 1).to_string();
                    assigned
                        .entry(labels[depth].clone())
                        .or_insert(next)
                        .clone()
                };
                ids.insert(*last, assumed);
            }
            accounted = accounted | layer;
        }

        let composites = self
            .layout
            .space
            .frequencies()
            .map(|(_, freq)| freq)
            .filter(|freq| !freq.is_root() && !freq.is_basis() && !ids.contains(*freq))
            .collect::<Vec<_>>();
        for freq in composites {
            if let Some(id) = ids.compose(freq) {
                ids.insert(freq, id);
            }
        }

        if !self.layout.is_selected(&ids) {
            debug!(path = %labels.join("/"), "row excluded by dataset criteria");
            return Ok(None);
        }
        let leaf = self.layout.space.leaf();
        self.add_row(ids, leaf).map(Some)
    }

    /// Inserts a row and links it to its summary rows, creating those that
    /// do not exist yet.
    pub fn add_row(
        &mut self,
        ids: IdentifierMap,
        frequency: Frequency,
    ) -> Result<RowIndex, KiraError> {
        self.ensure_root();
        let key = ids.get(frequency).map(str::to_string);
        if let Some(existing) = self
            .index
            .get(&frequency)
            .and_then(|rows| rows.get(&key))
        {
            return Err(KiraError::DuplicateRow {
                frequency: self.layout.space.label(frequency),
                id: key.unwrap_or_else(|| "<none>".to_string()),
                existing: self.rows[existing.0].ids.describe(&self.layout.space),
                added: ids.describe(&self.layout.space),
            });
        }
        let index = RowIndex(self.rows.len());
        self.rows.push(Row {
            index,
            frequency,
            ids: ids.clone(),
            children: BTreeMap::new(),
            entries: None,
            resolved: BTreeMap::new(),
        });
        self.index
            .entry(frequency)
            .or_default()
            .insert(key, index);

        let parents = self
            .layout
            .space
            .frequencies()
            .map(|(_, freq)| freq)
            .filter(|freq| !freq.is_root() && freq.is_parent(frequency))
            .collect::<Vec<_>>();
        for parent_freq in parents {
            let parent_key = ids.get(parent_freq).map(str::to_string);
            let existing = self
                .index
                .get(&parent_freq)
                .and_then(|rows| rows.get(&parent_key))
                .copied();
            let parent = match existing {
                Some(parent) => parent,
                None => self.add_row(ids.restrict(parent_freq), parent_freq)?,
            };
            let link = ids.compose(frequency.difference(parent_freq));
            let clash = self.rows[parent.0]
                .children
                .get(&frequency)
                .and_then(|children| children.get(&link))
                .copied();
            if let Some(clash) = clash {
                return Err(KiraError::DataTreeConstruction(format!(
                    "ID clash ({}) between {} children of {}: {} and {}. Inference rules may be \
                     needed to separate the ID components",
                    link.as_deref().unwrap_or("<none>"),
                    self.layout.space.label(frequency),
                    self.describe_row(parent),
                    self.describe_row(clash),
                    ids.describe(&self.layout.space)
                )));
            }
            self.rows[parent.0]
                .children
                .entry(frequency)
                .or_default()
                .insert(link, index);
        }
        Ok(index)
    }

    pub fn row(&self, index: RowIndex) -> &Row {
        &self.rows[index.0]
    }

    pub fn find(&self, frequency: Frequency, id: Option<&str>) -> Result<RowIndex, KiraError> {
        self.index
            .get(&frequency)
            .and_then(|rows| rows.get(&id.map(str::to_string)))
            .copied()
            .ok_or_else(|| KiraError::RowNotFound {
                frequency: self.layout.space.label(frequency),
                id: id.unwrap_or("<none>").to_string(),
            })
    }

    /// Rows of `frequency` ordered by ID.
    pub fn rows(&self, frequency: Frequency) -> Vec<RowIndex> {
        self.index
            .get(&frequency)
            .map(|rows| rows.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn row_ids(&self, frequency: Frequency) -> Vec<Option<String>> {
        self.index
            .get(&frequency)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rejected(&self) -> &[RejectedRow] {
        &self.rejected
    }

    pub fn describe_row(&self, index: RowIndex) -> String {
        let row = &self.rows[index.0];
        let space = &self.layout.space;
        let mut shown = self
            .layout
            .hierarchy
            .layers()
            .iter()
            .copied()
            .filter(|layer| layer.is_parent_or_equal(row.frequency))
            .collect::<Vec<_>>();
        if !shown.contains(&row.frequency) && !row.frequency.is_root() {
            shown.push(row.frequency);
        }
        let ids = shown
            .into_iter()
            .filter_map(|freq| {
                row.ids
                    .get(freq)
                    .map(|id| format!("{}={id}", space.label(freq)))
            })
            .collect::<Vec<_>>();
        if ids.is_empty() {
            format!("{} row", space.label(row.frequency))
        } else {
            format!("{} row ({})", space.label(row.frequency), ids.join(", "))
        }
    }

    pub fn item(&self, index: ItemIndex) -> &Item {
        &self.items[index.0]
    }

    fn push_item(&mut self, row: RowIndex, mut item: Item) -> ItemIndex {
        item.meta_mut().row = Some(row);
        let index = ItemIndex(self.items.len());
        self.items.push(item);
        index
    }

    /// Records the unresolved items discovered in a row.
    pub fn set_entries(&mut self, row: RowIndex, items: Vec<Item>) {
        let indices = items
            .into_iter()
            .map(|item| self.push_item(row, item))
            .collect();
        self.rows[row.0].entries = Some(indices);
    }

    pub fn entries(&self, row: RowIndex) -> Option<Vec<&Item>> {
        self.rows[row.0]
            .entries
            .as_ref()
            .map(|entries| entries.iter().map(|index| &self.items[index.0]).collect())
    }

    pub fn resolved(&self, row: RowIndex, column: &str) -> Option<&Item> {
        self.rows[row.0]
            .resolved
            .get(column)
            .map(|index| &self.items[index.0])
    }

    pub fn set_resolved(&mut self, row: RowIndex, column: &str, item: Item) -> ItemIndex {
        let index = self.push_item(row, item);
        self.rows[row.0]
            .resolved
            .insert(column.to_string(), index);
        index
    }

    /// Forgets every match made for `column`.
    pub fn clear_resolved(&mut self, column: &str) {
        for row in &mut self.rows {
            row.resolved.remove(column);
        }
    }

    /// Forgets a row's discovered items so they are listed again on next use.
    pub fn clear_entries(&mut self, row: RowIndex) {
        let row = &mut self.rows[row.0];
        row.entries = None;
        row.resolved.clear();
    }
}
