//! Data spaces and the frequency algebra.
//!
//! A [`DataSpace`] declares a set of orthogonal axes (e.g. `member`, `group`,
//! `timepoint`) as single bits and gives names to the combinations that are
//! meaningful for a dataset (e.g. `subject = member | group`). A
//! [`Frequency`] is one such combination: it says which axes are fixed for a
//! row. The all-zero frequency is the dataset-wide root and the union of all
//! axes is the leaf frequency.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

use crate::error::KiraError;
use crate::registry::Registry;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Frequency(u32);

impl Frequency {
    pub const ROOT: Frequency = Frequency(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    pub const fn is_basis(self) -> bool {
        self.0.count_ones() == 1
    }

    /// True iff `self` is a proper sub-frequency of `child`.
    pub const fn is_parent(self, child: Frequency) -> bool {
        (self.0 & child.0) == self.0 && self.0 != child.0
    }

    pub const fn is_parent_or_equal(self, child: Frequency) -> bool {
        (self.0 & child.0) == self.0
    }

    pub const fn combine(self, other: Frequency) -> Frequency {
        Frequency(self.0 | other.0)
    }

    pub const fn common(self, other: Frequency) -> Frequency {
        Frequency(self.0 & other.0)
    }

    /// Axes of `self` that are not in `other`.
    pub const fn difference(self, other: Frequency) -> Frequency {
        Frequency(self.0 & !other.0)
    }

    /// Decomposes the frequency into its base axes, most significant first.
    pub fn axes(self) -> Vec<Frequency> {
        let mut axes = Vec::with_capacity(self.0.count_ones() as usize);
        let mut remaining = self.0;
        while remaining != 0 {
            let top = 1u32 << (31 - remaining.leading_zeros());
            axes.push(Frequency(top));
            remaining &= !top;
        }
        axes
    }
}

impl BitOr for Frequency {
    type Output = Frequency;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.combine(rhs)
    }
}

impl BitAnd for Frequency {
    type Output = Frequency;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.common(rhs)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

/// A named set of frequencies. Defined once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSpace {
    name: String,
    frequencies: Vec<(String, Frequency)>,
    leaf: Frequency,
}

impl DataSpace {
    pub fn new<'a, I>(name: &str, frequencies: I) -> Result<Self, KiraError>
    where
        I: IntoIterator<Item = (&'a str, u32)>,
    {
        let mut entries = Vec::new();
        let mut names = BTreeSet::new();
        let mut values = BTreeSet::new();
        for (freq_name, bits) in frequencies {
            if freq_name.is_empty() || !freq_name.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return Err(KiraError::InvalidSpace(format!(
                    "frequency names must be non-empty and alphanumeric, got '{freq_name}'"
                )));
            }
            if !names.insert(freq_name.to_string()) {
                return Err(KiraError::InvalidSpace(format!(
                    "duplicate frequency name '{freq_name}' in {name}"
                )));
            }
            if !values.insert(bits) {
                return Err(KiraError::InvalidSpace(format!(
                    "duplicate frequency value {bits:#b} in {name}"
                )));
            }
            entries.push((freq_name.to_string(), Frequency(bits)));
        }
        if !values.contains(&0) {
            return Err(KiraError::InvalidSpace(format!(
                "{name} does not name the dataset-wide (zero) frequency"
            )));
        }
        let leaf = entries
            .iter()
            .fold(Frequency::ROOT, |acc, (_, freq)| acc | *freq);
        if !values.contains(&leaf.bits()) {
            return Err(KiraError::InvalidSpace(format!(
                "{name} does not name its leaf frequency {leaf}"
            )));
        }
        entries.sort_by_key(|(_, freq)| *freq);
        Ok(Self {
            name: name.to_string(),
            frequencies: entries,
            leaf,
        })
    }

    /// Longitudinal imaging studies: members of groups scanned at timepoints.
    pub fn clinical() -> Self {
        Self::builtin(
            "clinical",
            &[
                ("dataset", 0b000),
                ("member", 0b001),
                ("group", 0b010),
                ("subject", 0b011),
                ("timepoint", 0b100),
                ("matchedpoint", 0b101),
                ("batch", 0b110),
                ("session", 0b111),
            ],
        )
    }

    /// A flat collection of samples.
    pub fn samples() -> Self {
        Self::builtin("samples", &[("dataset", 0b0), ("sample", 0b1)])
    }

    // Built-in tables are sorted by value and name both root and leaf.
    fn builtin(name: &str, table: &[(&str, u32)]) -> Self {
        let frequencies = table
            .iter()
            .map(|(freq_name, bits)| (freq_name.to_string(), Frequency(*bits)))
            .collect::<Vec<_>>();
        let leaf = frequencies
            .iter()
            .fold(Frequency::ROOT, |acc, (_, freq)| acc | *freq);
        Self {
            name: name.to_string(),
            frequencies,
            leaf,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Frequency {
        Frequency::ROOT
    }

    pub fn leaf(&self) -> Frequency {
        self.leaf
    }

    /// The basis axes of the space, most significant first.
    pub fn axes(&self) -> Vec<Frequency> {
        self.leaf.axes()
    }

    pub fn contains(&self, frequency: Frequency) -> bool {
        frequency.difference(self.leaf).is_root()
    }

    pub fn frequencies(&self) -> impl Iterator<Item = (&str, Frequency)> {
        self.frequencies
            .iter()
            .map(|(name, freq)| (name.as_str(), *freq))
    }

    pub fn frequency(&self, name: &str) -> Result<Frequency, KiraError> {
        self.frequencies
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, freq)| *freq)
            .ok_or_else(|| KiraError::UnknownAxis {
                space: self.name.clone(),
                axis: name.to_string(),
            })
    }

    pub fn name_of(&self, frequency: Frequency) -> Option<&str> {
        self.frequencies
            .iter()
            .find(|(_, freq)| *freq == frequency)
            .map(|(name, _)| name.as_str())
    }

    /// Name of the frequency, falling back to its bit pattern.
    pub fn label(&self, frequency: Frequency) -> String {
        self.name_of(frequency)
            .map(str::to_string)
            .unwrap_or_else(|| frequency.to_string())
    }
}

impl fmt::Display for DataSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The layers of the data tree, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    layers: Vec<Frequency>,
}

impl Hierarchy {
    pub fn new<S: AsRef<str>>(space: &DataSpace, layers: &[S]) -> Result<Self, KiraError> {
        let layers = layers
            .iter()
            .map(|name| space.frequency(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_frequencies(space, layers)
    }

    pub fn from_frequencies(space: &DataSpace, layers: Vec<Frequency>) -> Result<Self, KiraError> {
        if layers.is_empty() {
            return Err(KiraError::InvalidHierarchy(
                "a hierarchy needs at least one layer".to_string(),
            ));
        }
        let mut accounted = Frequency::ROOT;
        for layer in &layers {
            if !space.contains(*layer) {
                return Err(KiraError::InvalidHierarchy(format!(
                    "layer {layer} is outside the {space} space"
                )));
            }
            if layer.difference(accounted).is_root() {
                return Err(KiraError::InvalidHierarchy(format!(
                    "layer '{}' does not add any axes to its predecessors",
                    space.label(*layer)
                )));
            }
            accounted = accounted | *layer;
        }
        if accounted != space.leaf() {
            return Err(KiraError::InvalidHierarchy(format!(
                "layers only span {} of the {} leaf frequency",
                space.label(accounted),
                space.label(space.leaf())
            )));
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Frequency] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn describe(&self, space: &DataSpace) -> String {
        self.layers
            .iter()
            .map(|layer| space.label(*layer))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn register(registry: &mut Registry<DataSpace, ()>) {
    registry.register("clinical", |_| Ok(DataSpace::clinical()));
    registry.register("samples", |_| Ok(DataSpace::samples()));
}

pub fn spaces() -> Registry<DataSpace, ()> {
    let mut registry = Registry::new("data space");
    register(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn axes_are_most_significant_first() {
        let space = DataSpace::clinical();
        let session = space.frequency("session").unwrap();
        let names = session
            .axes()
            .into_iter()
            .map(|axis| space.label(axis))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["timepoint", "group", "member"]);
        assert!(Frequency::ROOT.axes().is_empty());
    }

    #[test]
    fn parent_relationships() {
        let space = DataSpace::clinical();
        let subject = space.frequency("subject").unwrap();
        let session = space.frequency("session").unwrap();
        let timepoint = space.frequency("timepoint").unwrap();
        assert!(subject.is_parent(session));
        assert!(!session.is_parent(session));
        assert!(session.is_parent_or_equal(session));
        assert!(!timepoint.is_parent(subject));
        assert!(Frequency::ROOT.is_parent(timepoint));
    }

    #[test]
    fn root_is_identity_for_combine() {
        let space = DataSpace::clinical();
        for (_, freq) in space.frequencies() {
            assert_eq!(freq.combine(Frequency::ROOT), freq);
        }
    }

    #[test]
    fn unknown_axis() {
        let err = DataSpace::clinical().frequency("visit").unwrap_err();
        assert_matches!(err, KiraError::UnknownAxis { .. });
    }

    #[test]
    fn rejects_space_without_leaf_name() {
        let err = DataSpace::new("broken", [("dataset", 0), ("a", 1), ("b", 2)]).unwrap_err();
        assert_matches!(err, KiraError::InvalidSpace(_));
    }

    #[test]
    fn hierarchy_must_span_leaf() {
        let space = DataSpace::clinical();
        let err = Hierarchy::new(&space, &["subject"]).unwrap_err();
        assert_matches!(err, KiraError::InvalidHierarchy(_));
        let err = Hierarchy::new(&space, &["session", "subject"]).unwrap_err();
        assert_matches!(err, KiraError::InvalidHierarchy(_));
        assert!(Hierarchy::new(&space, &["subject", "session"]).is_ok());
    }
}
