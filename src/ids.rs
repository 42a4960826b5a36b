//! Identifier maps and the id-inference rules applied during discovery.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::error::KiraError;
use crate::space::{DataSpace, Frequency};

/// Identifiers of a row keyed by frequency. Frequencies whose identifier is
/// unknown are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IdentifierMap(BTreeMap<Frequency, String>);

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, frequency: Frequency) -> Option<&str> {
        self.0.get(&frequency).map(String::as_str)
    }

    pub fn contains(&self, frequency: Frequency) -> bool {
        self.0.contains_key(&frequency)
    }

    pub fn insert(&mut self, frequency: Frequency, id: impl Into<String>) -> Option<String> {
        self.0.insert(frequency, id.into())
    }

    pub fn remove(&mut self, frequency: Frequency) -> Option<String> {
        self.0.remove(&frequency)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Frequency, &str)> {
        self.0.iter().map(|(freq, id)| (*freq, id.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps only the identifiers of frequencies at or above `frequency`.
    pub fn restrict(&self, frequency: Frequency) -> IdentifierMap {
        IdentifierMap(
            self.0
                .iter()
                .filter(|(freq, _)| freq.is_parent_or_equal(frequency))
                .map(|(freq, id)| (*freq, id.clone()))
                .collect(),
        )
    }

    /// Identifier for `frequency`: the explicit one if present, otherwise the
    /// `_`-joined identifiers of its axes that are known.
    pub fn compose(&self, frequency: Frequency) -> Option<String> {
        if let Some(id) = self.get(frequency) {
            return Some(id.to_string());
        }
        let parts = frequency
            .axes()
            .into_iter()
            .filter_map(|axis| self.get(axis))
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("_"))
        }
    }

    pub fn describe(&self, space: &DataSpace) -> String {
        self.0
            .iter()
            .filter(|(freq, _)| !freq.is_root())
            .map(|(freq, id)| format!("{}={id}", space.label(*freq)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<(Frequency, String)> for IdentifierMap {
    fn from_iter<T: IntoIterator<Item = (Frequency, String)>>(iter: T) -> Self {
        IdentifierMap(iter.into_iter().collect())
    }
}

/// Extracts identifiers of other frequencies from an identifier that is
/// already known, e.g. `group` and `member` out of a `CONTROL03` subject ID.
#[derive(Debug, Clone)]
pub struct InferenceRule {
    source: Frequency,
    target: Frequency,
    pattern: Regex,
    bindings: Vec<(Option<String>, Frequency)>,
    label: String,
}

impl InferenceRule {
    /// Compiles a rule. Named groups bind the frequency of the same name; a
    /// pattern without named groups must have exactly one group, bound to
    /// `target`. Matching is anchored at the start of the source identifier.
    pub fn new(
        space: &DataSpace,
        source: &str,
        target: &str,
        pattern: &str,
    ) -> Result<Self, KiraError> {
        let source_freq = space.frequency(source)?;
        let target_freq = space.frequency(target)?;
        let compiled =
            Regex::new(&format!("^(?:{pattern})")).map_err(|err| KiraError::InvalidPattern {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })?;
        let named = compiled.capture_names().flatten().collect::<Vec<_>>();
        let bindings = if named.is_empty() {
            if compiled.captures_len() != 2 {
                return Err(KiraError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: format!(
                        "expected exactly one capture group for '{target}', found {}",
                        compiled.captures_len() - 1
                    ),
                });
            }
            vec![(None, target_freq)]
        } else {
            named
                .into_iter()
                .map(|name| Ok((Some(name.to_string()), space.frequency(name)?)))
                .collect::<Result<Vec<_>, KiraError>>()?
        };
        Ok(Self {
            source: source_freq,
            target: target_freq,
            pattern: compiled,
            bindings,
            label: format!("{target} <- {source}::{pattern}"),
        })
    }

    /// Parses the `source::regex` shorthand used in dataset definitions.
    pub fn parse(space: &DataSpace, target: &str, expression: &str) -> Result<Self, KiraError> {
        let (source, pattern) =
            expression
                .split_once("::")
                .ok_or_else(|| KiraError::InvalidPattern {
                    pattern: expression.to_string(),
                    message: "expected '<source frequency>::<regex>'".to_string(),
                })?;
        Self::new(space, source, target, pattern)
    }

    pub fn source(&self) -> Frequency {
        self.source
    }

    pub fn target(&self) -> Frequency {
        self.target
    }

    fn apply(&self, source_id: &str) -> Option<Vec<(Frequency, String)>> {
        let captures = self.pattern.captures(source_id)?;
        let mut bound = Vec::with_capacity(self.bindings.len());
        for (name, freq) in &self.bindings {
            let group = match name {
                Some(name) => captures.name(name),
                None => captures.get(1),
            };
            if let Some(value) = group {
                bound.push((*freq, value.as_str().to_string()));
            }
        }
        Some(bound)
    }
}

impl fmt::Display for InferenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(IdentifierMap),
    Rejected { rule: String, source_id: String },
}

/// Applies the rules once each, in declaration order. A rule whose source is
/// unknown or whose target is already known does nothing.
pub fn resolve(rules: &[InferenceRule], ids: &IdentifierMap) -> Resolution {
    let mut resolved = ids.clone();
    for rule in rules {
        if resolved.contains(rule.target) {
            continue;
        }
        let Some(source_id) = resolved.get(rule.source).map(str::to_string) else {
            continue;
        };
        match rule.apply(&source_id) {
            Some(bound) => {
                for (freq, value) in bound {
                    if !resolved.contains(freq) {
                        resolved.insert(freq, value);
                    }
                }
            }
            None => {
                return Resolution::Rejected {
                    rule: rule.to_string(),
                    source_id,
                };
            }
        }
    }
    Resolution::Resolved(resolved)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn subject_ids(space: &DataSpace, subject: &str) -> IdentifierMap {
        let mut ids = IdentifierMap::new();
        ids.insert(space.frequency("subject").unwrap(), subject);
        ids
    }

    #[test]
    fn named_groups_bind_their_frequencies() {
        let space = DataSpace::clinical();
        let rule = InferenceRule::new(
            &space,
            "subject",
            "group",
            r"(?P<group>[A-Z]+)(?P<member>\d+)",
        )
        .unwrap();
        let resolved = resolve(&[rule], &subject_ids(&space, "CONTROL99"));
        let Resolution::Resolved(ids) = resolved else {
            panic!("expected resolution");
        };
        assert_eq!(ids.get(space.frequency("group").unwrap()), Some("CONTROL"));
        assert_eq!(ids.get(space.frequency("member").unwrap()), Some("99"));
    }

    #[test]
    fn single_group_binds_target() {
        let space = DataSpace::clinical();
        let rule = InferenceRule::parse(&space, "member", r"subject::[A-Z]+(\d+)").unwrap();
        let Resolution::Resolved(ids) = resolve(&[rule], &subject_ids(&space, "PATIENT07")) else {
            panic!("expected resolution");
        };
        assert_eq!(ids.get(space.frequency("member").unwrap()), Some("07"));
    }

    #[test]
    fn non_matching_rule_rejects_row() {
        let space = DataSpace::clinical();
        let rule = InferenceRule::parse(&space, "group", r"subject::([A-Z]+)\d+").unwrap();
        let resolution = resolve(&[rule], &subject_ids(&space, "99"));
        assert_matches!(resolution, Resolution::Rejected { ref source_id, .. } if source_id == "99");
    }

    #[test]
    fn rules_run_once_in_declaration_order() {
        let space = DataSpace::clinical();
        // The first rule needs `timepoint`, which only the second rule produces.
        let chained = InferenceRule::parse(&space, "batch", r"timepoint::(\w+)").unwrap();
        let producer = InferenceRule::new(
            &space,
            "subject",
            "timepoint",
            r"[A-Z]+\d+V(?P<timepoint>\d)",
        )
        .unwrap();
        let Resolution::Resolved(ids) =
            resolve(&[chained, producer], &subject_ids(&space, "ABC1V2"))
        else {
            panic!("expected resolution");
        };
        assert_eq!(ids.get(space.frequency("timepoint").unwrap()), Some("2"));
        assert!(!ids.contains(space.frequency("batch").unwrap()));
    }

    #[test]
    fn unknown_group_name_is_rejected() {
        let space = DataSpace::clinical();
        let err = InferenceRule::new(&space, "subject", "group", r"(?P<visit>\d+)").unwrap_err();
        assert_matches!(err, KiraError::UnknownAxis { .. });
    }

    #[test]
    fn compose_joins_axes_most_significant_first() {
        let space = DataSpace::clinical();
        let mut ids = IdentifierMap::new();
        ids.insert(space.frequency("member").unwrap(), "03");
        ids.insert(space.frequency("timepoint").unwrap(), "2");
        let matchedpoint = space.frequency("matchedpoint").unwrap();
        assert_eq!(ids.compose(matchedpoint).as_deref(), Some("2_03"));
        let session = space.frequency("session").unwrap();
        assert_eq!(ids.compose(session).as_deref(), Some("2_03"));
    }
}
