//! Translation between rows and relative path segments.
//!
//! Leaf rows map to one segment per hierarchy layer. Summary rows (coarser
//! than the leaf frequency) map to the segments of the layers they span plus
//! one escape token, `__<frequency>__` or `__<frequency>_<id>__`, naming the
//! remaining frequency. Ordinary identifiers are never allowed to look like
//! an escape token, so the two kinds of path cannot collide.

use crate::error::KiraError;
use crate::ids::IdentifierMap;
use crate::space::{DataSpace, Frequency, Hierarchy};

/// Names that are never rows or items: escape tokens, hidden and backup files.
pub fn is_special(name: &str) -> bool {
    is_escape(name) || name.starts_with('.') || name.starts_with('~')
}

pub fn is_escape(name: &str) -> bool {
    name.len() >= 4 && name.starts_with("__") && name.ends_with("__")
}

pub fn check_identifier(id: &str) -> Result<(), KiraError> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || is_special(id) {
        return Err(KiraError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

fn unrepresentable(
    space: &DataSpace,
    hierarchy: &Hierarchy,
    frequency: Frequency,
    reason: impl Into<String>,
) -> KiraError {
    KiraError::UnrepresentableFrequency {
        frequency: space.label(frequency),
        hierarchy: hierarchy.describe(space),
        reason: reason.into(),
    }
}

/// Layer identifiers and (for summary rows) the trailing frequency and its
/// identifier, as consumed by [`encode`].
fn walk(
    space: &DataSpace,
    hierarchy: &Hierarchy,
    frequency: Frequency,
    ids: &IdentifierMap,
) -> Result<(Vec<(Frequency, String)>, Option<(Frequency, Option<String>)>), KiraError> {
    if !space.contains(frequency) {
        return Err(unrepresentable(
            space,
            hierarchy,
            frequency,
            format!("not a frequency of the {space} space"),
        ));
    }
    let mut layers = Vec::new();
    let mut accounted = Frequency::ROOT;
    for layer in hierarchy.layers() {
        if !layer.is_parent_or_equal(frequency) {
            break;
        }
        let id = ids.compose(*layer).ok_or_else(|| {
            unrepresentable(
                space,
                hierarchy,
                frequency,
                format!("no identifier for the '{}' layer", space.label(*layer)),
            )
        })?;
        check_identifier(&id)?;
        layers.push((*layer, id));
        accounted = accounted | *layer;
    }
    if frequency == space.leaf() {
        return Ok((layers, None));
    }
    let unaccounted = frequency.difference(accounted);
    if space.name_of(unaccounted).is_none() {
        return Err(unrepresentable(
            space,
            hierarchy,
            frequency,
            format!("the remaining frequency {unaccounted} has no name"),
        ));
    }
    let id = if unaccounted.is_root() {
        None
    } else {
        ids.compose(unaccounted)
    };
    if let Some(id) = &id {
        check_identifier(id)?;
    }
    Ok((layers, Some((unaccounted, id))))
}

pub fn encode(
    space: &DataSpace,
    hierarchy: &Hierarchy,
    frequency: Frequency,
    ids: &IdentifierMap,
) -> Result<Vec<String>, KiraError> {
    let (layers, summary) = walk(space, hierarchy, frequency, ids)?;
    let mut segments = layers.into_iter().map(|(_, id)| id).collect::<Vec<_>>();
    if let Some((unaccounted, id)) = summary {
        let name = space.label(unaccounted);
        segments.push(match id {
            Some(id) => format!("__{name}_{id}__"),
            None => format!("__{name}__"),
        });
    }
    Ok(segments)
}

/// The identifiers that survive an [`encode`]/[`decode`] round trip.
pub fn path_ids(
    space: &DataSpace,
    hierarchy: &Hierarchy,
    frequency: Frequency,
    ids: &IdentifierMap,
) -> Result<IdentifierMap, KiraError> {
    let (layers, summary) = walk(space, hierarchy, frequency, ids)?;
    let mut kept = layers.into_iter().collect::<IdentifierMap>();
    if let Some((unaccounted, Some(id))) = summary {
        kept.insert(unaccounted, id);
    }
    Ok(kept)
}

pub fn decode<S: AsRef<str>>(
    space: &DataSpace,
    hierarchy: &Hierarchy,
    segments: &[S],
) -> Result<(Frequency, IdentifierMap), KiraError> {
    let (plain, escape) = match segments.split_last() {
        Some((last, rest)) if is_escape(last.as_ref()) => (rest, Some(last.as_ref())),
        _ => (segments, None),
    };
    if plain.len() > hierarchy.len() {
        return Err(KiraError::DataTreeConstruction(format!(
            "path has {} segments but the hierarchy [{}] only has {} layers",
            plain.len(),
            hierarchy.describe(space),
            hierarchy.len()
        )));
    }
    let mut ids = IdentifierMap::new();
    let mut accounted = Frequency::ROOT;
    for (segment, layer) in plain.iter().zip(hierarchy.layers()) {
        let segment = segment.as_ref();
        check_identifier(segment)?;
        ids.insert(*layer, segment);
        accounted = accounted | *layer;
    }
    let frequency = match escape {
        Some(token) => {
            let inner = &token[2..token.len() - 2];
            let (name, id) = match inner.split_once('_') {
                Some((name, id)) => (name, Some(id)),
                None => (inner, None),
            };
            let unaccounted = space.frequency(name)?;
            if let Some(id) = id {
                check_identifier(id)?;
                ids.insert(unaccounted, id);
            }
            accounted | unaccounted
        }
        None => {
            if plain.len() != hierarchy.len() {
                return Err(KiraError::DataTreeConstruction(format!(
                    "path has {} segments, expected one per layer of [{}]",
                    plain.len(),
                    hierarchy.describe(space)
                )));
            }
            accounted
        }
    };
    Ok((frequency, ids))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn setup() -> (DataSpace, Hierarchy) {
        let space = DataSpace::clinical();
        let hierarchy = Hierarchy::new(&space, &["subject", "session"]).unwrap();
        (space, hierarchy)
    }

    #[test]
    fn leaf_rows_have_one_segment_per_layer() {
        let (space, hierarchy) = setup();
        let mut ids = IdentifierMap::new();
        ids.insert(space.frequency("subject").unwrap(), "01");
        ids.insert(space.frequency("session").unwrap(), "MR1");
        let segments = encode(&space, &hierarchy, space.leaf(), &ids).unwrap();
        assert_eq!(segments, vec!["01", "MR1"]);
    }

    #[test]
    fn summary_rows_end_with_escape_token() {
        let (space, hierarchy) = setup();
        let mut ids = IdentifierMap::new();
        ids.insert(space.frequency("subject").unwrap(), "01");
        ids.insert(space.frequency("timepoint").unwrap(), "2");

        let subject = space.frequency("subject").unwrap();
        assert_eq!(
            encode(&space, &hierarchy, subject, &ids).unwrap(),
            vec!["01", "__dataset__"]
        );
        let timepoint = space.frequency("timepoint").unwrap();
        assert_eq!(
            encode(&space, &hierarchy, timepoint, &ids).unwrap(),
            vec!["__timepoint_2__"]
        );
        let group = space.frequency("group").unwrap();
        assert_eq!(
            encode(&space, &hierarchy, group, &ids).unwrap(),
            vec!["__group__"]
        );
    }

    #[test]
    fn decode_parses_escape_token() {
        let (space, hierarchy) = setup();
        let (freq, ids) = decode(&space, &hierarchy, &["__timepoint_2__"]).unwrap();
        assert_eq!(freq, space.frequency("timepoint").unwrap());
        assert_eq!(ids.get(freq), Some("2"));
    }

    #[test]
    fn escape_shaped_identifiers_are_rejected() {
        let (space, hierarchy) = setup();
        let mut ids = IdentifierMap::new();
        ids.insert(space.frequency("subject").unwrap(), "__01__");
        ids.insert(space.frequency("session").unwrap(), "MR1");
        let err = encode(&space, &hierarchy, space.leaf(), &ids).unwrap_err();
        assert_matches!(err, KiraError::InvalidIdentifier(_));
    }

    #[test]
    fn missing_layer_identifier_is_unrepresentable() {
        let (space, hierarchy) = setup();
        let ids = IdentifierMap::new();
        let err = encode(&space, &hierarchy, space.leaf(), &ids).unwrap_err();
        assert_matches!(err, KiraError::UnrepresentableFrequency { .. });
    }

    #[test]
    fn special_names() {
        assert!(is_special("__fields__"));
        assert!(is_special(".DS_Store"));
        assert!(is_special("~backup"));
        assert!(!is_special("sub-01"));
        assert!(!is_special("__"));
    }
}
