//! Merging per-type candidate lists into one ranked, id-unique list.

use std::collections::HashMap;

use kglink_core::{EntityType, LinkCandidate};

/// The same canonical id surfaced under two entity types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCollision {
    pub id: String,
    /// Type of the candidate that was kept.
    pub kept: EntityType,
    /// Type of the lower-ranked candidate that was dropped.
    pub dropped: EntityType,
}

/// Output of [`merge_candidates`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    pub candidates: Vec<LinkCandidate>,
    pub collisions: Vec<TypeCollision>,
}

/// Total order used for ranking: score descending, then entity type, id and
/// name ascending.
pub fn rank(a: &LinkCandidate, b: &LinkCandidate) -> std::cmp::Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.entity_type.cmp(&b.entity_type))
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.name.cmp(&b.name))
}

/// Sort candidates, keep the best one per id and truncate to `k`.
///
/// An id kept under one type and seen again under another is reported as a
/// [`TypeCollision`].
pub fn merge_candidates(mut candidates: Vec<LinkCandidate>, k: usize) -> Merged {
    candidates.sort_by(rank);

    let mut kept: HashMap<String, EntityType> = HashMap::new();
    let mut merged = Merged::default();

    for candidate in candidates {
        if let Some(&kept_type) = kept.get(&candidate.id) {
            if kept_type != candidate.entity_type
                && !merged
                    .collisions
                    .iter()
                    .any(|c| c.id == candidate.id && c.dropped == candidate.entity_type)
            {
                tracing::warn!(
                    id = %candidate.id,
                    kept = %kept_type,
                    dropped = %candidate.entity_type,
                    "canonical id appears under more than one entity type"
                );
                merged.collisions.push(TypeCollision {
                    id: candidate.id,
                    kept: kept_type,
                    dropped: candidate.entity_type,
                });
            }
            continue;
        }
        kept.insert(candidate.id.clone(), candidate.entity_type);
        merged.candidates.push(candidate);
    }

    merged.candidates.truncate(k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, name: &str, entity_type: EntityType, score: f32) -> LinkCandidate {
        LinkCandidate {
            id: id.to_string(),
            name: name.to_string(),
            entity_type,
            score,
        }
    }

    #[test]
    fn test_sorted_by_score() {
        let merged = merge_candidates(
            vec![
                candidate("C2", "b", EntityType::Drug, 0.5),
                candidate("C1", "a", EntityType::Drug, 0.9),
                candidate("D1", "c", EntityType::Disease, 0.7),
            ],
            10,
        );
        let ids: Vec<_> = merged.candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "D1", "C2"]);
        assert!(merged.collisions.is_empty());
    }

    #[test]
    fn test_ties_break_by_type_then_id_then_name() {
        let merged = merge_candidates(
            vec![
                candidate("P1", "x", EntityType::Protein, 0.8),
                candidate("C2", "y", EntityType::Drug, 0.8),
                candidate("C1", "z", EntityType::Drug, 0.8),
                candidate("D9", "w", EntityType::Disease, 0.8),
            ],
            10,
        );
        let ids: Vec<_> = merged.candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["D9", "C1", "C2", "P1"]);
    }

    #[test]
    fn test_same_id_keeps_best_name() {
        let merged = merge_candidates(
            vec![
                candidate("C1", "Humira", EntityType::Drug, 0.7),
                candidate("C1", "adalimumab", EntityType::Drug, 0.95),
            ],
            10,
        );
        assert_eq!(merged.candidates.len(), 1);
        assert_eq!(merged.candidates[0].name, "adalimumab");
        assert!(merged.collisions.is_empty());
    }

    #[test]
    fn test_cross_type_duplicate_is_collision() {
        let merged = merge_candidates(
            vec![
                candidate("X1", "tnf", EntityType::Protein, 0.9),
                candidate("X1", "tnf", EntityType::Drug, 0.6),
                candidate("X1", "tnf alpha", EntityType::Drug, 0.5),
            ],
            10,
        );
        assert_eq!(merged.candidates.len(), 1);
        assert_eq!(merged.candidates[0].entity_type, EntityType::Protein);
        assert_eq!(
            merged.collisions,
            vec![TypeCollision {
                id: "X1".to_string(),
                kept: EntityType::Protein,
                dropped: EntityType::Drug,
            }]
        );
    }

    #[test]
    fn test_truncates_after_dedup() {
        let merged = merge_candidates(
            vec![
                candidate("C1", "a", EntityType::Drug, 0.9),
                candidate("C1", "b", EntityType::Drug, 0.8),
                candidate("C2", "c", EntityType::Drug, 0.7),
                candidate("C3", "d", EntityType::Drug, 0.6),
            ],
            2,
        );
        let ids: Vec<_> = merged.candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C2"]);
    }

    #[test]
    fn test_zero_k_is_empty() {
        let merged = merge_candidates(vec![candidate("C1", "a", EntityType::Drug, 0.9)], 0);
        assert!(merged.candidates.is_empty());
    }
}
