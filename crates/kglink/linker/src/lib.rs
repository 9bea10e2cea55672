//! Type-aware entity linking.
//!
//! A mention is normalized, encoded once, and searched only in the indices of
//! the entity types the caller expects. Per-type hits are merged into a single
//! list ranked by cosine similarity with one candidate per canonical id.

pub mod merge;

pub use merge::{Merged, TypeCollision, merge_candidates};

use std::collections::BTreeMap;

use kglink_core::{EntityType, LinkCandidate};

/// Which normalizer variants are encoded and searched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMode {
    /// Search with the first variant only (the mention itself).
    #[default]
    FirstVariant,
    /// Search with every variant and keep each row's best score.
    AllVariants,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkerConfig {
    pub query_mode: QueryMode,
    /// Candidate count used by callers that do not pass one.
    pub default_topk: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            query_mode: QueryMode::FirstVariant,
            default_topk: 8,
        }
    }
}

/// Resolves mentions against an [`kglink_index::IndexStore`].
///
/// Holds no mutable state; one linker can serve concurrent queries.
pub struct TypeAwareLinker<'a> {
    store: &'a kglink_index::IndexStore,
    encoder: &'a dyn kglink_embed::Encoder,
    normalizer: kglink_normalize::NameNormalizer,
    config: LinkerConfig,
}

impl<'a> TypeAwareLinker<'a> {
    /// Every loaded index must have been built with `encoder`.
    pub fn new(
        store: &'a kglink_index::IndexStore,
        encoder: &'a dyn kglink_embed::Encoder,
        normalizer: kglink_normalize::NameNormalizer,
        config: LinkerConfig,
    ) -> kglink_core::Result<Self> {
        for entity_type in store.entity_types() {
            let Some(index) = store.get(entity_type) else {
                continue;
            };
            if index.encoder() != encoder.identity() {
                return Err(kglink_core::Error::IndexUnavailable {
                    entity_type,
                    reason: format!(
                        "built with encoder {}, serving encoder is {}",
                        index.encoder(),
                        encoder.identity()
                    ),
                });
            }
        }
        Ok(Self {
            store,
            encoder,
            normalizer,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    #[must_use]
    pub fn normalizer(&self) -> &kglink_normalize::NameNormalizer {
        &self.normalizer
    }

    /// Link `mention` to at most `k` candidates from the expected types.
    ///
    /// An empty `expected_types` searches every loaded type. Unknown or
    /// unloaded type names contribute nothing.
    pub fn link<S: AsRef<str>>(
        &self,
        mention: &str,
        expected_types: &[S],
        k: usize,
    ) -> kglink_core::Result<Vec<LinkCandidate>> {
        Ok(self.link_merged(mention, expected_types, k)?.candidates)
    }

    /// Like [`TypeAwareLinker::link`], also returning cross-type id collisions.
    pub fn link_merged<S: AsRef<str>>(
        &self,
        mention: &str,
        expected_types: &[S],
        k: usize,
    ) -> kglink_core::Result<Merged> {
        if k == 0 {
            return Ok(Merged::default());
        }
        let types = self.searchable_types(expected_types);
        if types.is_empty() {
            tracing::debug!(mention, "no loaded index for the expected types");
            return Ok(Merged::default());
        }

        let queries = self.query_texts(mention);
        let query_refs: Vec<&str> = queries.iter().map(String::as_str).collect();
        let vectors = self.encoder.encode_batch(&query_refs)?;

        let mut candidates = Vec::new();
        for entity_type in types {
            let Some(index) = self.store.get(entity_type) else {
                continue;
            };

            // Best score per row across query vectors.
            let mut best: BTreeMap<usize, f32> = BTreeMap::new();
            for vector in &vectors {
                for hit in index.search(vector, k)? {
                    best.entry(hit.position)
                        .and_modify(|s| *s = s.max(hit.score))
                        .or_insert(hit.score);
                }
            }

            candidates.extend(best.into_iter().filter_map(|(position, score)| {
                index.row(position).map(|row| LinkCandidate {
                    id: row.id.clone(),
                    name: row.display_name.clone(),
                    entity_type,
                    score,
                })
            }));
        }

        let merged = merge_candidates(candidates, k);
        tracing::debug!(
            mention,
            queries = queries.len(),
            candidates = merged.candidates.len(),
            collisions = merged.collisions.len(),
            "linked mention"
        );
        Ok(merged)
    }

    /// Texts to encode for `mention`, per the configured [`QueryMode`].
    fn query_texts(&self, mention: &str) -> Vec<String> {
        let mut variants = self.normalizer.normalize(mention);
        if variants.is_empty() {
            // Blank mentions still reach the encoder, which rejects them.
            return vec![mention.to_string()];
        }
        if self.config.query_mode == QueryMode::FirstVariant {
            variants.truncate(1);
        }
        variants
    }

    /// Loaded types among `expected`, deduplicated in name order.
    fn searchable_types<S: AsRef<str>>(&self, expected: &[S]) -> Vec<EntityType> {
        if expected.is_empty() {
            return self.store.entity_types().collect();
        }
        let mut types = Vec::with_capacity(expected.len());
        for name in expected {
            let name = name.as_ref();
            match name.parse::<EntityType>() {
                Ok(entity_type) if self.store.get(entity_type).is_some() => {
                    types.push(entity_type);
                }
                Ok(entity_type) => {
                    tracing::debug!(%entity_type, "skipping type without a loaded index");
                }
                Err(_) => tracing::debug!(name, "skipping unknown entity type"),
            }
        }
        types.sort_unstable();
        types.dedup();
        types
    }
}
