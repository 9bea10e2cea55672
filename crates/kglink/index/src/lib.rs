//! Per-type vector indices with position-aligned metadata rows.
//!
//! A [`TypeIndex`] holds N unit vectors and N [`kglink_core::CanonicalEntry`]
//! rows for one entity type; row `i` always describes vector `i`. Rows and
//! vectors only enter an index together through [`TypeIndex::append`], and
//! nothing mutates an index after it is built or loaded.

pub mod builder;
pub mod storage;
pub mod store;

pub use builder::{BuildReport, IndexBuilder, persist_replacing};
pub use store::{IndexStore, LoadFailure};

use kglink_core::{CanonicalEntry, EncoderIdentity, EntityType};

/// A search hit: a row position and its inner-product score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub position: usize,
    pub score: f32,
}

/// Exact inner-product index over the vectors of one entity type.
#[derive(Debug, Clone)]
pub struct TypeIndex {
    entity_type: EntityType,
    encoder: EncoderIdentity,
    /// Shape: [len, dim]
    vectors: ndarray::Array2<f32>,
    rows: Vec<CanonicalEntry>,
}

impl TypeIndex {
    /// Create an empty index for vectors produced by `encoder`.
    #[must_use]
    pub fn new(entity_type: EntityType, encoder: EncoderIdentity) -> Self {
        let dim = encoder.dim;
        Self {
            entity_type,
            encoder,
            vectors: ndarray::Array2::zeros((0, dim)),
            rows: Vec::new(),
        }
    }

    /// Assemble an index from a vector matrix and its rows, checking alignment.
    pub fn from_parts(
        entity_type: EntityType,
        encoder: EncoderIdentity,
        vectors: ndarray::Array2<f32>,
        rows: Vec<CanonicalEntry>,
    ) -> kglink_core::Result<Self> {
        if vectors.nrows() != rows.len() {
            return Err(kglink_core::Error::Layout(format!(
                "{} vectors but {} rows",
                vectors.nrows(),
                rows.len()
            )));
        }
        if vectors.ncols() != encoder.dim {
            return Err(kglink_core::Error::Layout(format!(
                "vector dim {} does not match encoder dim {}",
                vectors.ncols(),
                encoder.dim
            )));
        }
        check_row_types(entity_type, &rows)?;
        Ok(Self {
            entity_type,
            encoder,
            vectors,
            rows,
        })
    }

    /// Append rows and their vectors, in order.
    ///
    /// Everything is validated before anything is written, so a rejected batch
    /// leaves the index untouched.
    pub fn append(
        &mut self,
        rows: Vec<CanonicalEntry>,
        vectors: Vec<Vec<f32>>,
    ) -> kglink_core::Result<()> {
        if rows.len() != vectors.len() {
            return Err(kglink_core::Error::Layout(format!(
                "batch has {} rows but {} vectors",
                rows.len(),
                vectors.len()
            )));
        }
        let dim = self.dim();
        if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dim) {
            return Err(kglink_core::Error::Layout(format!(
                "vector {i} of batch has dim {}, expected {dim}",
                v.len()
            )));
        }
        check_row_types(self.entity_type, &rows)?;

        for v in &vectors {
            self.vectors
                .push_row(ndarray::ArrayView1::from(v.as_slice()))
                .map_err(|e| kglink_core::Error::Layout(e.to_string()))?;
        }
        self.rows.extend(rows);
        Ok(())
    }

    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    #[must_use]
    pub fn encoder(&self) -> &EncoderIdentity {
        &self.encoder
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.encoder.dim
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of stored vectors. Always equal to [`TypeIndex::len`].
    #[must_use]
    pub fn vector_count(&self) -> usize {
        self.vectors.nrows()
    }

    #[must_use]
    pub fn rows(&self) -> &[CanonicalEntry] {
        &self.rows
    }

    #[must_use]
    pub fn row(&self, position: usize) -> Option<&CanonicalEntry> {
        self.rows.get(position)
    }

    /// The stored vector at `position`.
    #[must_use]
    pub fn vector(&self, position: usize) -> Option<ndarray::ArrayView1<'_, f32>> {
        (position < self.vectors.nrows()).then(|| self.vectors.row(position))
    }

    pub(crate) fn vectors(&self) -> &ndarray::Array2<f32> {
        &self.vectors
    }

    /// Exact top-`k` search by inner product.
    ///
    /// Hits are ordered by score descending, then by position ascending.
    pub fn search(&self, query: &[f32], k: usize) -> kglink_core::Result<Vec<Hit>> {
        if query.len() != self.dim() {
            return Err(kglink_core::Error::Encoding(format!(
                "query has dim {}, `{}` index expects {}",
                query.len(),
                self.entity_type,
                self.dim()
            )));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let scores = self.vectors.dot(&ndarray::ArrayView1::from(query));
        let mut hits: Vec<Hit> = scores
            .iter()
            .enumerate()
            .map(|(position, &score)| Hit { position, score })
            .collect();

        let by_rank = |a: &Hit, b: &Hit| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.position.cmp(&b.position))
        };
        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, by_rank);
            hits.truncate(k);
        }
        hits.sort_unstable_by(by_rank);
        Ok(hits)
    }
}

fn check_row_types(entity_type: EntityType, rows: &[CanonicalEntry]) -> kglink_core::Result<()> {
    if let Some(row) = rows.iter().find(|r| r.entity_type != entity_type) {
        return Err(kglink_core::Error::Layout(format!(
            "row `{}` has type `{}` in a `{entity_type}` index",
            row.id, row.entity_type
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn identity(dim: usize) -> EncoderIdentity {
        EncoderIdentity {
            model: "test".to_string(),
            dim,
            max_len: 8,
            pooling: "mean".to_string(),
        }
    }

    pub(crate) fn entry(id: &str, name: &str, entity_type: EntityType) -> CanonicalEntry {
        CanonicalEntry {
            id: id.to_string(),
            display_name: name.to_string(),
            entity_type,
        }
    }

    fn small_index() -> TypeIndex {
        let mut index = TypeIndex::new(EntityType::Drug, identity(2));
        index
            .append(
                vec![
                    entry("C1", "a", EntityType::Drug),
                    entry("C2", "b", EntityType::Drug),
                    entry("C3", "c", EntityType::Drug),
                ],
                vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_score() {
        let index = small_index();
        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let positions: Vec<_> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![0, 2, 1]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_search_truncates_to_k() {
        let index = small_index();
        assert_eq!(index.search(&[0.0, 1.0], 1).unwrap().len(), 1);
        assert_eq!(index.search(&[0.0, 1.0], 10).unwrap().len(), 3);
        assert!(index.search(&[0.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_ties_break_by_position() {
        let mut index = TypeIndex::new(EntityType::Protein, identity(2));
        index
            .append(
                vec![
                    entry("P2", "x", EntityType::Protein),
                    entry("P1", "y", EntityType::Protein),
                ],
                vec![vec![1.0, 0.0], vec![1.0, 0.0]],
            )
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].position, 0);
    }

    #[test]
    fn test_row_correspondence() {
        let index = small_index();
        for position in 0..index.len() {
            let query = index.vector(position).unwrap().to_vec();
            let hits = index.search(&query, 1).unwrap();
            assert_eq!(hits[0].position, position);
            assert!((hits[0].score - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_append_rejects_misaligned_batch() {
        let mut index = small_index();
        let err = index
            .append(vec![entry("C4", "d", EntityType::Drug)], vec![])
            .unwrap_err();
        assert!(matches!(err, kglink_core::Error::Layout(_)));
        assert_eq!(index.len(), 3);
        assert_eq!(index.vectors().nrows(), 3);
    }

    #[test]
    fn test_append_rejects_wrong_dim_without_partial_write() {
        let mut index = small_index();
        let err = index
            .append(
                vec![
                    entry("C4", "d", EntityType::Drug),
                    entry("C5", "e", EntityType::Drug),
                ],
                vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]],
            )
            .unwrap_err();
        assert!(matches!(err, kglink_core::Error::Layout(_)));
        assert_eq!(index.len(), 3);
        assert_eq!(index.vectors().nrows(), 3);
    }

    #[test]
    fn test_append_rejects_foreign_type() {
        let mut index = small_index();
        assert!(index
            .append(vec![entry("D1", "x", EntityType::Disease)], vec![vec![1.0, 0.0]])
            .is_err());
    }

    #[test]
    fn test_query_dim_mismatch_is_error() {
        let index = small_index();
        assert!(index.search(&[1.0, 0.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_from_parts_checks_counts() {
        let vectors = ndarray::Array2::<f32>::zeros((2, 2));
        let rows = vec![entry("C1", "a", EntityType::Drug)];
        assert!(TypeIndex::from_parts(EntityType::Drug, identity(2), vectors, rows).is_err());
    }
}
