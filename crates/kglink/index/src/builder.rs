//! Offline construction of type indices from canonical dictionaries.

use rayon::prelude::*;

use kglink_core::{CanonicalEntry, EncoderIdentity, EntityType};
use kglink_dict::{DictionaryShape, Pair, ParsedDictionary};

/// Default number of names encoded per batch.
pub const DEFAULT_BATCH_SIZE: usize = 64;

const PROGRESS_EVERY: usize = 50;

/// Counts for one build, persisted in `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildReport {
    pub entity_type: EntityType,
    pub shape: DictionaryShape,
    pub pairs_seen: usize,
    pub pairs_dropped: usize,
    pub pairs_loaded: usize,
    pub pairs_after_dedup: usize,
    pub vectors_written: usize,
    pub dim: usize,
    pub encoder: EncoderIdentity,
}

impl std::fmt::Display for BuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} dictionary, {} pairs loaded ({} dropped), {} after dedup, {} vectors of dim {} [{}]",
            self.entity_type,
            self.shape,
            self.pairs_loaded,
            self.pairs_dropped,
            self.pairs_after_dedup,
            self.vectors_written,
            self.dim,
            self.encoder.model
        )
    }
}

/// Encodes dictionary names into a [`crate::TypeIndex`].
pub struct IndexBuilder<'a> {
    encoder: &'a dyn kglink_embed::Encoder,
    batch_size: usize,
    parallel: bool,
}

impl<'a> IndexBuilder<'a> {
    #[must_use]
    pub fn new(encoder: &'a dyn kglink_embed::Encoder) -> Self {
        Self {
            encoder,
            batch_size: DEFAULT_BATCH_SIZE,
            parallel: false,
        }
    }

    /// Set the number of names per encoder call. Must be at least 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> kglink_core::Result<Self> {
        if batch_size == 0 {
            return Err(kglink_core::Error::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Encode batches on the rayon pool. Output is identical either way.
    #[must_use]
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Parse the dictionary at `path` and build an index from it.
    pub fn build_from_path(
        &self,
        entity_type: EntityType,
        path: &std::path::Path,
    ) -> kglink_core::Result<(crate::TypeIndex, BuildReport)> {
        let dictionary = kglink_dict::parse_path(path)?;
        self.build(entity_type, &dictionary)
    }

    /// Encode every pair of `dictionary` and build the index for `entity_type`.
    pub fn build(
        &self,
        entity_type: EntityType,
        dictionary: &ParsedDictionary,
    ) -> kglink_core::Result<(crate::TypeIndex, BuildReport)> {
        let identity = self.encoder.identity().clone();
        let mut index = crate::TypeIndex::new(entity_type, identity.clone());
        let batches: Vec<&[Pair]> = dictionary.pairs.chunks(self.batch_size).collect();

        tracing::info!(
            %entity_type,
            pairs = dictionary.pairs.len(),
            batches = batches.len(),
            batch_size = self.batch_size,
            parallel = self.parallel,
            encoder = %identity,
            "building type index"
        );

        if self.parallel {
            let encoded: Vec<Vec<Vec<f32>>> = batches
                .par_iter()
                .map(|batch| self.encode(batch))
                .collect::<kglink_core::Result<_>>()?;
            for (batch, vectors) in batches.iter().zip(encoded) {
                index.append(rows(entity_type, batch), vectors)?;
            }
        } else {
            for (i, batch) in batches.iter().enumerate() {
                let vectors = self.encode(batch)?;
                index.append(rows(entity_type, batch), vectors)?;
                if (i + 1) % PROGRESS_EVERY == 0 {
                    tracing::info!(
                        %entity_type,
                        batches_done = i + 1,
                        rows = index.len(),
                        "encoding progress"
                    );
                }
            }
        }

        let report = BuildReport {
            entity_type,
            shape: dictionary.shape,
            pairs_seen: dictionary.pairs_seen,
            pairs_dropped: dictionary.pairs_dropped,
            pairs_loaded: dictionary.pairs_loaded,
            pairs_after_dedup: dictionary.pairs.len(),
            vectors_written: index.len(),
            dim: index.dim(),
            encoder: identity,
        };
        tracing::info!(
            %entity_type,
            pairs_loaded = report.pairs_loaded,
            pairs_after_dedup = report.pairs_after_dedup,
            vectors_written = report.vectors_written,
            "built type index"
        );
        Ok((index, report))
    }

    fn encode(&self, batch: &[Pair]) -> kglink_core::Result<Vec<Vec<f32>>> {
        let texts: Vec<&str> = batch.iter().map(|p| p.name.as_str()).collect();
        self.encoder.encode_batch(&texts)
    }
}

fn rows(entity_type: EntityType, batch: &[Pair]) -> Vec<CanonicalEntry> {
    batch
        .iter()
        .map(|p| CanonicalEntry {
            id: p.id.clone(),
            display_name: p.name.clone(),
            entity_type,
        })
        .collect()
}

/// Persist `index` to `out_dir`, replacing any previous index there.
///
/// The index is written to a sibling staging directory and read back before
/// anything at `out_dir` is touched. The previous directory is then renamed
/// aside and the staging directory renamed into place. Each rename is atomic
/// but the pair is not: between them `out_dir` does not exist, so a concurrent
/// loader sees [`kglink_core::Error::IndexUnavailable`] rather than a mix of
/// old and new files. If the second rename fails the previous directory is
/// renamed back.
pub fn persist_replacing(
    index: &crate::TypeIndex,
    report: &BuildReport,
    out_dir: &std::path::Path,
) -> kglink_core::Result<()> {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            kglink_core::Error::Layout(format!(
                "output path {} has no directory name",
                out_dir.display()
            ))
        })?;
    let parent = match out_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let pid = std::process::id();
    let staging = parent.join(format!(".{name}.staging-{pid}"));
    let old = parent.join(format!(".{name}.old-{pid}"));

    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    let staged = crate::storage::save(index, &staging, Some(report)).and_then(|()| {
        let reloaded =
            crate::storage::load(&staging, index.entity_type(), Some(index.encoder()))?;
        if reloaded.len() == index.len() {
            Ok(())
        } else {
            Err(kglink_core::Error::Layout(format!(
                "staged index has {} rows, expected {}",
                reloaded.len(),
                index.len()
            )))
        }
    });
    if let Err(e) = staged {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let had_previous = out_dir.exists();
    if had_previous {
        if old.exists() {
            std::fs::remove_dir_all(&old)?;
        }
        std::fs::rename(out_dir, &old)?;
    }

    if let Err(e) = std::fs::rename(&staging, out_dir) {
        if had_previous {
            if let Err(restore) = std::fs::rename(&old, out_dir) {
                tracing::error!(
                    old = %old.display(),
                    "failed to restore previous index: {restore}"
                );
            }
        }
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    if had_previous {
        if let Err(e) = std::fs::remove_dir_all(&old) {
            tracing::warn!(old = %old.display(), "failed to remove previous index: {e}");
        }
    }

    tracing::info!(
        entity_type = %index.entity_type(),
        dir = %out_dir.display(),
        rows = index.len(),
        "persisted type index"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use kglink_embed::Encoder as _;

    fn encoder() -> kglink_embed::HashedNgramEncoder {
        kglink_embed::HashedNgramEncoder::new(64, 16).unwrap()
    }

    fn dictionary() -> ParsedDictionary {
        kglink_dict::parse_str(
            r#"{
                "C001": {"names": ["adalimumab", "Humira"]},
                "C002": {"name": "etanercept", "synonyms": ["Enbrel"]},
                "C003": {"names": ["infliximab", "Remicade", "REMICADE"]},
                "C004": {"aliases": "certolizumab pegol"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_id_to_names_builds_one_row_per_name() {
        let encoder = encoder();
        let parsed = kglink_dict::parse_str(r#"{"C001": {"names": ["adalimumab", "Humira"]}}"#)
            .unwrap();
        let (index, report) = IndexBuilder::new(&encoder)
            .build(EntityType::Drug, &parsed)
            .unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.rows().iter().all(|r| r.id == "C001"));
        assert_eq!(report.vectors_written, 2);
        assert_eq!(report.pairs_after_dedup, 2);
        assert_eq!(report.shape, DictionaryShape::IdToNames);
    }

    #[test]
    fn test_rows_follow_dictionary_order() {
        let encoder = encoder();
        let parsed = dictionary();
        let (index, report) = IndexBuilder::new(&encoder)
            .build(EntityType::Drug, &parsed)
            .unwrap();

        let names: Vec<_> = index.rows().iter().map(|r| r.display_name.as_str()).collect();
        let expected: Vec<_> = parsed.pairs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, expected);
        assert_eq!(report.pairs_loaded, 8);
        assert_eq!(report.pairs_after_dedup, 7);
    }

    #[test]
    fn test_every_row_is_its_own_nearest_neighbor() {
        let encoder = encoder();
        let (index, _) = IndexBuilder::new(&encoder)
            .build(EntityType::Drug, &dictionary())
            .unwrap();

        for (position, row) in index.rows().iter().enumerate() {
            let query = encoder.encode(&row.display_name).unwrap();
            let hits = index.search(&query, 1).unwrap();
            assert_eq!(hits[0].position, position, "row {}", row.display_name);
            assert!((hits[0].score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let encoder = encoder();
        let parsed = dictionary();
        let (sequential, _) = IndexBuilder::new(&encoder)
            .with_batch_size(2)
            .unwrap()
            .build(EntityType::Drug, &parsed)
            .unwrap();
        let (parallel, _) = IndexBuilder::new(&encoder)
            .with_batch_size(2)
            .unwrap()
            .parallel(true)
            .build(EntityType::Drug, &parsed)
            .unwrap();

        assert_eq!(sequential.rows(), parallel.rows());
        assert_eq!(sequential.vectors(), parallel.vectors());
    }

    #[test]
    fn test_batch_size_does_not_change_output() {
        let encoder = encoder();
        let parsed = dictionary();
        let (one, _) = IndexBuilder::new(&encoder)
            .with_batch_size(1)
            .unwrap()
            .build(EntityType::Drug, &parsed)
            .unwrap();
        let (many, _) = IndexBuilder::new(&encoder)
            .build(EntityType::Drug, &parsed)
            .unwrap();

        assert_eq!(one.rows(), many.rows());
        for (a, b) in one.vectors().iter().zip(many.vectors().iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let encoder = encoder();
        assert!(matches!(
            IndexBuilder::new(&encoder).with_batch_size(0),
            Err(kglink_core::Error::Config(_))
        ));
    }

    #[test]
    fn test_persist_and_reload() {
        let encoder = encoder();
        let (index, report) = IndexBuilder::new(&encoder)
            .build(EntityType::Drug, &dictionary())
            .unwrap();

        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("drug");
        persist_replacing(&index, &report, &out).unwrap();

        let loaded = crate::storage::load(&out, EntityType::Drug, Some(encoder.identity())).unwrap();
        assert_eq!(loaded.rows(), index.rows());
        let meta = crate::storage::read_meta(&out).unwrap();
        assert_eq!(meta.build, Some(report));

        // Only the final directory remains next to it.
        let entries: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_persist_replaces_previous_index() {
        let encoder = encoder();
        let builder = IndexBuilder::new(&encoder);
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("drug");

        let (first, first_report) = builder.build(EntityType::Drug, &dictionary()).unwrap();
        persist_replacing(&first, &first_report, &out).unwrap();

        let smaller = kglink_dict::parse_str(r#"[{"id": "C009", "name": "golimumab"}]"#).unwrap();
        let (second, second_report) = builder.build(EntityType::Drug, &smaller).unwrap();
        persist_replacing(&second, &second_report, &out).unwrap();

        let loaded = crate::storage::load(&out, EntityType::Drug, None).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.rows()[0].id, "C009");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_persist_clears_leftovers_from_interrupted_run() {
        let encoder = encoder();
        let (index, report) = IndexBuilder::new(&encoder)
            .build(EntityType::Drug, &dictionary())
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("drug");
        persist_replacing(&index, &report, &out).unwrap();

        let pid = std::process::id();
        for leftover in [format!(".drug.staging-{pid}"), format!(".drug.old-{pid}")] {
            let dir = root.path().join(leftover);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("vectors.bin"), b"partial").unwrap();
        }

        persist_replacing(&index, &report, &out).unwrap();

        let loaded = crate::storage::load(&out, EntityType::Drug, None).unwrap();
        assert_eq!(loaded.rows(), index.rows());
        let names: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("drug")]);
    }
}
