//! On-disk layout of one type index.
//!
//! A type index directory holds three files:
//! - `vectors.bin`: header plus row-major little-endian f32 vectors
//! - `rows.jsonl`: one row per line, line `i` describes vector `i`
//! - `meta.json`: encoder identity, counts and the build report
//!
//! `meta.json` is written last. Loading cross-checks all three files and
//! refuses an index whose encoder differs from the caller's.

use std::io::{BufRead as _, Write as _};

use kglink_core::{CanonicalEntry, EncoderIdentity, EntityType};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const ROWS_FILE: &str = "rows.jsonl";
pub const META_FILE: &str = "meta.json";

/// Magic bytes for vector file validation.
const VECTORS_MAGIC: u32 = 0x4B47_4C56; // "KGLV"
const FORMAT_VERSION: u32 = 1;

/// Header: 4 bytes magic + 4 bytes version + 4 bytes dim + 8 bytes count = 20 bytes
const HEADER_SIZE: usize = 20;

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexMeta {
    pub format_version: u32,
    pub entity_type: EntityType,
    pub encoder: EncoderIdentity,
    pub dim: usize,
    pub count: usize,
    #[serde(default)]
    pub build: Option<crate::BuildReport>,
}

/// Write `index` into `dir`, creating it if needed.
pub fn save(
    index: &crate::TypeIndex,
    dir: &std::path::Path,
    report: Option<&crate::BuildReport>,
) -> kglink_core::Result<()> {
    std::fs::create_dir_all(dir)?;

    write_vectors(index, &dir.join(VECTORS_FILE))?;
    write_rows(index.rows(), &dir.join(ROWS_FILE))?;

    let meta = IndexMeta {
        format_version: FORMAT_VERSION,
        entity_type: index.entity_type(),
        encoder: index.encoder().clone(),
        dim: index.dim(),
        count: index.len(),
        build: report.cloned(),
    };
    let file = std::fs::File::create(dir.join(META_FILE))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &meta)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    tracing::debug!(dir = %dir.display(), count = meta.count, "saved type index");
    Ok(())
}

fn write_vectors(index: &crate::TypeIndex, path: &std::path::Path) -> kglink_core::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::with_capacity(64 * 1024, file);

    let dim = u32::try_from(index.dim())
        .map_err(|_| kglink_core::Error::Layout(format!("dim {} too large", index.dim())))?;
    writer.write_all(&VECTORS_MAGIC.to_le_bytes())?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&dim.to_le_bytes())?;
    writer.write_all(&(index.len() as u64).to_le_bytes())?;

    for &val in index.vectors() {
        writer.write_all(&val.to_le_bytes())?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn write_rows(rows: &[CanonicalEntry], path: &std::path::Path) -> kglink_core::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read only `meta.json`.
pub fn read_meta(dir: &std::path::Path) -> kglink_core::Result<IndexMeta> {
    let text = std::fs::read_to_string(dir.join(META_FILE))?;
    Ok(serde_json::from_str(&text)?)
}

/// Load the index for `entity_type` from `dir`.
///
/// When `expected` is given, the persisted encoder identity must equal it.
/// Every failure is reported as [`kglink_core::Error::IndexUnavailable`].
pub fn load(
    dir: &std::path::Path,
    entity_type: EntityType,
    expected: Option<&EncoderIdentity>,
) -> kglink_core::Result<crate::TypeIndex> {
    let unavailable = |reason: String| kglink_core::Error::IndexUnavailable {
        entity_type,
        reason,
    };

    let meta = read_meta(dir)
        .map_err(|e| unavailable(format!("cannot read {META_FILE}: {e}")))?;
    if meta.format_version != FORMAT_VERSION {
        return Err(unavailable(format!(
            "format version {} is not supported (expected {FORMAT_VERSION})",
            meta.format_version
        )));
    }
    if meta.entity_type != entity_type {
        return Err(unavailable(format!(
            "directory holds a `{}` index",
            meta.entity_type
        )));
    }
    if let Some(expected) = expected {
        if &meta.encoder != expected {
            return Err(unavailable(format!(
                "built with encoder {}, serving encoder is {expected}",
                meta.encoder
            )));
        }
    }
    if meta.dim != meta.encoder.dim {
        return Err(unavailable(format!(
            "meta dim {} disagrees with encoder dim {}",
            meta.dim, meta.encoder.dim
        )));
    }

    let vectors = read_vectors(&dir.join(VECTORS_FILE), &meta).map_err(unavailable)?;
    let rows = read_rows(&dir.join(ROWS_FILE)).map_err(unavailable)?;

    if rows.len() != meta.count {
        return Err(unavailable(format!(
            "{ROWS_FILE} has {} rows but {VECTORS_FILE} has {} vectors",
            rows.len(),
            meta.count
        )));
    }

    let index = crate::TypeIndex::from_parts(entity_type, meta.encoder, vectors, rows)
        .map_err(|e| unavailable(e.to_string()))?;

    tracing::info!(
        %entity_type,
        rows = index.len(),
        dim = index.dim(),
        dir = %dir.display(),
        "loaded type index"
    );
    Ok(index)
}

fn read_vectors(
    path: &std::path::Path,
    meta: &IndexMeta,
) -> Result<ndarray::Array2<f32>, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    if bytes.len() < HEADER_SIZE {
        return Err(format!("{VECTORS_FILE} is truncated ({} bytes)", bytes.len()));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let dim = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..20]);
    let count = usize::try_from(u64::from_le_bytes(count_bytes))
        .map_err(|_| format!("{VECTORS_FILE} count does not fit in memory"))?;

    if magic != VECTORS_MAGIC {
        return Err(format!(
            "invalid vector file magic: expected {VECTORS_MAGIC:#x}, got {magic:#x}"
        ));
    }
    if version != FORMAT_VERSION {
        return Err(format!(
            "unsupported vector file version: expected {FORMAT_VERSION}, got {version}"
        ));
    }
    if dim != meta.dim || count != meta.count {
        return Err(format!(
            "{VECTORS_FILE} holds {count}x{dim}, {META_FILE} says {}x{}",
            meta.count, meta.dim
        ));
    }

    let expected_len = count
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .ok_or_else(|| format!("{VECTORS_FILE} size overflows"))?;
    if bytes.len() != expected_len {
        return Err(format!(
            "{VECTORS_FILE} is {} bytes, expected {expected_len} for {count}x{dim}",
            bytes.len()
        ));
    }

    let data: Vec<f32> = bytes[HEADER_SIZE..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    ndarray::Array2::from_shape_vec((count, dim), data).map_err(|e| e.to_string())
}

fn read_rows(path: &std::path::Path) -> Result<Vec<CanonicalEntry>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut rows = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("{ROWS_FILE}:{}: {e}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: CanonicalEntry = serde_json::from_str(&line)
            .map_err(|e| format!("{ROWS_FILE}:{}: {e}", line_no + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{entry, identity};

    fn sample() -> crate::TypeIndex {
        let mut index = crate::TypeIndex::new(EntityType::Protein, identity(3));
        index
            .append(
                vec![
                    entry("P001", "CTLA4 protein", EntityType::Protein),
                    entry("P002", "CD274 protein", EntityType::Protein),
                ],
                vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.6, 0.8]],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_save_load_preserves_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample();
        save(&index, dir.path(), None).unwrap();

        let loaded = load(dir.path(), EntityType::Protein, Some(&identity(3))).unwrap();
        assert_eq!(loaded.rows(), index.rows());
        for position in 0..loaded.len() {
            let query = loaded.vector(position).unwrap().to_vec();
            assert_eq!(query, index.vector(position).unwrap().to_vec());
            let hits = loaded.search(&query, 1).unwrap();
            assert_eq!(hits[0].position, position);
            assert!((hits[0].score - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_rejects_encoder_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        save(&sample(), dir.path(), None).unwrap();

        let mut other = identity(3);
        other.model = "another-model".to_string();
        let err = load(dir.path(), EntityType::Protein, Some(&other)).unwrap_err();
        assert!(matches!(
            err,
            kglink_core::Error::IndexUnavailable {
                entity_type: EntityType::Protein,
                ..
            }
        ));
    }

    #[test]
    fn test_load_rejects_row_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        save(&sample(), dir.path(), None).unwrap();

        // Drop the last row: rows and vectors no longer line up.
        let rows_path = dir.path().join(ROWS_FILE);
        let text = std::fs::read_to_string(&rows_path).unwrap();
        let first_line = text.lines().next().unwrap();
        std::fs::write(&rows_path, format!("{first_line}\n")).unwrap();

        let err = load(dir.path(), EntityType::Protein, None).unwrap_err();
        assert!(matches!(err, kglink_core::Error::IndexUnavailable { .. }));
    }

    #[test]
    fn test_load_rejects_truncated_vectors() {
        let dir = tempfile::tempdir().unwrap();
        save(&sample(), dir.path(), None).unwrap();

        let vectors_path = dir.path().join(VECTORS_FILE);
        let bytes = std::fs::read(&vectors_path).unwrap();
        std::fs::write(&vectors_path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(load(dir.path(), EntityType::Protein, None).is_err());
    }

    #[test]
    fn test_load_rejects_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        save(&sample(), dir.path(), None).unwrap();
        let vectors_path = dir.path().join(VECTORS_FILE);
        let pristine = std::fs::read(&vectors_path).unwrap();

        // Magic, then version.
        for offset in [0, 4] {
            let mut bytes = pristine.clone();
            bytes[offset] ^= 0xFF;
            std::fs::write(&vectors_path, &bytes).unwrap();
            let err = load(dir.path(), EntityType::Protein, None).unwrap_err();
            assert!(matches!(err, kglink_core::Error::IndexUnavailable { .. }));
        }

        std::fs::write(&vectors_path, &pristine[..HEADER_SIZE - 1]).unwrap();
        assert!(load(dir.path(), EntityType::Protein, None).is_err());

        std::fs::write(&vectors_path, &pristine).unwrap();
        assert_eq!(load(dir.path(), EntityType::Protein, None).unwrap().len(), 2);
    }

    #[test]
    fn test_load_rejects_wrong_type_directory() {
        let dir = tempfile::tempdir().unwrap();
        save(&sample(), dir.path(), None).unwrap();
        assert!(load(dir.path(), EntityType::Drug, None).is_err());
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope"), EntityType::Drug, None).unwrap_err();
        assert!(matches!(err, kglink_core::Error::IndexUnavailable { .. }));
    }
}
