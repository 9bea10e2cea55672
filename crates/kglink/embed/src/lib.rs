//! Text encoders producing unit-length vectors for inner-product search.
//!
//! Every encoder pools token states over the valid (non-padding) positions
//! only and L2-normalizes the result, so the inner product of two outputs is
//! their cosine similarity.

pub mod hashed;

pub use hashed::HashedNgramEncoder;

/// Lower bound for the number of valid tokens when mean pooling.
pub const MIN_TOKEN_COUNT: f32 = 1e-9;

/// Maps text to unit-length vectors.
///
/// Implementations take `&self` and must be safe to share across threads: one
/// instance is built at startup and handed to both the index builder and the
/// linker.
pub trait Encoder: Send + Sync {
    /// Identity recorded in every index built with this encoder.
    fn identity(&self) -> &kglink_core::EncoderIdentity;

    /// Encode a batch of texts, one unit vector per text, in input order.
    ///
    /// Blank texts are an error rather than a zero vector.
    fn encode_batch(&self, texts: &[&str]) -> kglink_core::Result<Vec<Vec<f32>>>;

    /// Output dimension.
    fn dim(&self) -> usize {
        self.identity().dim
    }

    /// Encode a single text.
    fn encode(&self, text: &str) -> kglink_core::Result<Vec<f32>> {
        self.encode_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| kglink_core::Error::Encoding("encoder returned no vector".to_string()))
    }
}

/// Reject blank input before it reaches a model.
pub fn ensure_encodable(texts: &[&str]) -> kglink_core::Result<()> {
    if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
        return Err(kglink_core::Error::Encoding(format!(
            "text at batch position {pos} is blank"
        )));
    }
    Ok(())
}

/// Mean-pool token states over valid positions.
///
/// `hidden` has shape `[batch, seq, dim]` and `mask` has shape `[batch, seq]`
/// with `1` for real tokens and `0` for padding. The divisor is the mask sum
/// floored at [`MIN_TOKEN_COUNT`].
pub fn mean_pool(
    hidden: ndarray::ArrayView3<'_, f32>,
    mask: ndarray::ArrayView2<'_, u32>,
) -> kglink_core::Result<ndarray::Array2<f32>> {
    let (batch, seq, dim) = hidden.dim();
    if mask.dim() != (batch, seq) {
        return Err(kglink_core::Error::Encoding(format!(
            "mask shape {:?} does not match hidden states [{batch}, {seq}, {dim}]",
            mask.dim()
        )));
    }

    let mut pooled = ndarray::Array2::<f32>::zeros((batch, dim));
    for b in 0..batch {
        let mut count = 0.0_f32;
        let mut row = pooled.row_mut(b);
        for s in 0..seq {
            if mask[[b, s]] == 0 {
                continue;
            }
            count += 1.0;
            row += &hidden.slice(ndarray::s![b, s, ..]);
        }
        row /= count.max(MIN_TOKEN_COUNT);
    }
    Ok(pooled)
}

/// L2-normalize a vector in place. A zero or non-finite norm is an error.
pub fn l2_normalize(v: &mut [f32]) -> kglink_core::Result<()> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return Err(kglink_core::Error::Encoding(format!(
            "cannot normalize vector with norm {norm}"
        )));
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(())
}

/// Convert pooled rows into normalized vectors.
pub fn normalized_rows(pooled: ndarray::Array2<f32>) -> kglink_core::Result<Vec<Vec<f32>>> {
    pooled
        .outer_iter()
        .map(|row| {
            let mut v = row.to_vec();
            l2_normalize(&mut v)?;
            Ok(v)
        })
        .collect()
}

/// Inner product of two equally sized vectors.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
