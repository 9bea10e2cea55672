//! Model-free encoder built from hashed character trigrams.
//!
//! Each whitespace token is lower-cased, padded with `#` and split into
//! character trigrams; every trigram adds `1` to a bucket chosen by its
//! blake3 hash. Counts never cancel, so any non-blank text has a non-zero
//! vector. Token vectors are then mean-pooled through the same
//! mask-aware pooling the transformer encoder uses. Output is deterministic
//! across runs and platforms, and names that share trigrams get a high cosine
//! similarity.

use crate::Encoder;

const MODEL_TAG: &str = "hashed-char-trigram-blake3-v2";

/// Default output dimension.
pub const DEFAULT_DIM: usize = 256;

/// Default token limit per text.
pub const DEFAULT_MAX_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct HashedNgramEncoder {
    identity: kglink_core::EncoderIdentity,
}

impl HashedNgramEncoder {
    pub fn new(dim: usize, max_len: usize) -> kglink_core::Result<Self> {
        if dim == 0 || max_len == 0 {
            return Err(kglink_core::Error::Encoding(format!(
                "hashed encoder needs dim > 0 and max_len > 0, got dim={dim} max_len={max_len}"
            )));
        }
        Ok(Self {
            identity: kglink_core::EncoderIdentity {
                model: MODEL_TAG.to_string(),
                dim,
                max_len,
                pooling: "mean".to_string(),
            },
        })
    }

    fn token_vector(&self, token: &str, out: &mut [f32]) {
        let padded: Vec<char> = std::iter::once('#')
            .chain(token.chars().flat_map(char::to_lowercase))
            .chain(std::iter::once('#'))
            .collect();

        for gram in padded.windows(3) {
            let gram: String = gram.iter().collect();
            let hash = blake3::hash(gram.as_bytes());
            let bytes = hash.as_bytes();
            let raw = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]);
            let bucket = usize::try_from(raw % self.identity.dim as u64).unwrap_or(0);
            out[bucket] += 1.0;
        }
    }
}

impl Default for HashedNgramEncoder {
    fn default() -> Self {
        Self {
            identity: kglink_core::EncoderIdentity {
                model: MODEL_TAG.to_string(),
                dim: DEFAULT_DIM,
                max_len: DEFAULT_MAX_LEN,
                pooling: "mean".to_string(),
            },
        }
    }
}

impl Encoder for HashedNgramEncoder {
    fn identity(&self) -> &kglink_core::EncoderIdentity {
        &self.identity
    }

    fn encode_batch(&self, texts: &[&str]) -> kglink_core::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        crate::ensure_encodable(texts)?;

        let dim = self.identity.dim;
        let tokenized: Vec<Vec<&str>> = texts
            .iter()
            .map(|t| t.split_whitespace().take(self.identity.max_len).collect())
            .collect();
        let seq = tokenized.iter().map(Vec::len).max().unwrap_or(0);

        // Pad every text to the longest one; padding stays masked out.
        let mut hidden = ndarray::Array3::<f32>::zeros((texts.len(), seq, dim));
        let mut mask = ndarray::Array2::<u32>::zeros((texts.len(), seq));
        for (b, tokens) in tokenized.iter().enumerate() {
            for (s, token) in tokens.iter().enumerate() {
                let mut lane = hidden.slice_mut(ndarray::s![b, s, ..]);
                let Some(slot) = lane.as_slice_mut() else {
                    return Err(kglink_core::Error::Encoding(
                        "token lane is not contiguous".to_string(),
                    ));
                };
                self.token_vector(token, slot);
                mask[[b, s]] = 1;
            }
        }

        let pooled = crate::mean_pool(hidden.view(), mask.view())?;
        crate::normalized_rows(pooled)
    }
}
