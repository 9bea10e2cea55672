//! Core types and error kinds for kglink.

/// Coarse category partitioning the search space.
///
/// Variants are declared in name order so the derived `Ord` matches the
/// lexical order of [`EntityType::as_str`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Disease,
    Drug,
    Protein,
}

impl EntityType {
    /// Every known entity type, in name order.
    pub const ALL: [EntityType; 3] = [EntityType::Disease, EntityType::Drug, EntityType::Protein];

    /// Lowercase name used in directory names, config and output records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Disease => "disease",
            EntityType::Drug => "drug",
            EntityType::Protein => "protein",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disease" => Ok(EntityType::Disease),
            "drug" => Ok(EntityType::Drug),
            "protein" => Ok(EntityType::Protein),
            other => Err(Error::UnknownEntityType(other.to_string())),
        }
    }
}

/// One `(id, name)` row of a type index. Row `i` describes vector `i`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanonicalEntry {
    /// Canonical identifier in the knowledge base.
    pub id: String,
    /// Surface form that was embedded for this row.
    #[serde(rename = "name")]
    pub display_name: String,
    pub entity_type: EntityType,
}

/// Identity of the encoder that produced a set of vectors.
///
/// Persisted next to every index so that a store built with one encoder is
/// never queried with another.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncoderIdentity {
    /// Model name, repository id or algorithm tag.
    pub model: String,
    /// Output dimension.
    pub dim: usize,
    /// Maximum number of tokens per text before truncation.
    pub max_len: usize,
    /// Pooling strategy, e.g. `mean`.
    pub pooling: String,
}

impl std::fmt::Display for EncoderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (dim={}, max_len={}, pooling={})",
            self.model, self.dim, self.max_len, self.pooling
        )
    }
}

/// A scored candidate referent for a mention.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LinkCandidate {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    /// Cosine similarity between the query and the row's vector.
    pub score: f32,
}

/// Errors produced by the kglink library crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Normalization config is missing or malformed.
    #[error("invalid normalization config: {0}")]
    Config(String),

    /// Dictionary input matches no supported shape or yields no pairs.
    #[error("unsupported dictionary: {0}")]
    DictionaryShape(String),

    /// A persisted type index is missing, unreadable or incompatible.
    #[error("index for `{entity_type}` unavailable: {reason}")]
    IndexUnavailable {
        entity_type: EntityType,
        reason: String,
    },

    /// The encoder could not produce a vector.
    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),

    /// Rows and vectors handed to an index disagree.
    #[error("index layout violation: {0}")]
    Layout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
