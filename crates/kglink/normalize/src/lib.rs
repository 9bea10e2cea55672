//! Rule-driven name normalization.
//!
//! A mention is turned into an ordered list of surface-form variants:
//!
//! 1. configured prefix patterns are stripped, in order
//! 2. the base form applies NFKC, lowercasing and whitespace collapse (each optional)
//! 3. literal substitution rules rewrite the base form, each step yielding a variant
//! 4. a title-cased copy of the base form is added
//!
//! The raw mention comes first, and the list is deduplicated case-insensitively
//! keeping the first occurrence.

use unicode_normalization::UnicodeNormalization as _;

/// Declarative normalization rules, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizationConfig {
    #[serde(default = "default_true")]
    pub unicode_nfkc: bool,
    #[serde(default = "default_true")]
    pub lowercase: bool,
    #[serde(default = "default_true")]
    pub dedupe_whitespace: bool,
    /// Regular expressions removed from the mention, matched case-insensitively.
    #[serde(default)]
    pub prefix_strippers: Vec<String>,
    #[serde(default)]
    pub variants: Vec<VariantRule>,
}

/// One substitution step applied to the base form.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantRule {
    /// Literal `[from, to]` substitution.
    #[serde(default)]
    pub replace: Option<Vec<String>>,
    /// Collapse runs of whitespace after the substitution.
    #[serde(default)]
    pub collapse_spaces: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            unicode_nfkc: true,
            lowercase: true,
            dedupe_whitespace: true,
            prefix_strippers: Vec::new(),
            variants: Vec::new(),
        }
    }
}

/// Compiled normalizer. Immutable once built and safe to share across threads.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    config: NormalizationConfig,
    prefixes: Vec<regex::Regex>,
}

impl NameNormalizer {
    /// Compile a normalizer, validating every rule up front.
    pub fn new(config: NormalizationConfig) -> kglink_core::Result<Self> {
        let prefixes = config
            .prefix_strippers
            .iter()
            .map(|pattern| {
                regex::RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        kglink_core::Error::Config(format!("prefix pattern `{pattern}`: {e}"))
                    })
            })
            .collect::<kglink_core::Result<Vec<_>>>()?;

        for (i, rule) in config.variants.iter().enumerate() {
            match rule.replace.as_deref() {
                None => {}
                Some([from, _]) if from.is_empty() => {
                    return Err(kglink_core::Error::Config(format!(
                        "variant rule {i} replaces an empty string"
                    )));
                }
                Some([_, _]) => {}
                Some(other) => {
                    return Err(kglink_core::Error::Config(format!(
                        "variant rule {i}: `replace` needs exactly two strings, got {}",
                        other.len()
                    )));
                }
            }
        }

        tracing::debug!(
            prefixes = prefixes.len(),
            variants = config.variants.len(),
            "compiled name normalizer"
        );

        Ok(Self { config, prefixes })
    }

    /// Parse and compile a YAML config document.
    pub fn from_yaml_str(yaml: &str) -> kglink_core::Result<Self> {
        // An empty document means "all defaults".
        if yaml.trim().is_empty() {
            return Self::new(NormalizationConfig::default());
        }
        let config: NormalizationConfig = serde_yaml::from_str(yaml)
            .map_err(|e| kglink_core::Error::Config(e.to_string()))?;
        Self::new(config)
    }

    /// Load a YAML config file.
    pub fn from_path(path: &std::path::Path) -> kglink_core::Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            kglink_core::Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&yaml)
    }

    #[must_use]
    pub fn config(&self) -> &NormalizationConfig {
        &self.config
    }

    /// Produce the ordered variant list for a mention. Blank input yields nothing.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> Vec<String> {
        if raw.trim().is_empty() {
            return Vec::new();
        }

        let mut stripped = raw.to_string();
        for prefix in &self.prefixes {
            stripped = prefix.replace_all(&stripped, "").into_owned();
        }

        let base = self.base(&stripped);
        let variants = self.variants(&base);
        let titled = title_case(&base);

        let mut seen = std::collections::HashSet::new();
        std::iter::once(raw.to_string())
            .chain(std::iter::once(base))
            .chain(variants)
            .chain(std::iter::once(titled))
            .filter(|candidate| !candidate.trim().is_empty())
            .filter(|candidate| seen.insert(candidate.to_lowercase()))
            .collect()
    }

    /// Base canonical form: NFKC, lowercase and whitespace collapse per config, trimmed.
    #[must_use]
    pub fn base(&self, s: &str) -> String {
        let mut out: String = if self.config.unicode_nfkc {
            s.nfkc().collect()
        } else {
            s.to_string()
        };
        if self.config.lowercase {
            out = out.to_lowercase();
        }
        if self.config.dedupe_whitespace {
            out = collapse_whitespace(&out);
        }
        out.trim().to_string()
    }

    /// Chained substitutions over the base form; every intermediate result is a variant.
    fn variants(&self, base: &str) -> Vec<String> {
        let mut current = base.to_string();
        let mut out = Vec::with_capacity(self.config.variants.len());
        for rule in &self.config.variants {
            if let Some([from, to]) = rule.replace.as_deref() {
                current = current.replace(from.as_str(), to);
            }
            if rule.collapse_spaces {
                current = collapse_whitespace(&current);
            }
            out.push(current.trim().to_string());
        }
        out
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Title-case: a cased letter is upper-cased when it follows a non-letter,
/// lower-cased otherwise. `il-6 receptor` becomes `Il-6 Receptor`.
#[must_use]
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_cased = false;
    for c in s.chars() {
        let cased = c.is_lowercase() || c.is_uppercase();
        if cased && !prev_cased {
            out.extend(c.to_uppercase());
        } else if cased {
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
        prev_cased = cased;
    }
    out
}
