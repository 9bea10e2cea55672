//! Candle-based BERT encoder with mask-aware mean pooling.
//!
//! Produces one L2-normalized vector per text from the last hidden state of a
//! BERT-family model. The default model is SapBERT, which is trained so that
//! synonymous biomedical names land close together.
//!
//! # References
//!
//! - Model: <https://huggingface.co/cambridgeltl/SapBERT-from-PubMedBERT-fulltext>
//! - Paper: <https://aclanthology.org/2021.naacl-main.334/>

use eyre::WrapErr as _;

/// Default model repository on the HuggingFace hub.
pub const DEFAULT_MODEL: &str = "cambridgeltl/SapBERT-from-PubMedBERT-fulltext";

/// Default maximum sequence length for input tokenization.
pub const DEFAULT_MAX_LEN: usize = 64;

/// Local paths to the files a [`BertEncoder`] needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: std::path::PathBuf,
    pub weights: Weights,
    pub tokenizer: TokenizerSource,
}

/// Weight file format.
#[derive(Debug, Clone)]
pub enum Weights {
    Safetensors(std::path::PathBuf),
    Pytorch(std::path::PathBuf),
}

/// Where the tokenizer comes from.
#[derive(Debug, Clone)]
pub enum TokenizerSource {
    /// A serialized `tokenizer.json`.
    Json(std::path::PathBuf),
    /// A WordPiece `vocab.txt`, assembled into a BERT tokenizer.
    Vocab(std::path::PathBuf),
}

impl ModelFiles {
    /// Resolve files from a local model directory.
    pub fn from_dir(dir: &std::path::Path) -> eyre::Result<Self> {
        let config = dir.join("config.json");
        if !config.is_file() {
            eyre::bail!("no config.json in {}", dir.display());
        }

        let weights = if dir.join("model.safetensors").is_file() {
            Weights::Safetensors(dir.join("model.safetensors"))
        } else if dir.join("pytorch_model.bin").is_file() {
            Weights::Pytorch(dir.join("pytorch_model.bin"))
        } else {
            eyre::bail!(
                "no model.safetensors or pytorch_model.bin in {}",
                dir.display()
            );
        };

        let tokenizer = if dir.join("tokenizer.json").is_file() {
            TokenizerSource::Json(dir.join("tokenizer.json"))
        } else if dir.join("vocab.txt").is_file() {
            TokenizerSource::Vocab(dir.join("vocab.txt"))
        } else {
            eyre::bail!("no tokenizer.json or vocab.txt in {}", dir.display());
        };

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    /// Download (or reuse cached) files from the HuggingFace hub.
    pub fn from_hub(repo_id: &str) -> eyre::Result<Self> {
        use hf_hub::api::sync::Api;

        let api = Api::new().wrap_err("failed to create HuggingFace API client")?;
        let repo = api.model(repo_id.to_string());

        let config = repo
            .get("config.json")
            .wrap_err_with(|| format!("failed to download config.json from {repo_id}"))?;

        let weights = match repo.get("model.safetensors") {
            Ok(path) => Weights::Safetensors(path),
            Err(e) => {
                tracing::debug!(%repo_id, error = %e, "no safetensors weights, trying pytorch_model.bin");
                Weights::Pytorch(
                    repo.get("pytorch_model.bin")
                        .wrap_err_with(|| format!("failed to download weights from {repo_id}"))?,
                )
            }
        };

        let tokenizer = match repo.get("tokenizer.json") {
            Ok(path) => TokenizerSource::Json(path),
            Err(e) => {
                tracing::debug!(%repo_id, error = %e, "no tokenizer.json, trying vocab.txt");
                TokenizerSource::Vocab(
                    repo.get("vocab.txt")
                        .wrap_err_with(|| format!("failed to download vocab.txt from {repo_id}"))?,
                )
            }
        };

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    /// Treat `name_or_dir` as a local directory if it exists, otherwise as a hub repo id.
    pub fn resolve(name_or_dir: &str) -> eyre::Result<Self> {
        let path = std::path::Path::new(name_or_dir);
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_hub(name_or_dir)
        }
    }
}

/// A BERT encoder on candle. Safe to share across threads.
pub struct BertEncoder {
    model: candle_transformers::models::bert::BertModel,
    tokenizer: tokenizers::Tokenizer,
    device: candle_core::Device,
    identity: kglink_core::EncoderIdentity,
}

impl BertEncoder {
    /// Resolve and load a model by repo id or local directory on the default device.
    pub fn from_pretrained(name_or_dir: &str, max_len: usize) -> eyre::Result<Self> {
        let files = ModelFiles::resolve(name_or_dir)?;
        Self::load(name_or_dir, &files, max_len, default_device()?)
    }

    /// Load an encoder from resolved files.
    ///
    /// `model_name` is recorded in the encoder identity and must stay stable
    /// between building and serving an index.
    pub fn load(
        model_name: &str,
        files: &ModelFiles,
        max_len: usize,
        device: candle_core::Device,
    ) -> eyre::Result<Self> {
        if max_len == 0 {
            eyre::bail!("max_len must be positive");
        }

        tracing::info!(%model_name, ?device, max_len, "loading BERT encoder");

        let config_str = std::fs::read_to_string(&files.config)
            .wrap_err_with(|| format!("failed to read config from {}", files.config.display()))?;
        let config: candle_transformers::models::bert::Config = serde_json::from_str(&config_str)
            .wrap_err_with(|| format!("failed to parse config from {}", files.config.display()))?;

        let vb = match &files.weights {
            Weights::Safetensors(path) => unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(
                    &[path],
                    candle_transformers::models::bert::DTYPE,
                    &device,
                )
                .wrap_err_with(|| format!("failed to load weights from {}", path.display()))?
            },
            Weights::Pytorch(path) => candle_nn::VarBuilder::from_pth(
                path,
                candle_transformers::models::bert::DTYPE,
                &device,
            )
            .wrap_err_with(|| format!("failed to load weights from {}", path.display()))?,
        };

        let model = candle_transformers::models::bert::BertModel::load(vb, &config)
            .wrap_err("failed to build BERT model")?;

        let mut tokenizer = load_tokenizer(&files.tokenizer)?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: max_len,
                ..Default::default()
            }))
            .map_err(|e| eyre::eyre!("failed to configure truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        let identity = kglink_core::EncoderIdentity {
            model: model_name.to_string(),
            dim: config.hidden_size,
            max_len,
            pooling: "mean".to_string(),
        };
        tracing::info!(%identity, "BERT encoder ready");

        Ok(Self {
            model,
            tokenizer,
            device,
            identity,
        })
    }

    /// Get the device being used.
    #[must_use]
    pub fn device(&self) -> &candle_core::Device {
        &self.device
    }

    fn encode_batch_inner(&self, texts: &[&str]) -> eyre::Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| eyre::eyre!("tokenization failed: {e}"))?;

        let batch_size = encodings.len();
        let seq_len = encodings.first().map_or(0, tokenizers::Encoding::len);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut type_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            if encoding.len() != seq_len {
                eyre::bail!(
                    "tokenizer produced ragged batch: {} vs {seq_len}",
                    encoding.len()
                );
            }
            input_ids.extend_from_slice(encoding.get_ids());
            type_ids.extend_from_slice(encoding.get_type_ids());
            attention_mask.extend_from_slice(encoding.get_attention_mask());
        }

        let input_ids =
            candle_core::Tensor::from_vec(input_ids, (batch_size, seq_len), &self.device)
                .wrap_err("failed to create input_ids tensor")?;
        let type_ids = candle_core::Tensor::from_vec(type_ids, (batch_size, seq_len), &self.device)
            .wrap_err("failed to create token_type_ids tensor")?;
        let attention_mask =
            candle_core::Tensor::from_vec(attention_mask, (batch_size, seq_len), &self.device)
                .wrap_err("failed to create attention_mask tensor")?;

        // Shape: [batch_size, seq_len, hidden]
        let hidden = self
            .model
            .forward(&input_ids, &type_ids, Some(&attention_mask))
            .wrap_err("model forward pass failed")?;

        let pooled = mean_pool(&hidden, &attention_mask).wrap_err("mean pooling failed")?;

        let rows = pooled
            .to_dtype(candle_core::DType::F32)
            .wrap_err("failed to convert output to f32")?
            .to_device(&candle_core::Device::Cpu)
            .wrap_err("failed to move output to CPU")?
            .to_vec2::<f32>()
            .wrap_err("failed to convert output to vec")?;

        rows.into_iter()
            .map(|mut row| {
                kglink_embed::l2_normalize(&mut row)?;
                Ok(row)
            })
            .collect::<kglink_core::Result<Vec<_>>>()
            .map_err(eyre::Report::from)
    }
}

impl kglink_embed::Encoder for BertEncoder {
    fn identity(&self) -> &kglink_core::EncoderIdentity {
        &self.identity
    }

    fn encode_batch(&self, texts: &[&str]) -> kglink_core::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        kglink_embed::ensure_encodable(texts)?;
        self.encode_batch_inner(texts)
            .map_err(|e| kglink_core::Error::Encoding(format!("{e:#}")))
    }
}

/// Mean over valid positions: `sum(hidden * mask) / max(sum(mask), 1e-9)`.
fn mean_pool(
    hidden: &candle_core::Tensor,
    attention_mask: &candle_core::Tensor,
) -> candle_core::Result<candle_core::Tensor> {
    let mask = attention_mask
        .to_dtype(hidden.dtype())?
        .unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask
        .sum(1)?
        .maximum(f64::from(kglink_embed::MIN_TOKEN_COUNT))?;
    summed.broadcast_div(&counts)
}

fn load_tokenizer(source: &TokenizerSource) -> eyre::Result<tokenizers::Tokenizer> {
    match source {
        TokenizerSource::Json(path) => {
            tracing::info!(tokenizer_path = %path.display(), "loading tokenizer");
            tokenizers::Tokenizer::from_file(path).map_err(|e| {
                eyre::eyre!("failed to load tokenizer from {}: {e}", path.display())
            })
        }
        TokenizerSource::Vocab(path) => {
            tracing::info!(vocab_path = %path.display(), "building WordPiece tokenizer");
            bert_tokenizer_from_vocab(path)
        }
    }
}

fn bert_tokenizer_from_vocab(vocab: &std::path::Path) -> eyre::Result<tokenizers::Tokenizer> {
    use tokenizers::Model as _;

    let wordpiece = tokenizers::models::wordpiece::WordPiece::from_file(&vocab.to_string_lossy())
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| eyre::eyre!("failed to read vocab from {}: {e}", vocab.display()))?;

    let cls_id = wordpiece
        .token_to_id("[CLS]")
        .ok_or_else(|| eyre::eyre!("vocab has no [CLS] token"))?;
    let sep_id = wordpiece
        .token_to_id("[SEP]")
        .ok_or_else(|| eyre::eyre!("vocab has no [SEP] token"))?;

    let mut tokenizer = tokenizers::Tokenizer::new(wordpiece);
    tokenizer.with_normalizer(Some(
        tokenizers::normalizers::bert::BertNormalizer::default(),
    ));
    tokenizer.with_pre_tokenizer(Some(tokenizers::pre_tokenizers::bert::BertPreTokenizer));
    tokenizer.with_post_processor(Some(tokenizers::processors::bert::BertProcessing::new(
        ("[SEP]".to_string(), sep_id),
        ("[CLS]".to_string(), cls_id),
    )));
    Ok(tokenizer)
}

/// Get the default device (Metal or CUDA when compiled in, CPU otherwise).
pub fn default_device() -> eyre::Result<candle_core::Device> {
    #[cfg(feature = "metal")]
    {
        tracing::info!("using Metal device");
        candle_core::Device::new_metal(0).wrap_err("failed to create Metal device")
    }
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    {
        tracing::info!("using CUDA device");
        candle_core::Device::new_cuda(0).wrap_err("failed to create CUDA device")
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        tracing::info!("using CPU device");
        Ok(candle_core::Device::Cpu)
    }
}
