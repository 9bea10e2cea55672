//! CLI for type-aware entity linking.

// CLI binaries need to print user-facing output
#![allow(
    clippy::print_stdout,
    reason = "CLI binary needs stdout for user output"
)]

mod batch;

use eyre::WrapErr as _;

const DEFAULT_INDEX_ROOT: &str = "indices";

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Build {
            dict,
            entity_type,
            out,
            batch_size,
            parallel,
            index_root,
        } => {
            let out = out.unwrap_or_else(|| index_root.join(entity_type.as_str()));
            build(&args.encoder, &dict, entity_type, &out, batch_size, parallel)?;
        }
        Command::Link {
            mention,
            types,
            topk,
            all_variants,
            json,
            serve,
        } => {
            link(&args.encoder, &serve, &mention, &types, topk, all_variants, json)?;
        }
        Command::LinkBatch {
            input,
            output,
            topk,
            all_variants,
            serve,
        } => {
            link_batch(&args.encoder, &serve, &input, &output, topk, all_variants)?;
        }
        Command::Normalize { text, norm_config } => {
            let normalizer = load_normalizer(norm_config.as_deref())?;
            for variant in normalizer.normalize(&text) {
                println!("{variant}");
            }
        }
        Command::Stats { serve } => {
            stats(&serve);
        }
    }

    Ok(())
}

use clap::Parser as _;

#[derive(clap::Parser)]
#[command(name = "kglink")]
#[command(about = "Type-aware entity linking against per-type vector indices")]
struct Args {
    #[command(flatten)]
    encoder: EncoderArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EncoderKind {
    /// BERT-family transformer on candle
    Bert,
    /// Model-free hashed character trigrams
    Hashed,
}

#[derive(clap::Args)]
struct EncoderArgs {
    /// Encoder used to build and query indices
    #[arg(long, global = true, value_enum, default_value_t = EncoderKind::Bert)]
    encoder: EncoderKind,

    /// Model directory or HuggingFace repo id (bert encoder)
    #[arg(long, global = true, env = "KGLINK_MODEL", default_value = kglink_candle::DEFAULT_MODEL)]
    model: String,

    /// Output dimension (hashed encoder)
    #[arg(long, global = true, default_value_t = kglink_embed::hashed::DEFAULT_DIM)]
    dim: usize,

    /// Maximum tokens per text
    #[arg(long, global = true, default_value_t = kglink_candle::DEFAULT_MAX_LEN)]
    max_len: usize,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Directory holding one index directory per entity type
    #[arg(long, env = "KGLINK_INDEX_ROOT", default_value = DEFAULT_INDEX_ROOT)]
    index_root: std::path::PathBuf,

    /// Normalization config (YAML)
    #[arg(long, env = "KGLINK_NORM_CONFIG")]
    norm_config: Option<std::path::PathBuf>,

    /// Entity types to load (defaults to all)
    #[arg(long, value_delimiter = ',')]
    register: Vec<kglink_core::EntityType>,
}

impl ServeArgs {
    fn registrations(&self) -> Vec<kglink_core::EntityType> {
        if self.register.is_empty() {
            kglink_core::EntityType::ALL.to_vec()
        } else {
            self.register.clone()
        }
    }
}

#[derive(clap::Subcommand)]
enum Command {
    /// Build and persist the index for one entity type
    Build {
        /// Dictionary JSON document
        #[arg(long)]
        dict: std::path::PathBuf,

        /// Entity type of every entry in the dictionary
        #[arg(long)]
        entity_type: kglink_core::EntityType,

        /// Output directory (defaults to <index-root>/<entity-type>)
        #[arg(long)]
        out: Option<std::path::PathBuf>,

        /// Names per encoder call
        #[arg(long, default_value_t = kglink_index::builder::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Encode batches in parallel
        #[arg(long)]
        parallel: bool,

        #[arg(long, env = "KGLINK_INDEX_ROOT", default_value = DEFAULT_INDEX_ROOT)]
        index_root: std::path::PathBuf,
    },

    /// Link one mention
    Link {
        mention: String,

        /// Expected entity types (defaults to every loaded type)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        /// Maximum number of candidates
        #[arg(short = 'k', long)]
        topk: Option<usize>,

        /// Search with every normalized variant, not just the mention
        #[arg(long)]
        all_variants: bool,

        /// Print candidates as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        serve: ServeArgs,
    },

    /// Link line-delimited JSON requests
    LinkBatch {
        #[arg(long)]
        input: std::path::PathBuf,

        #[arg(long)]
        output: std::path::PathBuf,

        /// Candidates per request when the request has no `topk`
        #[arg(short = 'k', long)]
        topk: Option<usize>,

        #[arg(long)]
        all_variants: bool,

        #[command(flatten)]
        serve: ServeArgs,
    },

    /// Print the normalized variants of a text
    Normalize {
        text: String,

        #[arg(long, env = "KGLINK_NORM_CONFIG")]
        norm_config: Option<std::path::PathBuf>,
    },

    /// Show what each registered index holds
    Stats {
        #[command(flatten)]
        serve: ServeArgs,
    },
}

/// Build the configured encoder once; it is shared by builder and linker.
fn load_encoder(args: &EncoderArgs) -> eyre::Result<Box<dyn kglink_embed::Encoder>> {
    match args.encoder {
        EncoderKind::Bert => {
            tracing::info!(model = %args.model, max_len = args.max_len, "loading bert encoder");
            let encoder = kglink_candle::BertEncoder::from_pretrained(&args.model, args.max_len)
                .wrap_err_with(|| format!("failed to load encoder `{}`", args.model))?;
            Ok(Box::new(encoder))
        }
        EncoderKind::Hashed => {
            let encoder = kglink_embed::HashedNgramEncoder::new(args.dim, args.max_len)
                .wrap_err("failed to create hashed encoder")?;
            Ok(Box::new(encoder))
        }
    }
}

fn load_normalizer(
    path: Option<&std::path::Path>,
) -> eyre::Result<kglink_normalize::NameNormalizer> {
    match path {
        Some(path) => kglink_normalize::NameNormalizer::from_path(path)
            .wrap_err_with(|| format!("failed to load normalization config {}", path.display())),
        None => kglink_normalize::NameNormalizer::new(
            kglink_normalize::NormalizationConfig::default(),
        )
        .wrap_err("failed to build default normalizer"),
    }
}

fn open_store(
    serve: &ServeArgs,
    encoder: &dyn kglink_embed::Encoder,
) -> eyre::Result<kglink_index::IndexStore> {
    let store = kglink_index::IndexStore::load(
        &serve.index_root,
        &serve.registrations(),
        encoder.identity(),
    );
    if store.is_empty() {
        let reasons: Vec<String> = store
            .failures()
            .iter()
            .map(|f| format!("{}: {}", f.entity_type, f.reason))
            .collect();
        eyre::bail!(
            "no index could be loaded from {} ({})",
            serve.index_root.display(),
            reasons.join("; ")
        );
    }
    Ok(store)
}

fn linker_config(all_variants: bool) -> kglink_linker::LinkerConfig {
    kglink_linker::LinkerConfig {
        query_mode: if all_variants {
            kglink_linker::QueryMode::AllVariants
        } else {
            kglink_linker::QueryMode::FirstVariant
        },
        ..kglink_linker::LinkerConfig::default()
    }
}

fn build(
    encoder_args: &EncoderArgs,
    dict: &std::path::Path,
    entity_type: kglink_core::EntityType,
    out: &std::path::Path,
    batch_size: usize,
    parallel: bool,
) -> eyre::Result<()> {
    let encoder = load_encoder(encoder_args)?;
    let builder = kglink_index::IndexBuilder::new(encoder.as_ref())
        .with_batch_size(batch_size)?
        .parallel(parallel);

    let (index, report) = builder
        .build_from_path(entity_type, dict)
        .wrap_err_with(|| format!("failed to build `{entity_type}` index from {}", dict.display()))?;
    kglink_index::persist_replacing(&index, &report, out)
        .wrap_err_with(|| format!("failed to persist index to {}", out.display()))?;

    println!("{report}");
    println!("written to {}", out.display());
    Ok(())
}

fn link(
    encoder_args: &EncoderArgs,
    serve: &ServeArgs,
    mention: &str,
    types: &[String],
    topk: Option<usize>,
    all_variants: bool,
    json: bool,
) -> eyre::Result<()> {
    let encoder = load_encoder(encoder_args)?;
    let store = open_store(serve, encoder.as_ref())?;
    let normalizer = load_normalizer(serve.norm_config.as_deref())?;
    let linker = kglink_linker::TypeAwareLinker::new(
        &store,
        encoder.as_ref(),
        normalizer,
        linker_config(all_variants),
    )?;

    let k = topk.unwrap_or(linker.config().default_topk);
    let candidates = linker
        .link(mention, types, k)
        .wrap_err_with(|| format!("failed to link `{mention}`"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&candidates).wrap_err("failed to serialize JSON")?
        );
    } else {
        for c in &candidates {
            println!("{:.4}\t{}\t{}\t{}", c.score, c.entity_type, c.id, c.name);
        }
    }
    Ok(())
}

fn link_batch(
    encoder_args: &EncoderArgs,
    serve: &ServeArgs,
    input: &std::path::Path,
    output: &std::path::Path,
    topk: Option<usize>,
    all_variants: bool,
) -> eyre::Result<()> {
    let encoder = load_encoder(encoder_args)?;
    let store = open_store(serve, encoder.as_ref())?;
    let normalizer = load_normalizer(serve.norm_config.as_deref())?;
    let linker = kglink_linker::TypeAwareLinker::new(
        &store,
        encoder.as_ref(),
        normalizer,
        linker_config(all_variants),
    )?;

    let reader = std::fs::File::open(input)
        .map(std::io::BufReader::new)
        .wrap_err_with(|| format!("failed to open {}", input.display()))?;
    let writer = std::fs::File::create(output)
        .wrap_err_with(|| format!("failed to create {}", output.display()))?;

    let k = topk.unwrap_or(linker.config().default_topk);
    let summary = batch::run(&linker, reader, writer, k)?;

    println!(
        "Linked {} of {} requests ({} failed) -> {}",
        summary.linked,
        summary.requests,
        summary.failed,
        output.display()
    );
    Ok(())
}

fn stats(serve: &ServeArgs) {
    for entity_type in serve.registrations() {
        let dir = serve.index_root.join(entity_type.as_str());
        match kglink_index::storage::load(&dir, entity_type, None) {
            Ok(index) => {
                println!(
                    "{entity_type}: {} rows, {} vectors, dim {}, encoder {}",
                    index.len(),
                    index.vector_count(),
                    index.dim(),
                    index.encoder()
                );
            }
            Err(e) => println!("{entity_type}: unavailable ({e})"),
        }
    }
}
