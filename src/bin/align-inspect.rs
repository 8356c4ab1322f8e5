//! align-inspect: run the phoneme encoder and upsampler on one utterance.
//!
//! Builds the alignment core from an optional JSON config and optional
//! safetensors weights (random init otherwise), encodes the given phonemes,
//! expands them with the given durations and prints a one-line JSON summary:
//!
//! ```json
//! {"phonemes":12,"frames":31,"hidden":[1,192,12],"frame_hidden":[1,384,31],"row_sums":[1.0,...]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use soft_align_rs::{config::ModelConfig, text, AlignmentCore};

#[derive(Parser, Debug)]
#[command(
    name = "align-inspect",
    about = "Inspect phoneme encoding and duration upsampling",
    long_about = "Encode a phoneme sequence, upsample it to frames with the given durations\n\
                  and print a JSON summary line to stdout."
)]
struct Args {
    /// JSON model config. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors weight files. Parameters are randomly initialised when omitted.
    #[arg(long, short = 'w')]
    weights: Vec<PathBuf>,

    /// Phonemised text, one symbol per character.
    #[arg(long, short = 't', conflicts_with = "ids")]
    text: Option<String>,

    /// Comma-separated phoneme ids.
    #[arg(long, value_delimiter = ',')]
    ids: Vec<u32>,

    /// Comma-separated per-phoneme durations in frames (default: 1 per phoneme).
    #[arg(long, short = 'd', value_delimiter = ',')]
    durations: Vec<f32>,

    /// Run on CPU even if a GPU is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::default(),
    };

    let ids = match &args.text {
        Some(text) => text::text_to_ids(text)?,
        None => args.ids.clone(),
    };
    if ids.is_empty() {
        anyhow::bail!("no phonemes given; pass --text or --ids");
    }
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= config.encoder.n_vocab) {
        anyhow::bail!(
            "phoneme id {bad} out of range for vocabulary of {}",
            config.encoder.n_vocab
        );
    }

    let durations = if args.durations.is_empty() {
        vec![1.0; ids.len()]
    } else {
        args.durations.clone()
    };
    if durations.len() != ids.len() {
        anyhow::bail!(
            "got {} durations for {} phonemes",
            durations.len(),
            ids.len()
        );
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = DType::F32;
    tracing::info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let core = if args.weights.is_empty() {
        tracing::info!("No weights given, using random initialisation");
        AlignmentCore::new(&config, VarBuilder::from_varmap(&varmap, dtype, &device))?
    } else {
        AlignmentCore::from_safetensors(&args.weights, &config, dtype, &device)?
    };

    let p = ids.len();
    let ids = Tensor::from_vec(ids, (1, p), &device)?;
    let lengths = Tensor::new(&[p as u32], &device)?;
    let durations = Tensor::from_vec(durations, (1, p), &device)?;

    let enc = core.encode_phonemes(&ids, &lengths, false)?;
    let up = core.upsample(&enc.hidden, &enc.mask, &durations, &lengths, false)?;

    let frames: Vec<u32> = up.frame_lengths.to_vec1()?;
    let row_sums: Vec<f32> = up.alignment_row_sums()?.get(0)?.mean(0)?.to_vec1()?;

    let summary = serde_json::json!({
        "phonemes": p,
        "frames": frames[0],
        "hidden": enc.hidden.dims(),
        "frame_hidden": up.frame_hidden.dims(),
        "attention_layers": enc.attention_weights.len(),
        "row_sums": row_sums,
    });
    println!("{summary}");

    Ok(())
}
