//! CLI for weightsmith: fetch, convert, convert-file, inspect.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use weightsmith::{
    build_api, confirm_deletion, convert_file, convert_paths, delete_originals,
    fetch_file_matching, fetch_snapshot, load_checkpoint, scan_checkpoints, Entry,
};

/// Where batch conversion and the default fetch pipeline keep checkpoints.
const DEFAULT_CHECKPOINT_DIR: &str = "models/checkpoints";
// Default artifact set of the published pipeline: text encoder, diffusion
// checkpoint, and autoencoder.
const DEFAULT_TEXT_ENCODER_REPO: &str = "unsloth/gemma-2-2b-it-bnb-4bit";
const DEFAULT_CHECKPOINT_REPO: &str = "Efficient-Large-Model/Sana_600M_512px";
const DEFAULT_VAE_REPO: &str = "mit-han-lab/dc-ae-f32c32-sana-1.0-diffusers";

#[derive(Parser)]
#[command(name = "weightsmith")]
#[command(about = "Fetch pretrained weights and convert .pth checkpoints to safetensors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download model weights into the local models/ layout
    Fetch {
        /// Fetch a single repository snapshot instead of the default artifact set
        #[arg(long)]
        repo: Option<String>,
        /// Destination directory (used with --repo)
        #[arg(long, default_value = "models")]
        dest: PathBuf,
        /// Hub access token (falls back to cached credentials)
        #[arg(long, env = "HF_TOKEN")]
        token: Option<String>,
    },

    /// Convert every .pth checkpoint in a directory to safetensors
    Convert {
        #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
        dir: PathBuf,
    },

    /// Convert a single checkpoint file
    ConvertFile {
        /// Path to the .pth checkpoint
        input: PathBuf,
    },

    /// List tensors in a .pth or .safetensors file
    Inspect {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch { repo, dest, token } => run_fetch(repo, &dest, token)?,
        Commands::Convert { dir } => run_convert(&dir)?,
        Commands::ConvertFile { input } => run_convert_file(&input)?,
        Commands::Inspect { file, json } => run_inspect(&file, json)?,
    }
    Ok(())
}

fn run_fetch(repo: Option<String>, dest: &Path, token: Option<String>) -> Result<()> {
    let api = build_api(token)?;

    if let Some(repo) = repo {
        info!("fetching snapshot of {}...", repo);
        let files = fetch_snapshot(&api, &repo, dest)?;
        println!("Fetched {} file(s) into {}", files.len(), dest.display());
        return Ok(());
    }

    println!("Step 1: text encoder ({})", DEFAULT_TEXT_ENCODER_REPO);
    let encoder_dest = Path::new("models/text_encoders").join(
        DEFAULT_TEXT_ENCODER_REPO
            .rsplit('/')
            .next()
            .unwrap_or(DEFAULT_TEXT_ENCODER_REPO),
    );
    let files = fetch_snapshot(&api, DEFAULT_TEXT_ENCODER_REPO, &encoder_dest)?;
    println!("  {} file(s) -> {}", files.len(), encoder_dest.display());

    println!("Step 2: checkpoint ({})", DEFAULT_CHECKPOINT_REPO);
    let checkpoint = fetch_file_matching(
        &api,
        DEFAULT_CHECKPOINT_REPO,
        Some("checkpoints/"),
        ".pth",
        Path::new(DEFAULT_CHECKPOINT_DIR),
    )?;
    println!("  verified {}", checkpoint.display());

    println!("Step 3: VAE ({})", DEFAULT_VAE_REPO);
    let vae = fetch_file_matching(
        &api,
        DEFAULT_VAE_REPO,
        None,
        ".safetensors",
        Path::new("models/vae"),
    )?;
    println!("  verified {}", vae.display());

    println!("All downloads completed and verified");
    Ok(())
}

fn run_convert(dir: &Path) -> Result<()> {
    println!("Scanning for .pth files in {}...", dir.display());
    let files = scan_checkpoints(dir)?;
    if files.is_empty() {
        println!("No .pth files found");
        return Ok(());
    }
    println!("Found {} checkpoint(s):", files.len());
    for (idx, file) in files.iter().enumerate() {
        println!("  {}. {}", idx + 1, file.display());
    }

    let report = convert_paths(&files);

    println!();
    println!("Conversion summary:");
    println!("  converted: {}", report.converted.len());
    println!("  failed:    {}", report.failed.len());
    for failure in &report.failed {
        println!("  {} -> {}", failure.path.display(), failure.reason);
    }

    if !report.converted.is_empty() {
        let stdin = std::io::stdin();
        if confirm_deletion(&mut stdin.lock())? {
            let outcome = delete_originals(&report);
            for path in &outcome.deleted {
                println!("  deleted {}", path.display());
            }
            for failure in &outcome.failed {
                println!("  kept {}: {}", failure.path.display(), failure.reason);
            }
        }
    }

    println!("Conversion run complete");
    Ok(())
}

fn run_convert_file(input: &Path) -> Result<()> {
    let outcome = convert_file(input)?;
    println!(
        "Converted {} -> {} ({} tensors, {} bytes)",
        outcome.input.display(),
        outcome.output.display(),
        outcome.tensor_count,
        outcome.bytes_written
    );
    Ok(())
}

#[derive(Serialize)]
struct TensorSummary {
    name: String,
    dtype: String,
    shape: Vec<usize>,
}

fn run_inspect(file: &Path, json: bool) -> Result<()> {
    let summaries = if file.extension().is_some_and(|ext| ext == "safetensors") {
        let bytes = std::fs::read(file)?;
        let loaded = safetensors::SafeTensors::deserialize(&bytes)?;
        let mut summaries: Vec<TensorSummary> = loaded
            .tensors()
            .into_iter()
            .map(|(name, view)| TensorSummary {
                name,
                dtype: format!("{:?}", view.dtype()),
                shape: view.shape().to_vec(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    } else {
        let checkpoint = load_checkpoint(file)?;
        checkpoint
            .entries
            .iter()
            .map(|(name, entry)| match entry {
                Entry::Tensor(tensor) => TensorSummary {
                    name: name.clone(),
                    dtype: tensor.dtype.name().to_string(),
                    shape: tensor.shape.clone(),
                },
                Entry::Other(type_name) => TensorSummary {
                    name: name.clone(),
                    dtype: format!("<{}>", type_name),
                    shape: Vec::new(),
                },
            })
            .collect()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        println!("{} tensor(s) in {}", summaries.len(), file.display());
        for summary in &summaries {
            println!("  {}  {}  {:?}", summary.name, summary.dtype, summary.shape);
        }
    }
    Ok(())
}
