//! Linewatch Store Demo
//!
//! Drives the route store end to end from the command line:
//! 1. Load configuration from linewatch.toml + LINEWATCH__* env overrides
//! 2. Open the ONNX detection engine (skipped when the model file is missing)
//! 3. Run one store operation: upload / list / stats / fetch / delete
//!
//! Usage: cargo run --bin linewatch_demo -- upload route-1 photo1.jpg photo2.jpg

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linewatch_detect::{DetectionEngine, OrtEngine};
use linewatch_store::{load_config, RouteStore, UploadOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(about = "Power-line route photo store")]
struct CliArgs {
    /// Override the store root from the config
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override the ONNX model path from the config
    #[arg(long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload photos to a route and run detection on them
    Upload {
        route_id: String,
        /// Photo files to upload
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// List processed photos in a route
    List { route_id: String },
    /// Show defect statistics for a route
    Stats { route_id: String },
    /// Save the processed copy of one file
    Fetch {
        route_id: String,
        file_id: String,
        /// Where to write the JPEG
        #[arg(long, default_value = "processed.jpg")]
        out: PathBuf,
    },
    /// Delete one file from a route
    DeleteFile { route_id: String, file_id: String },
    /// Delete a whole route
    DeleteRoute { route_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = CliArgs::parse();

    // Step 1: configuration, CLI overrides on top
    let mut cfg = load_config().context("loading configuration")?;
    if let Some(root) = args.root {
        cfg.storage.root = root;
    }
    if let Some(model) = args.model {
        cfg.model.path = model;
    }

    // Step 2: detection engine; without the model the store still serves
    // listings, stats and fetches of already processed routes
    let engine: Option<Arc<dyn DetectionEngine>> = if Path::new(&cfg.model.path).exists() {
        let engine = OrtEngine::load(
            Path::new(&cfg.model.path),
            &cfg.model.input_name,
            (cfg.model.input_size, cfg.model.input_size),
        )
        .context("loading ONNX model")?;
        println!("🧠 Model loaded from {}", cfg.model.path);
        Some(Arc::new(engine))
    } else {
        eprintln!(
            "⚠️  model {} not found, uploads will be stored unprocessed",
            cfg.model.path
        );
        None
    };

    let store = RouteStore::open(cfg, engine).context("opening route store")?;

    // Step 3: one store operation
    match args.command {
        Command::Upload { route_id, photos } => {
            let mut files = Vec::with_capacity(photos.len());
            for path in &photos {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".to_string());
                let bytes =
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                files.push((name, bytes));
            }

            let report = store.upload_batch(&route_id, files).await?;
            println!("📦 Uploaded {} file(s) to {route_id}", report.uploaded_count);
            for outcome in &report.outcomes {
                match outcome {
                    UploadOutcome::Processed {
                        original_name,
                        file_id,
                        summary,
                        ..
                    } => println!(
                        "✅ {original_name} [{file_id}]: {} detection(s), {} defect(s)",
                        summary.total, summary.red_count
                    ),
                    UploadOutcome::Skipped {
                        original_name,
                        note,
                        ..
                    } => println!("⏭️  {original_name}: {note}"),
                    UploadOutcome::Failed {
                        original_name,
                        error,
                        ..
                    } => println!("❌ {original_name}: {error}"),
                }
            }
        }
        Command::List { route_id } => {
            let entries = store.list_files(&route_id).await?;
            println!("📂 {} processed file(s) in {route_id}", entries.len());
            for entry in entries {
                println!("   {} → {}", entry.original_name, entry.processed_id);
            }
        }
        Command::Stats { route_id } => {
            let stats = store.route_stats(&route_id).await?;
            println!("📊 Route {route_id}");
            println!("   processed:       {}", stats.total_processed);
            println!("   with defects:    {}", stats.with_defects);
            println!("   without defects: {}", stats.without_defects);
        }
        Command::Fetch {
            route_id,
            file_id,
            out,
        } => {
            let bytes = store.fetch_processed(&route_id, &file_id).await?;
            std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
            println!("💾 Saved {} bytes to {}", bytes.len(), out.display());
        }
        Command::DeleteFile { route_id, file_id } => {
            if store.delete_file(&route_id, &file_id).await? {
                println!("🗑️  Deleted {file_id} from {route_id}");
            } else {
                println!("Nothing to delete for {file_id} in {route_id}");
            }
        }
        Command::DeleteRoute { route_id } => {
            let removed = store.delete_route(&route_id).await?;
            println!("🗑️  Deleted route {route_id} ({removed} file(s))");
        }
    }

    Ok(())
}
