use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::{
    ArcFaceEmbedder, Embedding, EuclideanMatcher, Gallery, MatchResult, Matcher, ScrfdDetector,
};
use faceid_pipeline::{
    ChannelConfig, DetectionStage, IdempotencyGuard, MemoryBroker, RecognitionStage, Request,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CROPS: &str = "crops";
const RESPONSES: &str = "responses";

#[derive(Parser)]
#[command(name = "faceid", about = "Face identification pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an inbound request message for an image file
    Request {
        /// Image to embed in the request
        image: PathBuf,
        /// Request id (random UUID if omitted)
        #[arg(long)]
        request_id: Option<String>,
        /// Filename to report (defaults to the image's file name)
        #[arg(long)]
        filename: Option<String>,
    },
    /// Validate a gallery file and print a summary
    Gallery {
        /// Gallery JSON file
        path: PathBuf,
    },
    /// Match an embedding against a gallery
    Match {
        #[arg(short, long)]
        gallery: PathBuf,
        /// JSON file holding an array of floats or an embedding object
        #[arg(short, long)]
        embedding: PathBuf,
        /// Distances above this are reported as "unknown"
        #[arg(long)]
        max_distance: Option<f32>,
    },
    /// Run both stages in-process on one image and print the result
    Identify {
        image: PathBuf,
        #[arg(short, long)]
        gallery: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
        #[arg(long)]
        max_distance: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Request {
            image,
            request_id,
            filename,
        } => {
            let image_bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let filename = match filename {
                Some(name) => name,
                None => file_name(&image)?,
            };
            let request = Request {
                request_id: request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                filename,
                image_bytes,
            };
            println!("{}", request.to_json());
        }
        Commands::Gallery { path } => {
            let gallery = Gallery::load(&path)?;
            println!("Gallery: {}", path.display());
            println!("  entries:       {}", gallery.len());
            println!("  dimension:     {}", gallery.dim());
            println!(
                "  model version: {}",
                gallery.model_version().unwrap_or("(unspecified)")
            );
            for label in gallery.labels() {
                println!("  - {label}");
            }
        }
        Commands::Match {
            gallery,
            embedding,
            max_distance,
        } => {
            let gallery = Gallery::load(&gallery)?;
            let probe = read_embedding(&embedding)?;
            if probe.dim() != gallery.dim() {
                bail!(
                    "embedding has dimension {}, gallery expects {}",
                    probe.dim(),
                    gallery.dim()
                );
            }
            let result = EuclideanMatcher::new(max_distance).compare(&probe, &gallery);
            println!("{}", match_json(&result));
        }
        Commands::Identify {
            image,
            gallery,
            model_dir,
            max_distance,
        } => {
            let gallery = Arc::new(Gallery::load(&gallery)?);
            let model_dir = model_dir
                .or_else(|| std::env::var_os("FACEID_MODEL_DIR").map(PathBuf::from))
                .unwrap_or_else(faceid_core::default_model_dir);
            let request = Request {
                request_id: uuid::Uuid::new_v4().to_string(),
                filename: file_name(&image)?,
                image_bytes: std::fs::read(&image)
                    .with_context(|| format!("failed to read {}", image.display()))?,
            };

            let detector = ScrfdDetector::load(&model_path(&model_dir, "det_10g.onnx"))?;
            let embedder = ArcFaceEmbedder::load(&model_path(&model_dir, "w600k_r50.onnx"))?;

            let broker = Arc::new(MemoryBroker::new([CROPS, RESPONSES], 1));
            let channels = ChannelConfig::new(CROPS, RESPONSES);
            let mut detection = DetectionStage::new(
                detector,
                Arc::new(IdempotencyGuard::default()),
                broker.clone(),
                channels.clone(),
            );
            let mut recognition = RecognitionStage::with_max_distance(
                embedder,
                max_distance,
                gallery,
                Arc::new(IdempotencyGuard::default()),
                broker.clone(),
                channels,
            )?;

            let outcome = detection.handle_request(request)?;
            tracing::debug!(?outcome, "detection finished");

            let crops = broker.try_receive_batch(CROPS, 1)?;
            if !crops.is_empty() {
                let report = recognition.handle_batch(&crops)?.into_result()?;
                tracing::debug!(identified = report.identified.len(), "recognition finished");
            }

            for delivery in broker.try_receive_batch(RESPONSES, usize::MAX)? {
                println!("{}", delivery.body);
            }
        }
    }

    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    match path.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("{} has no file name; pass --filename", path.display()),
    }
}

fn model_path(dir: &Path, file: &str) -> String {
    dir.join(file).to_string_lossy().into_owned()
}

/// Accepts either a bare JSON array or a serialized `Embedding`.
fn read_embedding(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if let Ok(values) = serde_json::from_str::<Vec<f32>>(&text) {
        return Ok(Embedding::new(values));
    }
    serde_json::from_str::<Embedding>(&text)
        .with_context(|| format!("{} is not an embedding", path.display()))
}

fn match_json(result: &MatchResult) -> serde_json::Value {
    serde_json::json!({
        "outcome": result.outcome.as_str(),
        "distance": result.distance,
        "index": result.index,
    })
}
