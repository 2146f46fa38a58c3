//! Single Photo Detection Demo
//!
//! Runs one photo through the detection pipeline without the store:
//! 1. Decode the photo and letterbox it to the model input
//! 2. Run the ONNX model
//! 3. Decode, suppress and remap the detections
//! 4. Save an annotated copy next to the input
//!
//! Usage: cargo run --bin detect_image -- --model models/linewatch.onnx photo.jpg

use anyhow::{Context, Result};
use clap::Parser;
use linewatch_annotate::{class_name, Annotator, JPEG_QUALITY};
use linewatch_detect::{
    decode_raw_output, non_max_suppression, remap_detections, DetectionEngine, OrtEngine,
    IOU_THRESHOLD,
};
use linewatch_preprocess::{decode_image, Letterbox};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Run power-line detection on a single photo")]
struct CliArgs {
    /// ONNX model file
    #[arg(long, default_value = "models/linewatch.onnx")]
    model: PathBuf,

    /// Model input tensor name
    #[arg(long, default_value = "images")]
    input_name: String,

    /// Square model input edge in pixels
    #[arg(long, default_value = "640")]
    input_size: u32,

    /// TTF font for box labels
    #[arg(long)]
    font: Option<PathBuf>,

    /// Photo to run detection on
    photo: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = CliArgs::parse();

    // Step 1: model
    let engine = OrtEngine::load(
        &args.model,
        &args.input_name,
        (args.input_size, args.input_size),
    )
    .context("loading ONNX model")?;

    // Step 2: decode + letterbox
    let bytes =
        std::fs::read(&args.photo).with_context(|| format!("reading {}", args.photo.display()))?;
    let img = decode_image(&bytes).context("decoding photo")?;
    let letterbox = Letterbox::new(args.input_size, args.input_size);
    let (input, plan) = letterbox.run(&img).context("letterboxing photo")?;

    // Step 3: inference + postprocessing back into photo coordinates
    let raw = engine.run(&input).context("running the model")?;
    let dets = decode_raw_output(raw.view(), letterbox.target())?;
    let dets = non_max_suppression(dets, IOU_THRESHOLD);
    let dets = remap_detections(dets, &plan);

    println!("🔍 {} detection(s) in {}", dets.len(), args.photo.display());
    for det in &dets {
        let [x1, y1, x2, y2] = det.bbox;
        println!(
            "   {} {:.2} at [{:.0}, {:.0}, {:.0}, {:.0}]",
            class_name(det.class),
            det.score,
            x1,
            y1,
            x2,
            y2
        );
    }

    // Step 4: annotated copy next to the input
    let annotator = Annotator::new(args.font.as_deref(), JPEG_QUALITY);
    let (jpeg, summary) = annotator.annotate(img, &dets)?;
    let out = args.photo.with_extension("processed.jpg");
    std::fs::write(&out, &jpeg).with_context(|| format!("writing {}", out.display()))?;
    println!(
        "💾 Saved {} ({} defect(s), {} other detection(s))",
        out.display(),
        summary.red_count,
        summary.green_count
    );

    Ok(())
}
