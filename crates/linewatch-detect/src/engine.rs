//! The seam between the geometry pipeline and the actual model.
//!
//! [`DetectionEngine`] is the one call the rest of the system knows about:
//! letterboxed tensor in, raw prediction tensor out. [`OrtEngine`] is the
//! ONNX Runtime implementation used in production; tests drive the pipeline
//! with hand-rolled engines instead of a model file.

use ndarray::{Array4, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("onnx runtime: {0}")]
    Session(#[from] ort::Error),
    /// Escape hatch for engines not backed by ONNX Runtime.
    #[error("inference failed: {0}")]
    Inference(String),
}

/// A loaded detection model.
///
/// `run` consumes the `[1, 3, H, W]` letterbox tensor and returns the raw
/// per-anchor output; `input_size` is the (W, H) the tensor must have.
/// Implementations are shared across requests, so they must be `Send + Sync`
/// and serialize any interior session state themselves.
pub trait DetectionEngine: Send + Sync {
    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, EngineError>;
    fn input_size(&self) -> (u32, u32);
}

/// ONNX Runtime engine over a single shared CPU session.
///
/// The session is built once and reused for every photo; inference goes
/// through a mutex, one image at a time.
pub struct OrtEngine {
    session: Mutex<Session>,
    input_name: String,
    input_size: (u32, u32),
}

impl OrtEngine {
    /// Load the model file and prepare an optimized CPU session.
    pub fn load(
        model_path: &Path,
        input_name: &str,
        input_size: (u32, u32),
    ) -> Result<Self, EngineError> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_cpus::get())?
            .commit_from_file(model_path)?;

        info!(
            "detection model loaded from {} ({}x{} input)",
            model_path.display(),
            input_size.0,
            input_size.1
        );
        Ok(Self {
            session: Mutex::new(session),
            input_name: input_name.to_string(),
            input_size,
        })
    }
}

impl DetectionEngine for OrtEngine {
    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, EngineError> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input.view()]?)?;
        let raw = outputs[0].try_extract_tensor::<f32>()?;
        Ok(raw.to_owned())
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }
}
