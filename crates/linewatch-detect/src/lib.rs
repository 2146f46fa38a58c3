// linewatch-detect/src/lib.rs
// ============================================================
// linewatch-detect  –  Detection stage for the route pipeline
// Decodes raw YOLO-style output, suppresses duplicates and maps
// surviving boxes back onto the original photo.
// ------------------------------------------------------------
// Pipeline: raw [features, anchors] tensor
//             → decode_raw_output  (threshold + corner form)
//             → non_max_suppression
//             → remap_detections   (letterbox inverse)
// ------------------------------------------------------------
// The model itself sits behind the DetectionEngine trait in
// `engine`; everything here is pure geometry and works the same
// for a real ONNX session or a test double.
// ============================================================

//! Detection decoding for power-line route photos.
//!
//! The raw model output is one column per anchor: four box parameters
//! `(cx, cy, w, h)` followed by one score per class. [`decode_raw_output`]
//! thresholds these into [`Detection`] candidates in model-input pixel
//! space, [`non_max_suppression`] drops overlapping duplicates and
//! [`remap_detections`] inverts the letterbox so the boxes land on the
//! original photo.

use linewatch_preprocess::LetterboxPlan;
use ndarray::{s, ArrayView2, ArrayViewD, Axis, Ix2};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::debug;

pub mod engine;

pub use engine::{DetectionEngine, EngineError, OrtEngine};

/// Anchors at or below this confidence are discarded.
pub const CONF_THRESHOLD: f32 = 0.25;
/// Overlap above this IoU suppresses the lower-confidence box.
pub const IOU_THRESHOLD: f32 = 0.45;
/// Boxes thinner than this on either axis after remapping are noise.
pub const MIN_BOX_PX: f32 = 5.0;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unexpected raw output shape {0:?}: want [features, anchors] with at least 5 feature rows")]
    BadOutputShape(Vec<usize>),
}

pub type Result<T> = std::result::Result<T, DetectError>;

/// A single detection: corner box [x1,y1,x2,y2] plus confidence and class.
///
/// Coordinates are in model-input pixels straight out of the decoder and in
/// original-photo pixels after [`remap_detections`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class: usize,
}

// ------------------------------------------------------------
// decoder
// ------------------------------------------------------------

/// Decode a raw `[features, anchors]` tensor (a leading batch axis of one is
/// tolerated) into thresholded corner-form candidates.
///
/// Whether the model emits normalized or pixel coordinates is sniffed from
/// the magnitudes: if every box parameter of every surviving anchor has
/// absolute value ≤ 1.0 the output is taken as normalized and scaled up by
/// the input size. A frame whose surviving boxes are all genuinely smaller
/// than one pixel would be misread as normalized; that ambiguity is inherent
/// to the convention sniffing and is left as-is.
pub fn decode_raw_output(
    raw: ArrayViewD<'_, f32>,
    input_size: (u32, u32),
) -> Result<Vec<Detection>> {
    let shape = raw.shape().to_vec();

    // 1. squeeze the batch axis if present: [1, F, A] → [F, A]
    let view = match raw.ndim() {
        3 if shape[0] == 1 => raw.index_axis_move(Axis(0), 0),
        2 => raw,
        _ => return Err(DetectError::BadOutputShape(shape)),
    };
    let view: ArrayView2<f32> = view
        .into_dimensionality::<Ix2>()
        .map_err(|_| DetectError::BadOutputShape(shape.clone()))?;

    let features = view.shape()[0];
    let anchors = view.shape()[1];
    if features < 5 {
        return Err(DetectError::BadOutputShape(shape));
    }

    // 2. per anchor: best class + score, keep strictly above the threshold
    let mut raw_boxes: Vec<([f32; 4], f32, usize)> = Vec::new();
    for a in 0..anchors {
        let scores = view.slice(s![4.., a]);
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (c, &score) in scores.iter().enumerate() {
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score > CONF_THRESHOLD {
            let params = [view[[0, a]], view[[1, a]], view[[2, a]], view[[3, a]]];
            raw_boxes.push((params, best_score, best_class));
        }
    }

    // 3. coordinate-convention sniff over the survivors
    let max_param = raw_boxes
        .iter()
        .flat_map(|(p, _, _)| p.iter())
        .fold(f32::NEG_INFINITY, |m, v| m.max(v.abs()));
    let (sx, sy) = if max_param <= 1.0 {
        (input_size.0 as f32, input_size.1 as f32)
    } else {
        (1.0, 1.0)
    };

    // 4. center form → corner form in model-input pixels
    let mut dets = Vec::with_capacity(raw_boxes.len());
    for (p, score, class) in raw_boxes {
        let (cx, cy, w, h) = (p[0] * sx, p[1] * sy, p[2] * sx, p[3] * sy);
        dets.push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class,
        });
    }
    debug!("decoded {} candidates from {} anchors", dets.len(), anchors);
    Ok(dets)
}

// ------------------------------------------------------------
// helpers: IoU • NMS
// ------------------------------------------------------------

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let iw = (ix2 - ix1).max(0.0);
    let ih = (iy2 - iy1).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    inter / (area_a + area_b - inter + 1e-6)
}

/// Greedy class-agnostic suppression: boxes overlapping an already kept box
/// above `iou_thr` are dropped, in descending confidence order. Deterministic
/// for a fixed input ordering; NaN scores are dropped up front so the sort
/// cannot misbehave.
pub fn non_max_suppression(dets: Vec<Detection>, iou_thr: f32) -> Vec<Detection> {
    let mut dets = dets;
    dets.retain(|d| !d.score.is_nan());
    dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut keep: Vec<Detection> = Vec::with_capacity(dets.len());

    'outer: for d in dets {
        for k in &keep {
            if iou(&d.bbox, &k.bbox) > iou_thr {
                continue 'outer;
            }
        }
        keep.push(d);
    }
    keep
}

// ------------------------------------------------------------
// remapper
// ------------------------------------------------------------

/// Map surviving boxes from the letterboxed canvas back onto the original
/// photo, discarding padding artifacts along the way.
pub fn remap_detections(dets: Vec<Detection>, plan: &LetterboxPlan) -> Vec<Detection> {
    let (orig_w, orig_h) = (plan.orig.0 as f32, plan.orig.1 as f32);
    let (content_w, content_h) = plan.content_size();
    let left = plan.pad.0 as f32;
    let top = plan.pad.1 as f32;
    let content_x2 = left + content_w as f32;
    let content_y2 = top + content_h as f32;

    let mut out = Vec::with_capacity(dets.len());
    for d in dets {
        // 1. intersect with the photo content region of the canvas
        let x1 = d.bbox[0].max(left);
        let y1 = d.bbox[1].max(top);
        let x2 = d.bbox[2].min(content_x2);
        let y2 = d.bbox[3].min(content_y2);
        if x2 <= x1 || y2 <= y1 {
            continue; // lives entirely in the gray bars
        }

        // 2. un-pad, un-scale
        let x1 = (x1 - left) / plan.scale;
        let y1 = (y1 - top) / plan.scale;
        let x2 = (x2 - left) / plan.scale;
        let y2 = (y2 - top) / plan.scale;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        // 3. clamp into the photo
        let x1 = x1.clamp(0.0, orig_w - 1.0);
        let y1 = y1.clamp(0.0, orig_h - 1.0);
        let x2 = x2.clamp(0.0, orig_w - 1.0);
        let y2 = y2.clamp(0.0, orig_h - 1.0);

        // 4. minimum-size gate
        if x2 - x1 < MIN_BOX_PX || y2 - y1 < MIN_BOX_PX {
            continue;
        }
        out.push(Detection {
            bbox: [x1, y1, x2, y2],
            ..d
        });
    }
    out
}
