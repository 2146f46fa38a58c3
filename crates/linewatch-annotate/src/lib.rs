//! linewatch-annotate – draw detections onto inspection photos.
//!
//! Defect classes (broken or degraded insulators) get a thick red box,
//! everything else a thinner green one, each labeled with the class name and
//! confidence. The annotated photo is re-encoded as JPEG, and the per-photo
//! [`DetectionSummary`] feeds the route statistics downstream.

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use linewatch_detect::Detection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Stroke widths for defect and regular boxes.
const RED_STROKE: i32 = 3;
const GREEN_STROKE: i32 = 2;

/// JPEG quality for processed photos.
pub const JPEG_QUALITY: u8 = 95;

/// Label glyph height in pixels before the per-photo width scaling.
const BASE_GLYPH_PX: f32 = 24.0;

/// Classes the route model predicts, by output index.
pub const CLASS_NAMES: [&str; 8] = [
    "vibration_damper",
    "festoon_insulators",
    "traverse",
    "nest",
    "safety_sign+",
    "bad_insulator",
    "damaged_insulator",
    "polymer_insulators",
];

/// Class indices treated as line defects.
pub const DEFECT_CLASSES: [usize; 2] = [5, 6];

/// True when the class index is a defect (drawn red).
pub fn is_defect(class: usize) -> bool {
    DEFECT_CLASSES.contains(&class)
}

/// Human-readable name for a class index; indices outside the known table
/// render as `class_<id>`.
pub fn class_name(class: usize) -> String {
    match CLASS_NAMES.get(class) {
        Some(name) => (*name).to_string(),
        None => format!("class_{class}"),
    }
}

/// What was drawn on one photo, persisted with its metadata record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub red_count: usize,
    pub green_count: usize,
    pub has_red: bool,
    pub has_green: bool,
    pub total: usize,
}

/// Count detections into defect/non-defect buckets.
pub fn summarize(dets: &[Detection]) -> DetectionSummary {
    let red = dets.iter().filter(|d| is_defect(d.class)).count();
    let green = dets.len() - red;
    DetectionSummary {
        red_count: red,
        green_count: green,
        has_red: red > 0,
        has_green: green > 0,
        total: dets.len(),
    }
}

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("jpeg encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, AnnotateError>;

/// Larger photos get proportionally larger labels, within 0.5x-1.0x.
fn font_scale(img_w: u32) -> f32 {
    (img_w as f32 / 1000.0).clamp(0.5, 1.0)
}

/// Draws labelled boxes and re-encodes the photo.
///
/// The label font is read from disk once at construction, the same way the
/// model file is; without a usable font the boxes are still drawn, only the
/// text is skipped.
pub struct Annotator {
    font: Option<FontVec>,
    jpeg_quality: u8,
}

impl Annotator {
    pub fn new(font_path: Option<&Path>, jpeg_quality: u8) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontVec::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    warn!("label font {} is not a usable font: {e}", path.display());
                    None
                }
            },
            Err(e) => {
                warn!(
                    "label font {} unreadable ({e}), drawing boxes without labels",
                    path.display()
                );
                None
            }
        });
        Self { font, jpeg_quality }
    }

    /// Draw every detection onto the photo and return the JPEG bytes plus
    /// the defect summary.
    pub fn annotate(
        &self,
        mut img: RgbImage,
        dets: &[Detection],
    ) -> Result<(Vec<u8>, DetectionSummary)> {
        for det in dets {
            self.draw_detection(&mut img, det);
        }
        let summary = summarize(dets);

        let mut jpeg = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality);
        img.write_with_encoder(encoder)?;
        Ok((jpeg, summary))
    }

    fn draw_detection(&self, img: &mut RgbImage, det: &Detection) {
        let (img_w, img_h) = img.dimensions();
        let defect = is_defect(det.class);
        let color = if defect { RED } else { GREEN };
        let stroke = if defect { RED_STROKE } else { GREEN_STROKE };

        let x1 = (det.bbox[0].round() as i32).clamp(0, img_w as i32 - 1);
        let y1 = (det.bbox[1].round() as i32).clamp(0, img_h as i32 - 1);
        let x2 = (det.bbox[2].round() as i32).clamp(0, img_w as i32 - 1);
        let y2 = (det.bbox[3].round() as i32).clamp(0, img_h as i32 - 1);
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        // stroke by drawing nested 1px rectangles inward
        for t in 0..stroke {
            let w = x2 - x1 - 2 * t;
            let h = y2 - y1 - 2 * t;
            if w < 1 || h < 1 {
                break;
            }
            let ring = Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(img, ring, color);
        }

        if let Some(font) = &self.font {
            let label = format!("{}: {:.2}", class_name(det.class), det.score);
            let scale = PxScale::from(BASE_GLYPH_PX * font_scale(img_w));
            let (text_w, text_h) = text_size(scale, font, &label);

            // prefer the strip above the box; fall back below the top edge
            let mut ty = y1 - text_h as i32 - 4;
            if ty < 0 {
                ty = y1;
            }
            let background = Rect::at(x1, ty).of_size(text_w + 4, text_h + 4);
            draw_filled_rect_mut(img, background, color);
            draw_text_mut(img, WHITE, x1 + 2, ty + 2, scale, font, &label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], score: f32, class: usize) -> Detection {
        Detection { bbox, score, class }
    }

    #[test]
    fn summary_buckets_by_defect_class() {
        let dets = vec![
            det([0.0, 0.0, 10.0, 10.0], 0.9, 0),
            det([20.0, 0.0, 30.0, 10.0], 0.8, 5),
            det([40.0, 0.0, 50.0, 10.0], 0.7, 6),
            det([60.0, 0.0, 70.0, 10.0], 0.6, 3),
        ];
        let s = summarize(&dets);
        assert_eq!(s.red_count, 2);
        assert_eq!(s.green_count, 2);
        assert!(s.has_red && s.has_green);
        assert_eq!(s.total, 4);
    }

    #[test]
    fn empty_summary_is_all_zero() {
        assert_eq!(summarize(&[]), DetectionSummary::default());
    }

    #[test]
    fn class_names_cover_the_table_and_fall_back() {
        assert_eq!(class_name(5), "bad_insulator");
        assert_eq!(class_name(0), "vibration_damper");
        assert_eq!(class_name(12), "class_12");
        assert!(is_defect(6));
        assert!(!is_defect(7));
    }

    #[test]
    fn summary_serializes_flat() {
        let s = summarize(&[det([0.0, 0.0, 10.0, 10.0], 0.9, 5)]);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["red_count"], 1);
        assert_eq!(json["has_red"], true);
        assert_eq!(json["has_green"], false);
    }

    #[test]
    fn boxes_are_drawn_in_the_right_color() {
        let annotator = Annotator::new(None, JPEG_QUALITY);
        let dets = vec![
            det([10.0, 10.0, 50.0, 50.0], 0.9, 0),
            det([60.0, 10.0, 95.0, 70.0], 0.8, 5),
        ];
        // draw without encoding so individual pixels can be checked
        let mut canvas = RgbImage::from_pixel(100, 80, Rgb([255, 255, 255]));
        for d in &dets {
            annotator.draw_detection(&mut canvas, d);
        }

        // green box edge, stroke 2
        assert_eq!(canvas.get_pixel(10, 30), &Rgb([0, 255, 0]));
        assert_eq!(canvas.get_pixel(11, 30), &Rgb([0, 255, 0]));
        assert_eq!(canvas.get_pixel(12, 30), &Rgb([255, 255, 255]));

        // red box edge, stroke 3
        assert_eq!(canvas.get_pixel(60, 40), &Rgb([255, 0, 0]));
        assert_eq!(canvas.get_pixel(62, 40), &Rgb([255, 0, 0]));
        assert_eq!(canvas.get_pixel(63, 40), &Rgb([255, 255, 255]));

        // interior untouched
        assert_eq!(canvas.get_pixel(30, 30), &Rgb([255, 255, 255]));
    }

    #[test]
    fn annotate_produces_jpeg_bytes_and_summary() {
        let img = RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]));
        let annotator = Annotator::new(None, JPEG_QUALITY);
        let dets = vec![det([8.0, 8.0, 40.0, 40.0], 0.9, 6)];

        let (bytes, summary) = annotator.annotate(img, &dets).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "missing JPEG SOI marker");
        assert_eq!(summary.red_count, 1);
        assert!(summary.has_red);
        assert!(!summary.has_green);
    }

    #[test]
    fn degenerate_and_offscreen_boxes_are_ignored() {
        let img = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let annotator = Annotator::new(None, JPEG_QUALITY);
        let dets = vec![
            det([30.0, 30.0, 30.0, 30.0], 0.9, 0),
            det([-100.0, -100.0, -50.0, -50.0], 0.9, 5),
        ];
        // must not panic; nothing sensible to draw
        let (bytes, summary) = annotator.annotate(img, &dets).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(summary.total, 2);
    }

    #[test]
    fn missing_font_path_still_draws() {
        let annotator = Annotator::new(Some(Path::new("/no/such/font.ttf")), 80);
        let img = RgbImage::from_pixel(32, 32, Rgb([10, 10, 10]));
        let dets = vec![det([4.0, 4.0, 28.0, 28.0], 0.5, 1)];
        let (bytes, _) = annotator.annotate(img, &dets).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
