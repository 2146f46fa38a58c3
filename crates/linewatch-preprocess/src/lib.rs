//! linewatch-preprocess – decode + letterbox uploaded photos for the model.
//!
//! Inspection photos arrive in whatever size the field tablet produced; the
//! detection model wants one fixed square input. [`Letterbox`] scales the
//! photo to fit without distorting it, centers it on a gray canvas and packs
//! the result as a CHW float tensor. The [`LetterboxPlan`] it returns is the
//! exact key for mapping model-space boxes back onto the original photo.

use image::RgbImage;
use ndarray::Array4;
use resize::{Pixel, Type};
use rgb::FromSlice;
use thiserror::Error;
use tracing::debug;

/// Fill value for the padding bars, one neutral gray for all three channels.
pub const PAD_GRAY: u8 = 128;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("resize failed: {0}")]
    Resize(#[from] resize::Error),
    #[error("refusing to letterbox an empty image ({0}x{1})")]
    EmptyImage(u32, u32),
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

/// Decode raw upload bytes into an RGB image, guessing the format.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Geometry of one letterbox transform.
///
/// Invariant: `round(orig * scale) + pad == target` along each axis, so the
/// remapping step can undo the transform exactly, up to integer rounding in
/// the padding split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxPlan {
    /// Uniform scale applied to the original photo. Greater than 1.0 when a
    /// small photo was scaled up to fill the canvas.
    pub scale: f32,
    /// Padding bars in canvas pixels: left, top, right, bottom.
    pub pad: (u32, u32, u32, u32),
    /// Original photo size (width, height).
    pub orig: (u32, u32),
}

impl LetterboxPlan {
    /// Size of the scaled photo content inside the canvas, excluding padding.
    pub fn content_size(&self) -> (u32, u32) {
        (
            ((self.orig.0 as f32 * self.scale).round() as u32).max(1),
            ((self.orig.1 as f32 * self.scale).round() as u32).max(1),
        )
    }
}

/// Aspect-preserving resize onto a fixed gray canvas.
#[derive(Clone)]
pub struct Letterbox {
    dst_w: u32,
    dst_h: u32,
}

impl Letterbox {
    /// Create a letterbox targeting a WxH model input.
    pub fn new(dst_w: u32, dst_h: u32) -> Self {
        Self { dst_w, dst_h }
    }

    /// Target canvas size (width, height).
    pub fn target(&self) -> (u32, u32) {
        (self.dst_w, self.dst_h)
    }

    /// Run the transform: returns the `[1, 3, H, W]` tensor with values in
    /// 0-1.0f32 plus the plan needed to invert it.
    pub fn run(&self, img: &RgbImage) -> Result<(Array4<f32>, LetterboxPlan)> {
        let (img_w, img_h) = img.dimensions();
        if img_w == 0 || img_h == 0 {
            return Err(PreprocessError::EmptyImage(img_w, img_h));
        }

        // 1. uniform scale that fits the photo inside the canvas; no cap, a
        //    photo smaller than the canvas is scaled up
        let scale = (self.dst_w as f32 / img_w as f32).min(self.dst_h as f32 / img_h as f32);
        let new_w = ((img_w as f32 * scale).round() as u32).max(1);
        let new_h = ((img_h as f32 * scale).round() as u32).max(1);

        // 2. Lanczos3 resize on the raw RGB8 buffer (resize crate)
        let mut scaled = vec![0u8; (new_w * new_h * 3) as usize];
        let mut resizer = resize::new(
            img_w as usize,
            img_h as usize,
            new_w as usize,
            new_h as usize,
            Pixel::RGB8,
            Type::Lanczos3,
        )?;
        resizer.resize(img.as_raw().as_rgb(), scaled.as_rgb_mut())?;

        // 3. split the leftover canvas evenly; left/top take the smaller half
        let left = (self.dst_w - new_w) / 2;
        let top = (self.dst_h - new_h) / 2;
        let right = self.dst_w - new_w - left;
        let bottom = self.dst_h - new_h - top;

        // 4. normalize to 0-1 and pack as [1, 3, H, W], gray everywhere the
        //    scaled content does not reach
        let mut arr = Array4::<f32>::from_elem(
            (1, 3, self.dst_h as usize, self.dst_w as usize),
            PAD_GRAY as f32 / 255.0,
        );
        for y in 0..new_h as usize {
            for x in 0..new_w as usize {
                let base = (y * new_w as usize + x) * 3;
                for c in 0..3 {
                    arr[(0, c, top as usize + y, left as usize + x)] =
                        scaled[base + c] as f32 / 255.0;
                }
            }
        }

        let plan = LetterboxPlan {
            scale,
            pad: (left, top, right, bottom),
            orig: (img_w, img_h),
        };
        debug!(
            "letterboxed {}x{} -> {}x{} content in {}x{} canvas (scale {:.4})",
            img_w, img_h, new_w, new_h, self.dst_w, self.dst_h, scale
        );
        Ok((arr, plan))
    }
}
