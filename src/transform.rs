//! Geometric and compositing steps of the pipeline: mask application,
//! foreground cropping, flattening onto white and the final resize.

use crate::config::MODEL_INPUT_SIZE;
use crate::error::PipelineError;
use crate::inference::Segmenter;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage, RgbaImage};
use tracing::warn;

/// Cut the sample out of its background.
///
/// The segmenter's mask becomes the alpha channel of the returned image and
/// scales the color channels too, so soft edges fade towards black. Any
/// segmenter failure aborts the request; there is no fallback here.
pub fn remove_background(
    image: &DynamicImage,
    segmenter: &dyn Segmenter,
) -> Result<RgbaImage, PipelineError> {
    let mut rgba = image.to_rgba8();
    let mask = segmenter
        .segment(&rgba)
        .map_err(PipelineError::Segmentation)?;

    if mask.dimensions() != rgba.dimensions() {
        return Err(PipelineError::MaskMismatch {
            width: rgba.width(),
            height: rgba.height(),
            mask_width: mask.width(),
            mask_height: mask.height(),
        });
    }

    for (pixel, alpha) in rgba.pixels_mut().zip(mask.pixels()) {
        let alpha = u16::from(alpha[0]);
        for c in pixel.0.iter_mut() {
            *c = ((u16::from(*c) * alpha + 127) / 255) as u8;
        }
    }
    Ok(rgba)
}

/// Bounding box `(x, y, width, height)` of every pixel with non-zero alpha
fn foreground_bounds(image: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[3] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    // upper bound is one past the last foreground pixel
    bounds.map(|(x0, y0, x1, y1)| (x0, y0, x1 + 1 - x0, y1 + 1 - y0))
}

/// Crop to the bounding box of the foreground.
///
/// A fully transparent image is returned as-is.
pub fn crop_to_foreground(image: RgbaImage) -> RgbaImage {
    match foreground_bounds(&image) {
        Some((x, y, width, height)) => imageops::crop_imm(&image, x, y, width, height).to_image(),
        None => {
            warn!("no foreground detected in image, skipping crop");
            image
        }
    }
}

/// Composite over an opaque white canvas and drop the alpha channel
pub fn flatten_on_white(image: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let pixel = image.get_pixel(x, y);
        let alpha = u32::from(pixel[3]);
        let blend = |c: u8| ((u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])])
    })
}

/// Resize to the classifier's fixed input size
pub fn resize_for_model(image: &RgbImage) -> RgbImage {
    imageops::resize(image, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::Lanczos3)
}
