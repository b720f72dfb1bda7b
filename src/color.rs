//! Cosmetic color and contrast corrections.
//!
//! The parameters are fixed for the sample-photography setup (constant
//! lighting and background). Every step returns a `Result` so the pipeline
//! can fall back to the untouched input instead of failing the request.
//!
//! Conversions go through OpenCV so the classifier sees the same pixels it
//! was trained on: 8-bit hue lives in `[0, 180)`, and 8-bit Lab lightness is
//! scaled to `[0, 255]`.

use crate::error::TransformError;
use image::RgbImage;
use opencv::core::{AlgorithmHint, Mat, Scalar, Size, Vector, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;

/// Hue rotation correcting the blue-ish tint of the capture setup
pub const HUE_SHIFT: u8 = 10;

/// Saturation boost applied with the hue rotation
pub const SATURATION_SCALE: f32 = 1.2;

/// Exponent of the midtone gamma correction
pub const GAMMA: f32 = 1.1;

/// CLAHE clip limit, relative to a uniform histogram
pub const CLAHE_CLIP_LIMIT: f64 = 2.0;

/// CLAHE tiles per axis
pub const CLAHE_TILES: i32 = 8;

/// Period of the 8-bit hue wheel
const HUE_PERIOD: u16 = 180;

fn ensure_not_empty(image: &RgbImage) -> Result<(), TransformError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(TransformError::EmptyImage);
    }
    Ok(())
}

/// Copy an RGB image into a fresh 3-channel `Mat`
fn to_mat(image: &RgbImage) -> Result<Mat, TransformError> {
    let mut mat = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        CV_8UC3,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

fn from_mat(mat: &Mat, width: u32, height: u32) -> Result<RgbImage, TransformError> {
    RgbImage::from_vec(width, height, mat.data_bytes()?.to_vec())
        .ok_or(TransformError::BufferSize { width, height })
}

fn convert(src: &Mat, code: i32) -> Result<Mat, TransformError> {
    let mut dst = Mat::default();
    imgproc::cvt_color(src, &mut dst, code, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;
    Ok(dst)
}

/// Rotate the hue of every packed HSV pixel by `shift` around the wheel
pub fn shift_hue(hsv: &mut [u8], shift: u8) {
    for pixel in hsv.chunks_exact_mut(3) {
        pixel[0] = ((u16::from(pixel[0]) + u16::from(shift)) % HUE_PERIOD) as u8;
    }
}

/// Multiply every saturation by `factor`, truncating into `[0, 255]`
pub fn scale_saturation(hsv: &mut [u8], factor: f32) {
    for pixel in hsv.chunks_exact_mut(3) {
        pixel[1] = (f32::from(pixel[1]) * factor).clamp(0.0, 255.0) as u8;
    }
}

/// Rotate hue by `HUE_SHIFT` and boost saturation by `SATURATION_SCALE`
pub fn correct_tint(image: &RgbImage) -> Result<RgbImage, TransformError> {
    ensure_not_empty(image)?;
    let mut hsv = convert(&to_mat(image)?, imgproc::COLOR_RGB2HSV)?;

    let pixels = hsv.data_bytes_mut()?;
    shift_hue(pixels, HUE_SHIFT);
    scale_saturation(pixels, SATURATION_SCALE);

    let rgb = convert(&hsv, imgproc::COLOR_HSV2RGB)?;
    from_mat(&rgb, image.width(), image.height())
}

/// Raise every normalized channel value to `gamma`
pub fn gamma_correct(image: &RgbImage, gamma: f32) -> Result<RgbImage, TransformError> {
    ensure_not_empty(image)?;
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        // truncating, like a float-to-u8 cast of the scaled value
        *entry = ((i as f32 / 255.0).powf(gamma) * 255.0).clamp(0.0, 255.0) as u8;
    }

    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = lut[usize::from(*c)];
        }
    }
    Ok(out)
}

/// CLAHE on the Lab lightness channel only
pub fn equalize_lightness(image: &RgbImage) -> Result<RgbImage, TransformError> {
    ensure_not_empty(image)?;
    let lab = convert(&to_mat(image)?, imgproc::COLOR_RGB2Lab)?;

    let mut channels = Vector::<Mat>::new();
    opencv::core::split(&lab, &mut channels)?;

    let mut clahe =
        imgproc::create_clahe(CLAHE_CLIP_LIMIT, Size::new(CLAHE_TILES, CLAHE_TILES))?;
    let mut lightness = Mat::default();
    clahe.apply(&channels.get(0)?, &mut lightness)?;
    channels.set(0, lightness)?;

    let mut equalized = Mat::default();
    opencv::core::merge(&channels, &mut equalized)?;

    let rgb = convert(&equalized, imgproc::COLOR_Lab2RGB)?;
    from_mat(&rgb, image.width(), image.height())
}
