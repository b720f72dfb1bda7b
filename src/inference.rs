//! The two pretrained models behind the pipeline.
//!
//! The pipeline only sees the `Segmenter` and `Classifier` traits, so tests
//! can swap in mocks. The ONNX Runtime implementations share one session
//! pool type: ORT needs exclusive access to a session while it runs, so each
//! model owns a few mutex-guarded sessions handed out round-robin.

use crate::config::{DECISION_THRESHOLD, SEGMENTATION_INPUT_SIZE};
use crate::error::ModelError;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage, RgbaImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Produces a per-pixel foreground mask
pub trait Segmenter: Send + Sync {
    fn name(&self) -> &str;

    /// Mask with the same dimensions as `image`; 255 is foreground
    fn segment(&self, image: &RgbaImage) -> Result<GrayImage, ModelError>;
}

/// Produces the probability that a normalized sample belongs to the
/// positive (adulterated) class
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn probability(&self, image: &RgbImage) -> Result<f32, ModelError>;
}

/// The classifier's two output classes, in output order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    /// Selected when the probability is at or below the threshold
    pub negative: String,
    /// Selected when the probability is above the threshold
    pub positive: String,
}

impl Default for LabelSet {
    fn default() -> Self {
        LabelSet {
            negative: "Milk".into(),
            positive: "Milk+Oil".into(),
        }
    }
}

impl LabelSet {
    pub fn labels(&self) -> [&str; 2] {
        [&self.negative, &self.positive]
    }

    /// Class index for a probability: 1 when strictly above the threshold
    pub fn select_index(probability: f32) -> usize {
        usize::from(probability > DECISION_THRESHOLD)
    }

    pub fn select(&self, probability: f32) -> &str {
        self.labels()[Self::select_index(probability)]
    }
}

/// Memory layout the classifier expects its input in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `(1, height, width, 3)`, as exported from Keras
    #[default]
    Nhwc,
    /// `(1, 3, height, width)`
    Nchw,
}

/// A set of ONNX sessions for one model
pub struct SessionPool {
    name: String,
    sessions: Vec<Mutex<Session>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionPool {{ name: {:?}, sessions: {} }}",
            self.name,
            self.sessions.len()
        )
    }
}

impl SessionPool {
    /// Wrap already-built sessions. `sessions` must not be empty.
    pub fn new(name: String, sessions: Vec<Session>) -> Self {
        SessionPool {
            name,
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A custom metadata entry of the model, if it carries one
    pub fn custom_metadata(&self, key: &str) -> Result<Option<String>, ModelError> {
        let session = self
            .sessions
            .first()
            .ok_or(ModelError::NoOutput)?
            .lock()
            .map_err(|_| ModelError::Poisoned {
                model: self.name.clone(),
            })?;
        let metadata = session.metadata()?;
        Ok(metadata.custom(key)?)
    }

    /// Run one input tensor and copy out the first output as `f32`
    fn run_first_output(&self, input: Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), ModelError> {
        if self.sessions.is_empty() {
            return Err(ModelError::NoOutput);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[idx]
            .lock()
            .map_err(|_| ModelError::Poisoned {
                model: self.name.clone(),
            })?;

        let tensor = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![tensor])?;
        let output = outputs.values().next().ok_or(ModelError::NoOutput)?;

        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok((dims, data.to_vec()))
    }
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// U2-Net salient object segmentation
#[derive(Debug)]
pub struct U2NetSegmenter {
    pool: SessionPool,
}

impl U2NetSegmenter {
    pub fn new(pool: SessionPool) -> Self {
        U2NetSegmenter { pool }
    }
}

impl Segmenter for U2NetSegmenter {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn segment(&self, image: &RgbaImage) -> Result<GrayImage, ModelError> {
        let (dims, data) = self.pool.run_first_output(u2net_input(image))?;
        let mask = mask_from_prediction(&dims, &data)?;
        Ok(imageops::resize(
            &mask,
            image.width(),
            image.height(),
            FilterType::Lanczos3,
        ))
    }
}

/// Resize to the network's square input, scale by the brightest channel
/// value and apply ImageNet normalization, NCHW
fn u2net_input(image: &RgbaImage) -> Array4<f32> {
    let rgb = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        image::Rgb([p[0], p[1], p[2]])
    });
    let size = SEGMENTATION_INPUT_SIZE;
    let resized = imageops::resize(&rgb, size, size, FilterType::Lanczos3);

    let max = f32::from(resized.as_raw().iter().copied().max().unwrap_or(0)).max(1e-6);

    let size = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel[c]) / max;
            tensor[[0, c, y as usize, x as usize]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

/// Min/max normalize the first channel of the first output into a grey mask
fn mask_from_prediction(dims: &[usize], data: &[f32]) -> Result<GrayImage, ModelError> {
    let (height, width) = match dims {
        [batch, channels, height, width] if *batch > 0 && *channels > 0 => (*height, *width),
        _ => {
            return Err(ModelError::ShapeMismatch {
                expected: "(1, C, H, W) saliency map".into(),
                actual: format!("{dims:?}"),
            })
        }
    };
    let plane = data.get(..height * width).ok_or_else(|| ModelError::ShapeMismatch {
        expected: format!("{} values", height * width),
        actual: format!("{} values", data.len()),
    })?;

    let (min, max) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    let pixels = plane
        .iter()
        .map(|&v| {
            if range > 0.0 {
                ((v - min) / range * 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    GrayImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        ModelError::ShapeMismatch {
            expected: format!("{width}x{height} mask"),
            actual: "short buffer".into(),
        }
    })
}

/// Binary classifier with a single sigmoid output
#[derive(Debug)]
pub struct OnnxClassifier {
    pool: SessionPool,
    layout: TensorLayout,
}

impl OnnxClassifier {
    pub fn new(pool: SessionPool, layout: TensorLayout) -> Self {
        OnnxClassifier { pool, layout }
    }
}

impl Classifier for OnnxClassifier {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn probability(&self, image: &RgbImage) -> Result<f32, ModelError> {
        let (_, data) = self
            .pool
            .run_first_output(classifier_input(image, self.layout))?;
        data.first().copied().ok_or(ModelError::NoOutput)
    }
}

/// Raw `[0, 255]` pixel values with a batch dimension of 1. Any further
/// normalization is baked into the exported model.
fn classifier_input(image: &RgbImage, layout: TensorLayout) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = match layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
    };
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = f32::from(pixel[c]);
            match layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
            }
        }
    }
    tensor
}
