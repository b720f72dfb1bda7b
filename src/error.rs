//! Error types of the analysis pipeline.
//!
//! `ValidationError` is the only kind attributable to the caller. Everything
//! raised after decoding is a `PipelineError`.

use thiserror::Error;

/// Malformed or disallowed input image.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Nothing was sent.
    #[error("Invalid base64 string: input is empty")]
    Empty,

    /// The string is not a data URI for an image.
    #[error("Invalid image format: expected a `data:image/<type>;base64,` prefix")]
    MissingPrefix,

    /// The data URI header could not be parsed.
    #[error("Malformed data URI header: {0}")]
    MalformedHeader(String),

    /// The MIME type is outside the allowed set.
    #[error("Unsupported image type: {0}")]
    UnsupportedType(String),

    /// The payload is not valid base64.
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The payload decoded to zero bytes.
    #[error("Empty image data")]
    EmptyPayload,

    /// The bytes are not a raster image we can read.
    #[error("Invalid image data: {0}")]
    Undecodable(#[source] image::ImageError),
}

/// Failure inside a model call.
#[derive(Error, Debug)]
pub enum ModelError {
    /// ONNX Runtime rejected the input or failed while running.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// A previous inference panicked while holding the session.
    #[error("session lock for model {model} is poisoned")]
    Poisoned { model: String },

    /// The model returned something other than what we expect.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// The model returned no outputs at all.
    #[error("model produced no output")]
    NoOutput,
}

impl From<ort::Error> for ModelError {
    fn from(source: ort::Error) -> Self {
        ModelError::Inference { source }
    }
}

/// Server-side failure of a prediction.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("background removal failed: {0}")]
    Segmentation(#[source] ModelError),

    #[error("segmentation mask is {mask_width}x{mask_height} but the image is {width}x{height}")]
    MaskMismatch {
        width: u32,
        height: u32,
        mask_width: u32,
        mask_height: u32,
    },

    #[error("classification failed: {0}")]
    Classification(#[source] ModelError),

    #[error("failed to encode preview image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Failure of a cosmetic color step. Never leaves the pipeline.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("image has no pixels")]
    EmptyImage,

    #[error("pixel buffer does not match {width}x{height}")]
    BufferSize { width: u32, height: u32 },

    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Everything `Pipeline::predict` can return.
#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PredictError>;
