//! The image analysis pipeline: one linear, synchronous pass from an encoded
//! photo to a label and a normalized preview.

use crate::codec;
use crate::color::{self, GAMMA};
use crate::error::{PipelineError, PredictError, Result, TransformError};
use crate::inference::{Classifier, LabelSet, Segmenter};
use crate::transform;
use crate::util::truncate_message;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of one prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    /// The normalized 224x224 image as a JPEG data URI
    pub preview: String,
}

/// Runs the pipeline against two shared, read-only models
#[derive(Clone)]
pub struct Pipeline {
    segmenter: Arc<dyn Segmenter>,
    classifier: Arc<dyn Classifier>,
    labels: LabelSet,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("segmenter", &self.segmenter.name())
            .field("classifier", &self.classifier.name())
            .field("labels", &self.labels)
            .finish()
    }
}

/// Use the corrected image, or log and keep the input when a cosmetic step fails
fn or_passthrough(
    stage: &'static str,
    input: RgbImage,
    corrected: std::result::Result<RgbImage, TransformError>,
) -> RgbImage {
    match corrected {
        Ok(image) => image,
        Err(err) => {
            warn!(stage, "cosmetic step failed, passing image through: {err}");
            input
        }
    }
}

impl Pipeline {
    pub fn new(
        segmenter: Arc<dyn Segmenter>,
        classifier: Arc<dyn Classifier>,
        labels: LabelSet,
    ) -> Self {
        Pipeline {
            segmenter,
            classifier,
            labels,
        }
    }

    pub fn segmenter_name(&self) -> &str {
        self.segmenter.name()
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Classify a `data:image/...;base64,` photo.
    ///
    /// Returns `PredictError::Validation` for malformed or disallowed input,
    /// in which case neither model is invoked, and `PredictError::Pipeline`
    /// for any failure after decoding.
    #[tracing::instrument(skip_all)]
    pub fn predict(&self, encoded: &str) -> Result<Prediction> {
        let start = Instant::now();

        let image = codec::decode_data_uri(encoded).map_err(|err| {
            warn!(stage = "decode", "rejected input: {}", truncate_message(&err.to_string()));
            err
        })?;

        let processed = self.preprocess(&image).map_err(|err| log_failure("preprocess", err))?;
        let preprocessing = start.elapsed();

        let prediction_start = Instant::now();
        let probability = self
            .classifier
            .probability(&processed)
            .map_err(|err| log_failure("classify", PipelineError::Classification(err)))?;
        let label = self.labels.select(probability).to_string();
        let prediction = prediction_start.elapsed();

        let encoding_start = Instant::now();
        let preview =
            codec::encode_jpeg_data_uri(&processed).map_err(|err| log_failure("encode", err))?;
        let encoding = encoding_start.elapsed();

        info!(
            "prediction completed - class: {label} (p = {probability:.4}) - preprocessing: {:.3}s, prediction: {:.3}s, encoding: {:.3}s, total: {:.3}s",
            preprocessing.as_secs_f64(),
            prediction.as_secs_f64(),
            encoding.as_secs_f64(),
            start.elapsed().as_secs_f64(),
        );

        Ok(Prediction { label, preview })
    }

    /// Everything between decoding and the classifier
    fn preprocess(
        &self,
        image: &image::DynamicImage,
    ) -> std::result::Result<RgbImage, PipelineError> {
        let cut = transform::remove_background(image, self.segmenter.as_ref())?;
        let cropped = transform::crop_to_foreground(cut);
        let flat = transform::flatten_on_white(&cropped);

        let corrected = color::correct_tint(&flat);
        let tinted = or_passthrough("tint", flat, corrected);
        let corrected = color::gamma_correct(&tinted, GAMMA);
        let brightened = or_passthrough("gamma", tinted, corrected);
        let corrected = color::equalize_lightness(&brightened);
        let contrasted = or_passthrough("contrast", brightened, corrected);

        Ok(transform::resize_for_model(&contrasted))
    }
}

fn log_failure(stage: &'static str, err: PipelineError) -> PredictError {
    error!(stage, "prediction failed: {}", truncate_message(&err.to_string()));
    PredictError::Pipeline(err)
}
