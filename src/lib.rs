pub mod auth;
pub mod codec;
pub mod color;
pub mod error;
pub mod hub;
pub mod inference;
pub mod manager;
pub mod pipeline;
pub mod server;
pub mod settings;
pub mod transform;
pub mod worker;

pub use error::{PipelineError, PredictError, ValidationError};
pub use pipeline::{Pipeline, Prediction};

/// Fixed pipeline constants. These are tuned for the sample-photography
/// setup and are deliberately not part of the runtime settings.
pub mod config {
    /// Version reported by the health endpoint
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Every accepted image must start with this
    pub const DATA_URI_PREFIX: &str = "data:image/";

    /// MIME types accepted by `/predict`
    pub const ALLOWED_IMAGE_TYPES: [&str; 4] =
        ["image/jpeg", "image/jpg", "image/png", "image/webp"];

    /// Spatial input contract of the classifier
    pub const MODEL_INPUT_SIZE: u32 = 224;

    /// Side of the square U2-Net input
    pub const SEGMENTATION_INPUT_SIZE: u32 = 320;

    /// Probabilities strictly above this select the second label
    pub const DECISION_THRESHOLD: f32 = 0.5;

    /// JPEG quality of the preview image returned to the caller
    pub const PREVIEW_JPEG_QUALITY: u8 = 85;

    /// Largest accepted request body (16 MiB)
    pub const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

    /// Diagnostic messages are cut to this many characters in logs
    pub const MAX_LOGGED_MESSAGE: usize = 200;
}

/// Small helpers shared across modules
pub mod util {
    use crate::config::MAX_LOGGED_MESSAGE;

    /// Cut a diagnostic message down to something that fits on a log line
    pub fn truncate_message(message: &str) -> String {
        match message.char_indices().nth(MAX_LOGGED_MESSAGE) {
            Some((idx, _)) => format!("{}...", &message[..idx]),
            None => message.to_string(),
        }
    }

}
