use crate::manager::Handle;
use crate::pipeline::Prediction;
use crate::worker::WorkerStatus;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use std::collections::HashMap;

/// `{"<worker id>": "<status>"}`
pub struct AllStatusResponse(pub HashMap<Handle, WorkerStatus>);

impl Serialize for AllStatusResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut ids: Vec<_> = self.0.keys().collect();
        ids.sort();

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for id in ids {
            map.serialize_entry(&id.to_string(), &self.0[id])?;
        }
        map.end()
    }
}

#[derive(Debug, serde::Serialize, PartialEq)]
pub struct WorkerInfo {
    pub id: Handle,
    pub status: WorkerStatus,
}

/// A photo encoded as a `data:image/...;base64,` URI
#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct PredictResponse {
    pub predicted_class: String,
    pub cropped_image: String,
    pub status: &'static str,
}

impl From<Prediction> for PredictResponse {
    fn from(prediction: Prediction) -> Self {
        PredictResponse {
            predicted_class: prediction.label,
            cropped_image: prediction.preview,
            status: "success",
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ModelNames {
    pub segmentation: String,
    pub classifier: String,
}

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
    pub models: ModelNames,
}

/// JSON body of `/auth/sessionLogin`, also the form body of `/auth/login`
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    #[serde(rename = "idToken", default)]
    pub id_token: Option<String>,
}

impl TokenRequest {
    /// The token, if one was actually sent
    pub fn token(&self) -> Option<&str> {
        self.id_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, serde::Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}
