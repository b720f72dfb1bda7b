//! Locating model files and turning them into ONNX Runtime sessions.
//!
//! A model is looked up at its configured local path first, then in the
//! cache directory, and only then downloaded from the model hub.

use crate::error::ModelError;
use crate::inference::{
    Classifier, LabelSet, OnnxClassifier, Segmenter, SessionPool, U2NetSegmenter,
};
use crate::settings::{ModelSettings, ModelSource};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const HUB_BASE_URL: &str = "https://huggingface.co";

/// Metadata key a classifier export can use to declare its label order
pub const CLASS_NAMES_METADATA_KEY: &str = "class_names";

#[derive(Error, Debug)]
pub enum HubError {
    #[error("failed to create model cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download model {name}: {source}")]
    Download {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to load ONNX model {name}: {source}")]
    Session {
        name: String,
        #[source]
        source: ort::Error,
    },

    #[error("failed to read metadata of model {name}: {source}")]
    Metadata {
        name: String,
        #[source]
        source: ModelError,
    },

    #[error("classifier declares labels [{found}] but the configured order is [{expected}]")]
    LabelMismatch { expected: String, found: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves model files, downloading them into a cache when needed
#[derive(Debug)]
pub struct ModelStore {
    cache_dir: PathBuf,
}

impl ModelStore {
    /// Use `cache_dir`, or the platform cache directory when `None`
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self, HubError> {
        let cache_dir = cache_dir.unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("milkscan")
                .join("models")
        });

        fs::create_dir_all(&cache_dir).map_err(|source| HubError::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        Ok(ModelStore { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where a hub model is kept once downloaded
    pub fn cached_path(&self, source: &ModelSource) -> PathBuf {
        self.cache_dir
            .join(source.repo_id.replace('/', "--"))
            .join(&source.file_name)
    }

    /// Local path of a model file, downloading it if necessary
    pub fn resolve(&self, source: &ModelSource) -> Result<PathBuf, HubError> {
        if let Some(path) = &source.path {
            if path.is_file() {
                info!("using local model {}", path.display());
                return Ok(path.clone());
            }
            warn!(
                "configured model {} not found, falling back to the model hub",
                path.display()
            );
        }

        let cached = self.cached_path(source);
        if cached.is_file() {
            info!("using cached model {}", cached.display());
            return Ok(cached);
        }

        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent)?;
        }
        download_file(&hub_url(source), &cached, &source.file_name)?;
        Ok(cached)
    }

    /// Build `settings.sessions_per_model` sessions for one model
    pub fn load_pool(
        &self,
        source: &ModelSource,
        settings: &ModelSettings,
    ) -> Result<SessionPool, HubError> {
        let path = self.resolve(source)?;
        let count = settings.sessions_per_model.max(1);

        let sessions = (0..count)
            .map(|_| build_session(&path, settings.intra_threads))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source_err| HubError::Session {
                name: source.file_name.clone(),
                source: source_err,
            })?;

        info!(
            "loaded {} with {count} session(s) from {}",
            source.file_name,
            path.display()
        );
        Ok(SessionPool::new(source.file_name.clone(), sessions))
    }
}

/// Download URL of a model file on the hub
pub fn hub_url(source: &ModelSource) -> String {
    format!(
        "{HUB_BASE_URL}/{}/resolve/main/{}",
        source.repo_id, source.file_name
    )
}

fn build_session(path: &Path, intra_threads: Option<usize>) -> Result<Session, ort::Error> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if let Some(threads) = intra_threads {
        builder = builder.with_intra_threads(threads)?;
    }
    builder.commit_from_file(path)
}

/// Download `url` to `path` through a temporary file
fn download_file(url: &str, path: &Path, name: &str) -> Result<(), HubError> {
    info!("downloading {name} from {url}");
    let download_err = |source| HubError::Download {
        name: name.to_string(),
        source,
    };

    let client = reqwest::blocking::Client::new();
    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(download_err)?;

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("part");
    let mut file = fs::File::create(&temp_path)?;
    let bytes = response.copy_to(&mut file).map_err(download_err)?;
    drop(file);
    fs::rename(&temp_path, path)?;

    info!("downloaded {name} ({bytes} bytes)");
    Ok(())
}

/// Compare the label order a classifier declares in its metadata with the
/// configured one. Models without the key are trusted with a warning.
pub fn check_label_metadata(declared: Option<&str>, labels: &LabelSet) -> Result<(), HubError> {
    let expected = labels.labels();
    match declared {
        Some(names) => {
            let found: Vec<&str> = names.split(',').map(str::trim).collect();
            if found.as_slice() != expected.as_slice() {
                return Err(HubError::LabelMismatch {
                    expected: expected.join(", "),
                    found: found.join(", "),
                });
            }
            info!("classifier label order confirmed by model metadata");
        }
        None => warn!(
            "classifier has no `{CLASS_NAMES_METADATA_KEY}` metadata, assuming label order [{}]",
            expected.join(", ")
        ),
    }
    Ok(())
}

/// The two shared model handles
pub struct LoadedModels {
    pub segmenter: Arc<dyn Segmenter>,
    pub classifier: Arc<dyn Classifier>,
}

/// Build both models. Called once at startup.
pub fn load_models(settings: &ModelSettings, labels: &LabelSet) -> Result<LoadedModels, HubError> {
    let store = ModelStore::new(settings.cache_dir.clone())?;
    info!("model cache at {}", store.cache_dir().display());

    let segmenter = U2NetSegmenter::new(store.load_pool(&settings.segmentation, settings)?);

    let pool = store.load_pool(&settings.classifier, settings)?;
    let declared = pool
        .custom_metadata(CLASS_NAMES_METADATA_KEY)
        .map_err(|source| HubError::Metadata {
            name: settings.classifier.file_name.clone(),
            source,
        })?;
    check_label_metadata(declared.as_deref(), labels)?;
    let classifier = OnnxClassifier::new(pool, settings.input_layout);

    Ok(LoadedModels {
        segmenter: Arc::new(segmenter),
        classifier: Arc::new(classifier),
    })
}
