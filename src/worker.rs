//! An inference worker is one slot of the in-process pool. It runs the full
//! pipeline for a single request at a time.

use crate::error::PredictError;
use crate::pipeline::{Pipeline, Prediction};
use serde::Serialize;
use std::sync::Arc;

/// The current status of a worker
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Currently computing inference
    Working,

    /// Waiting for a request
    Idle,
}

#[derive(Debug)]
pub struct Worker {
    id: usize,
    pipeline: Arc<Pipeline>,
}

impl Worker {
    pub fn new(id: usize, pipeline: Arc<Pipeline>) -> Self {
        Worker { id, pipeline }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run the pipeline on one encoded image. Blocks the calling thread.
    #[tracing::instrument(skip(self, image), fields(worker = self.id))]
    pub fn run(&self, image: &str) -> Result<Prediction, PredictError> {
        self.pipeline.predict(image)
    }
}
