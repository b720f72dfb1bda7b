//! The manager owns the worker pool. It admits a bounded number of requests,
//! hands each one to an idle worker on the blocking thread pool, and tracks
//! what every worker is doing.

use crate::error::PredictError;
use crate::pipeline::{Pipeline, Prediction};
use crate::settings::PoolSettings;
use crate::worker::{Worker, WorkerStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Identifies a worker in status reports
pub type Handle = usize;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("all workers are busy: retry again later")]
    Busy,

    #[error("worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Predict(#[from] PredictError),
}

type Statuses = Arc<Mutex<Vec<WorkerStatus>>>;

fn lock(statuses: &Mutex<Vec<WorkerStatus>>) -> MutexGuard<'_, Vec<WorkerStatus>> {
    statuses.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A claimed worker. Dropping it marks the worker idle again, however the
/// job finishes, and only then gives its running slot back.
struct Claim {
    statuses: Statuses,
    id: Handle,
    // fields drop after `Drop::drop`, so a waiter woken by this permit
    // always finds the worker idle
    _slot: OwnedSemaphorePermit,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.statuses)[self.id] = WorkerStatus::Idle;
    }
}

/// The worker manager. All workers share one pipeline, and therefore one
/// copy of each model.
#[derive(Debug)]
pub struct Manager {
    pipeline: Arc<Pipeline>,
    workers: Vec<Arc<Worker>>,
    statuses: Statuses,

    /// Running plus queued requests
    admitted: Arc<Semaphore>,

    /// One permit per worker
    running: Arc<Semaphore>,
}

impl Manager {
    pub fn new(pipeline: Arc<Pipeline>, settings: &PoolSettings) -> Self {
        let size = settings.workers.max(1);
        let workers = (0..size)
            .map(|id| Arc::new(Worker::new(id, pipeline.clone())))
            .collect();

        info!(
            "manager started {size} worker(s) with a queue of {}",
            settings.queue_capacity
        );

        Manager {
            pipeline,
            workers,
            statuses: Arc::new(Mutex::new(vec![WorkerStatus::Idle; size])),
            admitted: Arc::new(Semaphore::new(size + settings.queue_capacity)),
            running: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Claim an idle worker with a running slot and mark it working
    fn get_idle_worker(&self, slot: OwnedSemaphorePermit) -> Option<(Arc<Worker>, Claim)> {
        let mut statuses = lock(&self.statuses);
        let id = statuses.iter().position(|s| *s == WorkerStatus::Idle)?;
        statuses[id] = WorkerStatus::Working;

        let claim = Claim {
            statuses: self.statuses.clone(),
            id,
            _slot: slot,
        };
        Some((self.workers[id].clone(), claim))
    }

    /// Run one prediction on the pool, waiting for a worker if needed.
    /// Fails with `ServeError::Busy` when the wait queue is full.
    pub async fn run(&self, image: String) -> Result<Prediction, ServeError> {
        let admission = self.admitted.clone().try_acquire_owned().map_err(|_| {
            warn!("all workers are busy and the queue is full");
            ServeError::Busy
        })?;

        let slot = self
            .running
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| ServeError::Worker(err.to_string()))?;

        let (worker, claim) = self
            .get_idle_worker(slot)
            .ok_or_else(|| ServeError::Worker("no idle worker despite a free slot".into()))?;
        debug!("worker {} picked up a request", worker.id());

        // the permits travel with the job so a dropped request cannot free
        // a worker that is still computing
        let result = tokio::task::spawn_blocking(move || {
            let _claim = claim;
            let _admission = admission;
            worker.run(&image)
        })
        .await
        .map_err(|err| ServeError::Worker(err.to_string()))?;

        Ok(result?)
    }

    /// Get the statuses of all workers
    pub fn all_status(&self) -> HashMap<Handle, WorkerStatus> {
        lock(&self.statuses).iter().copied().enumerate().collect()
    }

    /// Every worker with its current status, in id order
    pub fn workers(&self) -> Vec<(Handle, WorkerStatus)> {
        let statuses = lock(&self.statuses);
        self.workers
            .iter()
            .map(|w| (w.id(), statuses[w.id()]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::inference::{Classifier, LabelSet};
    use crate::util::test::{self, MockSegmenter};
    use image::RgbImage;
    use std::time::Duration;

    struct SlowClassifier;

    impl Classifier for SlowClassifier {
        fn name(&self) -> &str {
            "slow"
        }

        fn probability(&self, _image: &RgbImage) -> Result<f32, ModelError> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(0.1)
        }
    }

    fn slow_manager(workers: usize, queue_capacity: usize) -> Arc<Manager> {
        let pipeline = Pipeline::new(
            Arc::new(MockSegmenter::opaque()),
            Arc::new(SlowClassifier),
            LabelSet::default(),
        );
        Arc::new(Manager::new(
            Arc::new(pipeline),
            &PoolSettings {
                workers,
                queue_capacity,
            },
        ))
    }

    #[tokio::test]
    async fn test_run_and_status() {
        let manager = Manager::new(
            Arc::new(test::mock_pipeline(0.9)),
            &PoolSettings {
                workers: 2,
                queue_capacity: 4,
            },
        );
        assert_eq!(manager.workers().len(), 2);

        let prediction = manager.run(test::png_data_uri(12, 12)).await.unwrap();
        assert_eq!(prediction.label, "Milk+Oil");

        let status = manager.all_status();
        assert_eq!(status.len(), 2);
        assert!(status.values().all(|s| *s == WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn test_predict_errors_pass_through() {
        let manager = Manager::new(Arc::new(test::mock_pipeline(0.9)), &PoolSettings::default());
        let err = manager.run("not-an-image".into()).await.unwrap_err();
        assert!(matches!(err, ServeError::Predict(PredictError::Validation(_))));
        assert!(manager
            .all_status()
            .values()
            .all(|s| *s == WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn test_saturated_pool_is_busy() {
        let manager = slow_manager(1, 0);

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run(test::png_data_uri(8, 8)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.workers(), vec![(0, WorkerStatus::Working)]);
        let err = manager.run(test::png_data_uri(8, 8)).await.unwrap_err();
        assert!(matches!(err, ServeError::Busy));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(manager.workers(), vec![(0, WorkerStatus::Idle)]);
    }

    #[tokio::test]
    async fn test_queued_request_waits_for_worker() {
        let manager = slow_manager(1, 1);

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run(test::png_data_uri(8, 8)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = manager.run(test::png_data_uri(8, 8)).await;
        assert!(second.is_ok());
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_waiters_share_one_worker() {
        let manager = Arc::new(Manager::new(
            Arc::new(test::mock_pipeline(0.2)),
            &PoolSettings {
                workers: 1,
                queue_capacity: 64,
            },
        ));
        let image = test::png_data_uri(8, 8);

        let requests: Vec<_> = (0..64)
            .map(|_| {
                let manager = manager.clone();
                let image = image.clone();
                tokio::spawn(async move { manager.run(image).await })
            })
            .collect();

        for request in requests {
            match request.await.unwrap() {
                Ok(prediction) => assert_eq!(prediction.label, "Milk"),
                Err(err) => panic!("queued request failed: {err}"),
            }
        }
        assert_eq!(manager.workers(), vec![(0, WorkerStatus::Idle)]);
    }
}
