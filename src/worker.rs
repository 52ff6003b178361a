//! Single-writer job queue.
//!
//! SQLite tolerates one writer at a time; instead of letting the poller,
//! the reconstructor, and the batch jobs contend for the write lock, every
//! mutation funnels through one bounded channel drained by one consumer
//! task. Jobs therefore execute strictly in submission order, and a snapshot
//! is always fully ingested before the reconstruction enqueued after it
//! runs.
//!
//! The channel is bounded and lossy on purpose: if the worker falls behind,
//! new snapshots are dropped rather than queued without limit. A dropped
//! snapshot costs nothing but resolution; the next poll carries the
//! cumulative difference.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::TrackerConfig;
use crate::ingest::Differencer;
use crate::malfunction::MalfunctionDetector;
use crate::model::Snapshot;
use crate::recovery::{RecoveryEngine, RecoveryReport};
use crate::storage::Storage;
use crate::trips::TripDetector;

/// One unit of write work.
#[derive(Debug)]
pub enum Job {
    Ingest(Box<Snapshot>),
    ReconstructTrips,
    DetectMalfunctions,
    RunRecovery,
    ResetBikeState,
    DedupeTrips,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Ingest(_) => "ingest",
            Job::ReconstructTrips => "reconstruct_trips",
            Job::DetectMalfunctions => "detect_malfunctions",
            Job::RunRecovery => "run_recovery",
            Job::ResetBikeState => "reset_bike_state",
            Job::DedupeTrips => "dedupe_trips",
        }
    }
}

/// Point-in-time view of the queue, served by the status probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub worker_alive: bool,
    pub pending: usize,
    pub capacity: usize,
}

/// What the most recent full recovery run did, and when it finished.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveryOutcome {
    pub finished_at: DateTime<Utc>,
    pub report: RecoveryReport,
}

/// Handle to the writer task. Cheap to clone; all clones feed the same
/// queue.
#[derive(Clone)]
pub struct QueueWorker {
    tx: mpsc::Sender<Job>,
    handle: Arc<JoinHandle<()>>,
    capacity: usize,
    last_recovery: Arc<Mutex<Option<RecoveryOutcome>>>,
}

impl QueueWorker {
    /// Spawn the consumer task and return the handle.
    pub fn start(storage: Storage, config: TrackerConfig, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let last_recovery = Arc::new(Mutex::new(None));

        let handle = tokio::spawn(consume(rx, storage, config, last_recovery.clone()));

        info!(capacity, "queue worker started");
        Self {
            tx,
            handle: Arc::new(handle),
            capacity,
            last_recovery,
        }
    }

    /// Submit a job without waiting. Returns false when the queue is full
    /// or the worker is gone; the job is dropped in both cases.
    pub fn enqueue(&self, job: Job) -> bool {
        let name = job.name();
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job = name, "queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(job = name, "queue worker is gone, dropping job");
                false
            }
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            worker_alive: !self.handle.is_finished(),
            pending: self.capacity - self.tx.capacity(),
            capacity: self.capacity,
        }
    }

    /// The outcome of the most recent completed recovery run, if any.
    pub fn last_recovery(&self) -> Option<RecoveryOutcome> {
        self.last_recovery
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Close the queue and wait for in-flight work to finish. Only drains
    /// fully when this is the last clone of the handle.
    pub async fn shutdown(self) {
        let QueueWorker { tx, handle, .. } = self;
        drop(tx);
        if let Ok(handle) = Arc::try_unwrap(handle) {
            if let Err(e) = handle.await {
                error!(error = %e, "queue worker did not shut down cleanly");
            }
        }
        info!("queue worker stopped");
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Job>,
    storage: Storage,
    config: TrackerConfig,
    last_recovery: Arc<Mutex<Option<RecoveryOutcome>>>,
) {
    let differencer = Differencer::new(storage.clone(), config.clone());
    let trips = TripDetector::new(storage.clone(), config.clone());
    let malfunctions = MalfunctionDetector::new(storage.clone());
    let recovery = RecoveryEngine::new(storage, config);

    while let Some(job) = rx.recv().await {
        let name = job.name();
        let result = match job {
            Job::Ingest(snapshot) => differencer.ingest(&snapshot).await.map(|_| ()),
            Job::ReconstructTrips => trips.reconstruct(Utc::now()).await.map(|_| ()),
            Job::DetectMalfunctions => malfunctions.detect(Utc::now()).await.map(|_| ()),
            Job::RunRecovery => match recovery.run(Utc::now()).await {
                Ok(report) => {
                    if let Ok(mut guard) = last_recovery.lock() {
                        *guard = Some(RecoveryOutcome {
                            finished_at: Utc::now(),
                            report,
                        });
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Job::ResetBikeState => recovery
                .reset_from_observations(Utc::now())
                .await
                .map(|_| ()),
            Job::DedupeTrips => recovery.dedupe_trips().await.map(|_| ()),
        };

        // A failed job never takes the worker down with it.
        if let Err(e) = result {
            error!(job = name, error = %e, "job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BikePresence, BikeStatus, StationRecord};
    use chrono::{DateTime, Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn t(secs: i64) -> DateTime<Utc> {
        // Anchor snapshots near the wall clock so reconstruction's
        // now-relative lookback windows cover them.
        Utc.timestamp_opt(Utc::now().timestamp() - 3600 + secs, 0).unwrap()
    }

    fn snapshot(at: DateTime<Utc>, bikes_at_a: Vec<&str>, bikes_at_b: Vec<&str>) -> Snapshot {
        let presence = |names: Vec<&str>| {
            names
                .into_iter()
                .map(|n| BikePresence {
                    name: n.to_string(),
                    electric: false,
                    status: BikeStatus::Available,
                    dock_position: None,
                })
                .collect()
        };
        Snapshot {
            captured_at: at,
            stations: vec![
                StationRecord {
                    code: "A".to_string(),
                    name: "Station A".to_string(),
                    latitude: 48.8532,
                    longitude: 2.3692,
                    nb_bike: 0,
                    nb_ebike: 0,
                    nb_free_dock: 10,
                    total_capacity: 10,
                    bikes: presence(bikes_at_a),
                },
                StationRecord {
                    code: "B".to_string(),
                    name: "Station B".to_string(),
                    latitude: 48.8656,
                    longitude: 2.3212,
                    nb_bike: 0,
                    nb_ebike: 0,
                    nb_free_dock: 10,
                    total_capacity: 10,
                    bikes: presence(bikes_at_b),
                },
            ],
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let worker = QueueWorker::start(storage.clone(), TrackerConfig::default(), 16);

        // Bike rides from A to B over three polls, five minutes door to door.
        assert!(worker.enqueue(Job::Ingest(Box::new(snapshot(t(0), vec!["b1"], vec![])))));
        assert!(worker.enqueue(Job::Ingest(Box::new(snapshot(t(60), vec![], vec![])))));
        assert!(worker.enqueue(Job::Ingest(Box::new(snapshot(t(360), vec![], vec!["b1"])))));
        assert!(worker.enqueue(Job::ReconstructTrips));

        let s = storage.clone();
        wait_for(|| {
            let s = s.clone();
            async move { s.count_trips().await.unwrap() == 1 }
        })
        .await;

        let trips = storage
            .list_trips(&crate::storage::TripFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trips[0].duration, 300);
        assert_eq!(trips[0].end_time - trips[0].start_time, Duration::seconds(300));
        assert!(!trips[0].is_boomerang);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_probe() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let worker = QueueWorker::start(storage, TrackerConfig::default(), 8);

        let status = worker.status();
        assert!(status.worker_alive);
        assert_eq!(status.capacity, 8);
        assert!(status.pending <= 8);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_job_does_not_kill_worker() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let worker = QueueWorker::start(storage.clone(), TrackerConfig::default(), 8);

        // Recovery on an empty store succeeds trivially; the point is that
        // the worker keeps consuming afterwards.
        worker.enqueue(Job::RunRecovery);
        worker.enqueue(Job::Ingest(Box::new(snapshot(t(0), vec!["b1"], vec![]))));

        let s = storage.clone();
        wait_for(|| {
            let s = s.clone();
            async move { s.count_bikes().await.unwrap() == 1 }
        })
        .await;

        assert!(worker.status().worker_alive);
        worker.shutdown().await;
    }
}
