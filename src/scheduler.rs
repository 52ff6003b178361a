//! Periodic job scheduling.
//!
//! Four fixed-cadence loops drive the pipeline, each doing nothing but
//! enqueueing work on the writer queue (the poll loop additionally performs
//! the feed fetch, which is read-only and safe outside the writer):
//!
//! - poll the feed and enqueue the snapshot for ingestion
//! - enqueue trip reconstruction
//! - enqueue malfunction detection
//! - enqueue a full recovery run
//!
//! A failed fetch skips that cycle. A full queue drops the job; the next
//! tick tries again.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::TrackerConfig;
use crate::feed::FeedClient;
use crate::worker::{Job, QueueWorker};

pub struct Scheduler {
    feed: FeedClient,
    worker: QueueWorker,
    config: TrackerConfig,
}

impl Scheduler {
    pub fn new(feed: FeedClient, worker: QueueWorker, config: TrackerConfig) -> Self {
        Self {
            feed,
            worker,
            config,
        }
    }

    /// Spawn all loops. The handles never resolve on their own; abort them
    /// (or exit the process) to stop scheduling.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        info!(
            poll = self.config.poll_interval_secs,
            reconstruct = self.config.reconstruct_interval_secs,
            detect = self.config.detect_interval_secs,
            recovery = self.config.recovery_interval_secs,
            "scheduler started"
        );

        vec![
            tokio::spawn(poll_loop(
                self.feed,
                self.worker.clone(),
                self.config.poll_interval_secs,
            )),
            tokio::spawn(enqueue_loop(
                self.worker.clone(),
                self.config.reconstruct_interval_secs,
                || Job::ReconstructTrips,
            )),
            tokio::spawn(enqueue_loop(
                self.worker.clone(),
                self.config.detect_interval_secs,
                || Job::DetectMalfunctions,
            )),
            tokio::spawn(enqueue_loop(
                self.worker,
                self.config.recovery_interval_secs,
                || Job::RunRecovery,
            )),
        ]
    }
}

async fn poll_loop(feed: FeedClient, worker: QueueWorker, every_secs: u64) {
    let mut ticker = interval(Duration::from_secs(every_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match feed.fetch_snapshot().await {
            Ok(snapshot) => {
                worker.enqueue(Job::Ingest(Box::new(snapshot)));
            }
            Err(e) => {
                warn!(error = %e, "feed poll failed, skipping cycle");
            }
        }
    }
}

async fn enqueue_loop<F>(worker: QueueWorker, every_secs: u64, make_job: F)
where
    F: Fn() -> Job + Send + 'static,
{
    let mut ticker = interval(Duration::from_secs(every_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick fires immediately; skip it so a fresh process does not
    // run every batch job before the first snapshot lands.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        worker.enqueue(make_job());
    }
}
