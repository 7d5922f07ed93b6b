//! Periodic poller driving the OCR queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

use chatvault_core::defaults::OCR_POLL_INTERVAL_MIN_MS;
use chatvault_core::{Error, Result};

use crate::queue::{OcrQueue, QueueInner};

/// Result of one [`OcrQueue::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running; nothing was done.
    Overlapped,
    Ran {
        /// Stale `processing` documents requeued or failed.
        recovered: i64,
        /// Documents claimed and processed.
        claimed: usize,
    },
}

/// Holds the tick flag for the lifetime of a tick.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle for controlling a running poller.
pub struct QueueHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl QueueHandle {
    /// Signal the poller to stop and wait for in-flight ticks to finish.
    pub async fn shutdown(self) -> Result<()> {
        if self.shutdown_tx.send(()).await.is_err() {
            debug!(subsystem = "ocr", component = "poller", "OCR poller already stopped");
        }
        self.task
            .await
            .map_err(|e| Error::Internal(format!("OCR poller task failed: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl QueueInner {
    /// Recover stale claims. Each one costs an attempt; documents that run
    /// out are failed and their jobs refreshed.
    async fn recover_stale(&self) -> Result<i64> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| Error::Config(format!("invalid stale threshold: {}", e)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .ok_or_else(|| Error::Config("stale threshold out of range".into()))?;

        let recovery = self.documents.requeue_stale(cutoff, &self.policy).await?;
        if recovery.total() == 0 {
            return Ok(0);
        }
        warn!(
            subsystem = "ocr",
            component = "poller",
            op = "recover_stale",
            requeued = recovery.requeued,
            failed = recovery.failed,
            stale_after_secs = self.config.stale_after.as_secs(),
            "Recovered stale OCR documents"
        );

        for job_id in &recovery.failed_job_ids {
            if let Err(e) = self.refresh(*job_id).await {
                error!(
                    subsystem = "ocr",
                    component = "poller",
                    job_id = %job_id,
                    error = %e,
                    "Job aggregate refresh failed after stale recovery"
                );
            }
        }
        Ok(recovery.total())
    }
}

impl OcrQueue {
    /// Run one poll cycle: recover stale claims, claim a batch, and process it
    /// with bounded concurrency.
    ///
    /// Returns [`TickOutcome::Overlapped`] without touching the store when a
    /// tick is already running on this engine.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let inner = &*self.inner;
        let Some(_guard) = TickGuard::acquire(&inner.ticking) else {
            trace!(subsystem = "ocr", component = "poller", "Tick overlapped, skipping");
            return Ok(TickOutcome::Overlapped);
        };

        let start = Instant::now();
        let recovered = inner.recover_stale().await?;

        let batch = inner
            .documents
            .claim_batch(inner.config.batch_size as i64)
            .await?;
        let claimed = batch.len();
        if claimed == 0 {
            trace!(subsystem = "ocr", component = "poller", "No OCR documents ready");
            return Ok(TickOutcome::Ran { recovered, claimed });
        }

        debug!(
            subsystem = "ocr",
            component = "poller",
            op = "claim_batch",
            claimed,
            concurrency = inner.config.concurrency,
            "Claimed OCR batch"
        );

        futures::stream::iter(batch)
            .for_each_concurrent(inner.config.concurrency, |doc| inner.process(doc))
            .await;

        debug!(
            subsystem = "ocr",
            component = "poller",
            claimed,
            duration_ms = start.elapsed().as_millis() as u64,
            "OCR batch finished"
        );
        Ok(TickOutcome::Ran { recovered, claimed })
    }

    /// Start the poller and return a handle for control.
    pub fn start(&self) -> QueueHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let queue = self.clone();
        let task = tokio::spawn(async move {
            queue.run(&mut shutdown_rx).await;
        });
        QueueHandle { shutdown_tx, task }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "ocr", component = "poller"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        let config = &self.inner.config;
        if !config.enabled {
            info!("OCR poller is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            stale_after_secs = config.stale_after.as_secs(),
            concurrency = config.concurrency,
            batch_size = config.batch_size,
            max_attempts = config.max_attempts,
            "OCR poller started"
        );

        if let Err(e) = self.inner.recover_stale().await {
            error!(error = %e, "Stale OCR recovery failed at startup");
        }

        let period = config
            .poll_interval
            .max(Duration::from_millis(OCR_POLL_INTERVAL_MIN_MS));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("OCR poller received shutdown signal");
                    break;
                }
                _ = interval.tick() => {}
                _ = self.inner.wake.notified() => {}
            }

            let queue = self.clone();
            ticks.spawn(async move {
                if let Err(e) = queue.tick().await {
                    error!(subsystem = "ocr", component = "poller", error = %e, "OCR tick failed");
                }
            });

            while let Some(result) = ticks.try_join_next() {
                if let Err(e) = result {
                    error!(error = ?e, "OCR tick panicked");
                }
            }
        }

        while let Some(result) = ticks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "OCR tick panicked");
            }
        }
        info!("OCR poller stopped");
    }
}
