//! Batch coordinator.
//!
//! Fans a list of tile requests out over a fixed number of workers that pull
//! from a shared queue. Each request gets its own slot in the output, in the
//! order it was submitted, holding either the tile or the error that request
//! hit. One failing tile never fails the batch.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::TileError;
use crate::slide::SlideArchive;

use super::request::TileRequest;
use super::service::{TilePipeline, TileResponse};

/// Maximum number of tiles accepted in one batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Default number of concurrent pipeline invocations per batch.
pub const DEFAULT_BATCH_WORKERS: usize = 4;

/// Outcome of one batch slot.
pub type BatchSlot = Result<TileResponse, TileError>;

/// Runs batches of tile requests through a shared [`TilePipeline`].
pub struct BatchCoordinator<A: SlideArchive + 'static> {
    pipeline: Arc<TilePipeline<A>>,
    workers: usize,
}

impl<A: SlideArchive + 'static> BatchCoordinator<A> {
    /// Create a coordinator running at most `workers` tiles at once
    /// (minimum 1).
    pub fn new(pipeline: Arc<TilePipeline<A>>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn pipeline(&self) -> &Arc<TilePipeline<A>> {
        &self.pipeline
    }

    /// Render every request and return one slot per request, in input order.
    ///
    /// # Errors
    ///
    /// Only `BatchTooLarge`, before any work starts. Per-tile failures,
    /// including validation errors, are reported in their slot.
    pub async fn run(&self, requests: Vec<TileRequest>) -> Result<Vec<BatchSlot>, TileError> {
        if requests.len() > MAX_BATCH_SIZE {
            return Err(TileError::BatchTooLarge {
                size: requests.len(),
                max: MAX_BATCH_SIZE,
            });
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let total = requests.len();
        let queue: Arc<Mutex<VecDeque<(usize, TileRequest)>>> =
            Arc::new(Mutex::new(requests.into_iter().enumerate().collect()));
        let (tx, mut rx) = mpsc::channel::<(usize, BatchSlot)>(total);

        let mut workers = JoinSet::new();
        for _ in 0..self.workers.min(total) {
            let queue = Arc::clone(&queue);
            let pipeline = Arc::clone(&self.pipeline);
            let tx = tx.clone();
            workers.spawn(async move {
                loop {
                    // Release the queue before rendering
                    let next = queue.lock().await.pop_front();
                    let Some((index, request)) = next else {
                        break;
                    };
                    let slot = pipeline.get_tile(request).await;
                    if tx.send((index, slot)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<BatchSlot>> = (0..total).map(|_| None).collect();
        while let Some((index, slot)) = rx.recv().await {
            slots[index] = Some(slot);
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Batch worker panicked");
            }
        }

        let slots: Vec<BatchSlot> = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(TileError::Internal("batch worker stopped".to_string())))
            })
            .collect();

        let failed = slots.iter().filter(|slot| slot.is_err()).count();
        debug!(total, failed, workers = self.workers, "Batch complete");
        Ok(slots)
    }
}

impl<A: SlideArchive + 'static> std::fmt::Debug for BatchCoordinator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("workers", &self.workers)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
