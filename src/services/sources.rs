//! Sample sources.
//!
//! A source hands the pipeline a bounded channel of time-ordered samples.

use crate::error::{PipelineError, Result};
use crate::services::merge_queue::MergeQueue;
use crate::types::Sample;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub trait SampleSource: Send {
    /// Channel of samples. Can be taken once; later calls fail with
    /// [`PipelineError::SourceConsumed`]. Must run inside a tokio runtime.
    fn receiver(&mut self) -> Result<mpsc::Receiver<Sample>>;

    /// Stop producing. The receiver sees the end of the stream.
    fn close(&mut self);
}

/// Replays a fixed set of samples in timestamp order.
pub struct HistoricalSource {
    samples: Option<Vec<Sample>>,
    capacity: usize,
    task: Option<JoinHandle<()>>,
}

impl HistoricalSource {
    pub fn new(mut samples: Vec<Sample>, capacity: usize) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self {
            samples: Some(samples),
            capacity: capacity.max(1),
            task: None,
        }
    }

    /// Load a JSON array of samples.
    pub fn from_json_file(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        Ok(Self::new(Self::read_samples(path)?, capacity))
    }

    pub fn read_samples(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
        let path = path.as_ref();
        let samples: Vec<Sample> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        info!("Loaded {} samples from {}", samples.len(), path.display());
        Ok(samples)
    }

    pub fn len(&self) -> usize {
        self.samples.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSource for HistoricalSource {
    fn receiver(&mut self) -> Result<mpsc::Receiver<Sample>> {
        let samples = self.samples.take().ok_or(PipelineError::SourceConsumed)?;
        let (tx, rx) = mpsc::channel(self.capacity);

        self.task = Some(tokio::spawn(async move {
            let total = samples.len();
            for (sent, sample) in samples.into_iter().enumerate() {
                if tx.send(sample).await.is_err() {
                    debug!("Historical source receiver dropped after {}/{}", sent, total);
                    return;
                }
            }
            debug!("Historical source replayed {} samples", total);
        }));
        Ok(rx)
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HistoricalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drains a merge queue fed by concurrent producers.
///
/// The drain task sleeps until a producer pushes. The stream ends once the
/// queue is closed with [`MergeQueue::close`] and nothing is buffered.
pub struct QueueSource {
    queue: Arc<MergeQueue<Sample>>,
    capacity: usize,
    consumed: bool,
    task: Option<JoinHandle<()>>,
}

impl QueueSource {
    pub fn new(queue: Arc<MergeQueue<Sample>>, capacity: usize) -> Self {
        Self {
            queue,
            capacity: capacity.max(1),
            consumed: false,
            task: None,
        }
    }

    pub fn queue(&self) -> Arc<MergeQueue<Sample>> {
        self.queue.clone()
    }
}

impl SampleSource for QueueSource {
    fn receiver(&mut self) -> Result<mpsc::Receiver<Sample>> {
        if self.consumed {
            return Err(PipelineError::SourceConsumed);
        }
        self.consumed = true;

        let (tx, rx) = mpsc::channel(self.capacity);
        let queue = self.queue.clone();

        self.task = Some(tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                while let Some(sample) = queue.pop_earliest() {
                    if tx.send(sample).await.is_err() {
                        debug!("Queue source receiver dropped after {} samples", sent);
                        return;
                    }
                    sent += 1;
                }
                if queue.is_drained() {
                    break;
                }
                queue.wait_for_push().await;
            }
            debug!("Queue source drained {} samples", sent);
        }));
        Ok(rx)
    }

    fn close(&mut self) {
        self.queue.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for QueueSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
