use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Replicates one stream to several consumers.
///
/// Every item is delivered to each subscriber in subscription order, waiting
/// for buffer space. One slow subscriber therefore stalls all of them; in
/// exchange no subscriber ever misses an item.
pub struct Broadcaster<T> {
    capacity: usize,
    input: Mutex<Option<mpsc::Receiver<T>>>,
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
    task: Mutex<Option<JoinHandle<u64>>>,
    started: AtomicBool,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// `capacity` bounds each subscriber's buffer.
    pub fn new(input: mpsc::Receiver<T>, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            input: Mutex::new(Some(input)),
            subscribers: Mutex::new(Vec::new()),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// New subscriber. Only allowed before `start`.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<T>> {
        let mut subscribers = lock(&self.subscribers);
        if self.started.load(Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        subscribers.push(tx);
        Ok(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the forwarding task. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let subscribers = {
            let mut subscribers = lock(&self.subscribers);
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(PipelineError::AlreadyStarted);
            }
            std::mem::take(&mut *subscribers)
        };
        let input = lock(&self.input).take().ok_or(PipelineError::AlreadyStarted)?;

        info!("Broadcaster starting with {} subscriber(s)", subscribers.len());
        let handle = tokio::spawn(forward(input, subscribers));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Wait for the forwarding task to end. Returns the number of items
    /// forwarded; 0 if the broadcaster was never started or already awaited.
    pub async fn wait(&self) -> Result<u64> {
        let handle = lock(&self.task).take();
        match handle {
            Some(handle) => handle.await.map_err(|e| PipelineError::Task(e.to_string())),
            None => Ok(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn forward<T: Clone>(mut input: mpsc::Receiver<T>, mut subscribers: Vec<mpsc::Sender<T>>) -> u64 {
    let mut forwarded = 0u64;

    while let Some(item) = input.recv().await {
        let mut i = 0;
        while i < subscribers.len() {
            if subscribers[i].send(item.clone()).await.is_err() {
                warn!("Broadcaster subscriber {} dropped, removing", i);
                subscribers.remove(i);
            } else {
                i += 1;
            }
        }
        forwarded += 1;

        if subscribers.is_empty() {
            warn!("Broadcaster has no subscribers left, stopping");
            break;
        }
    }

    debug!("Broadcaster forwarded {} item(s)", forwarded);
    // dropping the senders closes every subscriber exactly once
    drop(subscribers);
    forwarded
}
