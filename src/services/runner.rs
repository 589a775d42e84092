use crate::error::{PipelineError, Result};
use crate::services::dispatcher::Dispatcher;
use crate::services::pipeline::{Pipeline, RunSummary};
use crate::services::sources::SampleSource;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Drives one pipeline on a background task.
pub struct Runner {
    name: String,
    /// Pipeline and source, until `start` moves them onto the task
    parts: Mutex<Option<(Pipeline, Box<dyn SampleSource>)>>,
    /// Same dispatcher the pipeline reads on every tick
    dispatcher: Arc<RwLock<Dispatcher>>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    /// Whether the pipeline task is active
    running: Arc<RwLock<bool>>,
    task: Mutex<Option<JoinHandle<Result<RunSummary>>>>,
}

impl Runner {
    pub fn new(name: &str, pipeline: Pipeline, source: Box<dyn SampleSource>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name: name.to_string(),
            dispatcher: pipeline.dispatcher(),
            parts: Mutex::new(Some((pipeline, source))),
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the pipeline. A runner runs once; starting it again fails.
    pub fn start(&self) -> Result<()> {
        let (mut pipeline, mut source) = self
            .parts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(PipelineError::AlreadyStarted)?;

        *self.running.write().unwrap_or_else(|p| p.into_inner()) = true;
        info!("Runner {} started", self.name);

        let shutdown_rx = self.shutdown_tx.subscribe();
        let running = self.running.clone();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let result = pipeline.run_source(source.as_mut(), shutdown_rx).await;
            *running.write().unwrap_or_else(|p| p.into_inner()) = false;
            match &result {
                Ok(summary) => info!("Runner {} finished after {} ticks", name, summary.ticks),
                Err(e) => error!("Runner {} failed: {}", name, e),
            }
            result
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Ask the pipeline to stop after the sample in progress.
    pub fn stop(&self) {
        if self.shutdown_tx.send(()).is_ok() {
            info!("Runner {} stopping", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Wait for the pipeline task and return its summary.
    pub async fn wait(&self) -> Result<RunSummary> {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))?,
            None => Err(PipelineError::Task(format!("runner {} has no task to wait for", self.name))),
        }
    }

    /// Swap the dispatcher without stopping the pipeline. The next tick uses
    /// the new rules and handlers.
    pub fn update_dispatcher(&self, dispatcher: Dispatcher) {
        *self.dispatcher.write().unwrap_or_else(|p| p.into_inner()) = dispatcher;
        info!("Runner {} dispatcher updated", self.name);
    }
}
