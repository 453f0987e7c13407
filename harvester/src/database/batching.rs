//! Write batching for database operations.
//!
//! A `BatchWriter` owns a single background task that buffers items and hands
//! them to a flush function when the buffer fills up or the flush interval
//! elapses. Callers can force a flush and wait for its outcome, and shut the
//! writer down so that nothing queued is lost.
//!
//! A failed flush keeps its items buffered. They are retried on the next
//! interval tick or explicit flush, so an awaited `flush()` only returns `Ok`
//! once everything added before it has been written.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::{Error, Result};

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Maximum number of items to buffer before flushing.
    pub max_buffer_size: usize,
    /// Maximum time to wait before flushing.
    pub flush_interval: Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

enum Command<T> {
    Item(T),
    Flush(oneshot::Sender<std::result::Result<(), String>>),
}

/// A generic batch writer that buffers items and flushes them periodically.
pub struct BatchWriter<T> {
    sender: mpsc::Sender<Command<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> BatchWriter<T> {
    /// Create a new batch writer with the given configuration and flush function.
    pub fn new<F, Fut>(config: BatchWriterConfig, flush_fn: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let capacity = config.max_buffer_size.max(1) * 2;
        let (sender, receiver) = mpsc::channel::<Command<T>>(capacity);
        let handle = tokio::spawn(Self::run_flush_loop(receiver, config, Arc::new(flush_fn)));

        Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Add an item to the batch.
    pub async fn add(&self, item: T) -> Result<()> {
        self.sender
            .send(Command::Item(item))
            .await
            .map_err(|_| Error::Other("Batch writer channel closed".to_string()))
    }

    /// Flush everything queued so far and wait for the result.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Flush(tx))
            .await
            .map_err(|_| Error::Other("Batch writer channel closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("Batch writer stopped before flushing".to_string()))?
            .map_err(Error::Database)
    }

    /// Flush pending items and stop the background task.
    ///
    /// Further `add` calls fail once this returns.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.flush().await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        flushed
    }

    async fn run_flush_loop<F, Fut>(
        mut receiver: mpsc::Receiver<Command<T>>,
        config: BatchWriterConfig,
        flush_fn: Arc<F>,
    ) where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let max = config.max_buffer_size.max(1);
        let mut buffer = Vec::with_capacity(max);
        let mut flush_timer = interval(config.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Set after a failed flush; size-triggered flushes wait for the timer
        // or an explicit flush instead of retrying on every item.
        let mut failing = false;

        loop {
            tokio::select! {
                command = receiver.recv() => {
                    match command {
                        Some(Command::Item(item)) => {
                            buffer.push(item);
                            if buffer.len() >= max
                                && !failing
                                && let Err(e) = Self::flush_buffer(&*flush_fn, &mut buffer).await
                            {
                                tracing::error!(buffered = buffer.len(), "Batch flush error: {}", e);
                                failing = true;
                            }
                        }
                        Some(Command::Flush(reply)) => {
                            let result = Self::flush_buffer(&*flush_fn, &mut buffer).await;
                            failing = result.is_err();
                            let _ = reply.send(result.map_err(|e| e.to_string()));
                        }
                        None => {
                            // Channel closed, flush remaining items
                            if let Err(e) = Self::flush_buffer(&*flush_fn, &mut buffer).await {
                                tracing::error!(dropped = buffer.len(), "Final batch flush error: {}", e);
                            }
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => {
                    if let Err(e) = Self::flush_buffer(&*flush_fn, &mut buffer).await {
                        tracing::error!(buffered = buffer.len(), "Periodic batch flush error: {}", e);
                        failing = true;
                    } else {
                        failing = false;
                    }
                }
            }
        }
    }

    /// Write the buffer, clearing it only when the write succeeded.
    async fn flush_buffer<F, Fut>(flush_fn: &F, buffer: &mut Vec<T>) -> Result<()>
    where
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if buffer.is_empty() {
            return Ok(());
        }
        flush_fn(buffer.clone()).await?;
        buffer.clear();
        Ok(())
    }
}
