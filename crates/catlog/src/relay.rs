// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry points used by the platform glue: byte submission, endpoint updates and
//! lifecycle control of the streaming worker.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Endpoint, RelayConfig, Settings};
use crate::constants::MAX_LINE_LEN;
use crate::errors::RelayError;
use crate::ring_buffer::RingBuffer;
use crate::streamer::{Connector, StreamingWorker, TcpConnector, WorkerOptions, WorkerState};

/// How a submission behaves once the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Accept what fits and report a short count.
    Blocking,
    /// Evict the oldest unread bytes. Never rejects anything.
    Overwrite,
}

struct RunningWorker {
    cancel_token: CancellationToken,
    state_rx: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

/// Capture buffer plus the worker relaying it to the collector.
///
/// All methods take `&self`, so a relay can sit behind an `Arc` and be fed from any
/// number of threads while the worker runs.
pub struct Relay<C: Connector + Clone = TcpConnector> {
    buffer: Arc<RingBuffer>,
    connector: C,
    options: WorkerOptions,
    endpoint_tx: watch::Sender<Endpoint>,
    level: AtomicU16,
    worker: Mutex<Option<RunningWorker>>,
}

impl Relay<TcpConnector> {
    /// Validates `config` and allocates the capture buffer.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector + Clone> Relay<C> {
    pub fn with_connector(config: RelayConfig, connector: C) -> Result<Self, RelayError> {
        config.validate()?;
        let buffer = Arc::new(RingBuffer::new(config.buffer_capacity)?);
        let (endpoint_tx, _) = watch::channel(config.endpoint.clone());

        Ok(Self {
            buffer,
            connector,
            options: WorkerOptions::from(&config),
            endpoint_tx,
            level: AtomicU16::new(config.level),
            worker: Mutex::new(None),
        })
    }

    fn worker(&self) -> MutexGuard<'_, Option<RunningWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `bytes` for the collector and returns how many were accepted.
    pub fn submit(&self, bytes: &[u8], mode: WriteMode) -> usize {
        match mode {
            WriteMode::Blocking => self.buffer.write_blocking(bytes),
            WriteMode::Overwrite => self.buffer.write_overwrite(bytes),
        }
    }

    /// Formats a debug line and submits it in overwrite mode. Output beyond
    /// [`MAX_LINE_LEN`] bytes is cut off.
    pub fn submit_fmt(&self, args: fmt::Arguments<'_>) -> usize {
        let mut line = String::new();
        if fmt::write(&mut line, args).is_err() {
            return 0;
        }
        let bytes = line.as_bytes();
        let len = bytes.len().min(MAX_LINE_LEN);
        self.buffer.write_overwrite(&bytes[..len])
    }

    /// Single-character capture path.
    pub fn submit_byte(&self, byte: u8) -> usize {
        self.buffer.write_overwrite(&[byte])
    }

    /// Sets the collector used from the next connection attempt on. A connection that is
    /// already streaming keeps its current peer.
    pub fn configure(&self, endpoint: Endpoint) {
        debug!("Collector endpoint set to {endpoint}");
        self.endpoint_tx.send_replace(endpoint);
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint_tx.borrow().clone()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            endpoint: self.endpoint(),
            level: self.level.load(Ordering::Relaxed),
        }
    }

    pub fn update_settings(&self, settings: Settings) {
        self.level.store(settings.level, Ordering::Relaxed);
        self.configure(settings.endpoint);
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished())
    }

    /// Current worker state, `Terminated` when the worker is not running.
    pub fn worker_state(&self) -> WorkerState {
        self.worker()
            .as_ref()
            .map_or(WorkerState::Terminated, |worker| *worker.state_rx.borrow())
    }

    /// Receiver for worker state transitions, `None` when the worker is not running.
    pub fn state_receiver(&self) -> Option<watch::Receiver<WorkerState>> {
        self.worker().as_ref().map(|worker| worker.state_rx.clone())
    }

    /// Spawns the streaming worker on the current tokio runtime.
    pub fn start(&self) -> Result<(), RelayError> {
        let mut worker = self.worker();
        if worker.is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RelayError::Worker(e.to_string()))?;

        let cancel_token = CancellationToken::new();
        let streaming_worker = StreamingWorker::new(
            Arc::clone(&self.buffer),
            self.connector.clone(),
            self.endpoint_tx.subscribe(),
            cancel_token.clone(),
            self.options.clone(),
        );
        let state_rx = streaming_worker.state_receiver();
        let task = runtime.spawn(streaming_worker.run());

        info!("Relaying captured output to {}", self.endpoint());
        *worker = Some(RunningWorker {
            cancel_token,
            state_rx,
            task,
        });
        Ok(())
    }

    /// Cancels the worker and waits for it to close its connection.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let running = self.worker().take().ok_or(RelayError::NotRunning)?;
        running.cancel_token.cancel();
        running
            .task
            .await
            .map_err(|e| RelayError::Worker(e.to_string()))?;
        debug!("Relay stopped with {} bytes still buffered", self.buffer.len());
        Ok(())
    }

    /// Waits up to `limit` for the worker to deliver everything buffered and go back to
    /// `Idle`, which happens once the idle timeout closes the connection. Returns whether
    /// the buffer was drained in time.
    pub async fn flush(&self, limit: Duration) -> bool {
        let Some(mut state_rx) = self.state_receiver() else {
            return self.buffer.is_empty();
        };
        let buffer = Arc::clone(&self.buffer);
        let drained = state_rx.wait_for(|state| *state == WorkerState::Idle && buffer.is_empty());

        let drained_in_time = match tokio::time::timeout(limit, drained).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => buffer.is_empty(),
            Err(_) => {
                warn!("{} bytes still undelivered after {limit:?}", buffer.len());
                false
            }
        };
        drained_in_time
    }

    /// Stops the worker if needed and releases the buffer.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        if self.worker().is_some() {
            self.stop().await?;
        }

        let buffer = Arc::clone(&self.buffer);
        drop(self);
        match Arc::try_unwrap(buffer) {
            Ok(buffer) => {
                let discarded = buffer.terminate();
                if discarded > 0 {
                    info!("Discarded {discarded} unsent bytes on shutdown");
                }
            }
            Err(_) => debug!("Capture buffer still shared, leaving it to the last owner"),
        }
        Ok(())
    }
}

impl<C: Connector + Clone> Drop for Relay<C> {
    fn drop(&mut self) {
        let running = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            debug!("Relay dropped while running, cancelling streaming worker");
            running.cancel_token.cancel();
        }
    }
}
