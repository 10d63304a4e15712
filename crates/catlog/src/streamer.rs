// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming worker that drains the capture buffer into a TCP connection.
//!
//! The worker is a single task cycling through [`WorkerState`]:
//!
//! ```text
//! Idle --data--> Connecting --connected--> Streaming --idle timeout--> Idle
//!                    ^                         |
//!                    +------send failed--------+
//! ```
//!
//! Connection attempts never give up. A chunk whose send fails is dropped rather than
//! retransmitted, so only bytes still in the buffer survive a reconnect. Cancellation is
//! observed at every wait point: waiting for data, connecting and pausing.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Endpoint, RelayConfig};
use crate::ring_buffer::RingBuffer;

/// Opens connections to the collector.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: AsyncWrite + Unpin + Send;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Self::Connection>;
}

/// Plain TCP transport; the collector reads the connection as a raw text tail.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    type Connection = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No connection, blocked until the buffer has data.
    Idle,
    /// Dialing the collector, pausing between failed attempts.
    Connecting,
    /// Connected, sending chunks as they arrive.
    Streaming,
    Terminated,
}

/// Timing and sizing knobs for [`StreamingWorker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub chunk_size: usize,
    pub retry_interval: Duration,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
    pub startup_delay: Duration,
}

impl From<&RelayConfig> for WorkerOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            retry_interval: config.retry_interval,
            idle_timeout: config.idle_timeout,
            send_timeout: config.send_timeout,
            startup_delay: config.startup_delay,
        }
    }
}

/// The single reader of the [`RingBuffer`].
pub struct StreamingWorker<C: Connector> {
    buffer: Arc<RingBuffer>,
    connector: C,
    endpoint: watch::Receiver<Endpoint>,
    cancel_token: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
    options: WorkerOptions,
}

impl<C: Connector> StreamingWorker<C> {
    pub fn new(
        buffer: Arc<RingBuffer>,
        connector: C,
        endpoint: watch::Receiver<Endpoint>,
        cancel_token: CancellationToken,
        options: WorkerOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Self {
            buffer,
            connector,
            endpoint,
            cancel_token,
            state_tx,
            options,
        }
    }

    /// Receiver observing every state transition.
    pub fn state_receiver(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Runs until the cancellation token fires.
    pub async fn run(self) {
        info!("Streaming worker started");

        let mut chunk = vec![0u8; self.options.chunk_size.max(1)];
        let mut pending = 0;
        let mut sent = 0usize;
        let mut connection: Option<C::Connection> = None;

        let mut state = if self.options.startup_delay.is_zero()
            || self.pause(self.options.startup_delay).await
        {
            WorkerState::Idle
        } else {
            WorkerState::Terminated
        };

        while state != WorkerState::Terminated {
            self.set_state(state);

            state = match state {
                WorkerState::Idle => match self.wait_for_data(&mut chunk, None).await {
                    None => WorkerState::Terminated,
                    Some(0) => WorkerState::Idle,
                    Some(n) => {
                        pending = n;
                        WorkerState::Connecting
                    }
                },

                WorkerState::Connecting => match self.connect().await {
                    Some(conn) => {
                        connection = Some(conn);
                        sent = 0;
                        WorkerState::Streaming
                    }
                    None => WorkerState::Terminated,
                },

                WorkerState::Streaming => {
                    // nothing in hand right after a reconnect that followed a failed send
                    let result = match connection.as_mut() {
                        _ if pending == 0 => Ok(()),
                        Some(conn) => self.send(conn, &chunk[..pending]).await,
                        None => Err(io::ErrorKind::NotConnected.into()),
                    };
                    let in_flight = std::mem::take(&mut pending);

                    match result {
                        Err(e) => {
                            // the chunk is gone, only what is still buffered survives
                            warn!("Failed to send {in_flight} bytes to collector, reconnecting: {e}");
                            self.close(connection.take()).await;
                            if self.pause(self.options.retry_interval).await {
                                WorkerState::Connecting
                            } else {
                                WorkerState::Terminated
                            }
                        }
                        Ok(()) => {
                            sent += in_flight;
                            match self
                                .wait_for_data(&mut chunk, Some(self.options.idle_timeout))
                                .await
                            {
                                None => WorkerState::Terminated,
                                Some(0) => {
                                    debug!(
                                        "No new data, closing idle connection after {sent} bytes"
                                    );
                                    self.close(connection.take()).await;
                                    WorkerState::Idle
                                }
                                Some(n) => {
                                    pending = n;
                                    WorkerState::Streaming
                                }
                            }
                        }
                    }
                }

                WorkerState::Terminated => WorkerState::Terminated,
            };
        }

        self.close(connection.take()).await;
        self.set_state(WorkerState::Terminated);
        info!("Streaming worker stopped");
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Streaming worker {previous:?} -> {state:?}");
        }
    }

    /// `None` when cancelled, otherwise the number of bytes drained into `chunk`.
    async fn wait_for_data(&self, chunk: &mut [u8], idle: Option<Duration>) -> Option<usize> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        tokio::select! {
            n = self.buffer.read_wait(chunk, idle) => Some(n),
            _ = self.cancel_token.cancelled() => None,
        }
    }

    /// Sleeps for `duration`. Returns false if cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = self.cancel_token.cancelled() => false,
        }
    }

    /// Dials until a connection is established or the worker is cancelled.
    async fn connect(&self) -> Option<C::Connection> {
        let mut attempts: u64 = 0;
        loop {
            if self.cancel_token.is_cancelled() {
                return None;
            }

            // picked up fresh on every attempt so `configure` applies to the next dial
            let endpoint = self.endpoint.borrow().clone();
            attempts += 1;

            let attempt = tokio::select! {
                res = timeout(self.options.send_timeout, self.connector.connect(&endpoint)) => res,
                _ = self.cancel_token.cancelled() => return None,
            };

            match attempt {
                Ok(Ok(conn)) => {
                    debug!("Connected to collector at {endpoint} after {attempts} attempt(s)");
                    return Some(conn);
                }
                Ok(Err(e)) => debug!("Failed to connect to collector at {endpoint}: {e}"),
                Err(_) => debug!("Timed out connecting to collector at {endpoint}"),
            }

            if !self.pause(self.options.retry_interval).await {
                return None;
            }
        }
    }

    async fn send(&self, conn: &mut C::Connection, bytes: &[u8]) -> io::Result<()> {
        let write = async {
            conn.write_all(bytes).await?;
            conn.flush().await
        };
        match timeout(self.options.send_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
        }
    }

    async fn close(&self, connection: Option<C::Connection>) {
        if let Some(mut conn) = connection {
            match timeout(self.options.send_timeout, conn.shutdown()).await {
                Ok(Err(e)) => debug!("Error shutting down collector connection: {e}"),
                Err(_) => debug!("Timed out shutting down collector connection"),
                Ok(Ok(())) => {}
            }
        }
    }
}
