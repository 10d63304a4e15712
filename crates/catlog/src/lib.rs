// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relays free-form debug output to a remote collector over TCP.
//!
//! Producers push bytes into a bounded [`RingBuffer`](ring_buffer::RingBuffer) through
//! [`Relay::submit`]; a single [`StreamingWorker`](streamer::StreamingWorker) drains it
//! and streams the bytes, reconnecting as the collector comes and goes. Delivery is best
//! effort: a full buffer drops data and a failed send loses the chunk in flight.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod errors;
pub mod relay;
pub mod ring_buffer;
pub mod streamer;

pub use config::{Endpoint, RelayConfig, Settings};
pub use errors::{RelayError, RingBufferError};
pub use relay::{Relay, WriteMode};
pub use ring_buffer::RingBuffer;
pub use streamer::{Connector, StreamingWorker, TcpConnector, WorkerOptions, WorkerState};
