// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while setting up the capture buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Invalid ring buffer capacity {0}: must be greater than 1")]
    InvalidCapacity(usize),

    #[error("Failed to allocate {0} bytes for the ring buffer")]
    Allocation(usize),
}

/// Errors surfaced to the collaborator driving the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Buffer(#[from] RingBufferError),

    #[error("Relay already started")]
    AlreadyStarted,

    #[error("Relay not running")]
    NotRunning,

    #[error("Streaming worker failed: {0}")]
    Worker(String),
}
