// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Collector port used when the configured port is 0.
pub const DEFAULT_PORT: u16 = 9999;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Verbosity level handed back to the collaborator when nothing was configured.
pub const DEFAULT_LEVEL: u16 = 2;

/// Ring buffer size in bytes. One slot is reserved, so 0x1FFF bytes are usable.
pub const DEFAULT_BUFFER_CAPACITY: usize = 0x2000;

/// Largest chunk the streaming worker drains from the buffer per send.
pub const DEFAULT_CHUNK_SIZE: usize = 0x400;

/// Longest line accepted by formatted capture, longer output is truncated.
pub const MAX_LINE_LEN: usize = 0x400 - 1;

/// Pause between connection attempts, and after a failed send.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// An open connection with no new data for this long is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single socket write (and on a connect attempt).
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the relay binary waits for buffered input to reach the collector once stdin closes.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
