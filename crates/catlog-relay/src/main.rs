// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use catlog::constants::DEFAULT_DRAIN_TIMEOUT;
use catlog::{Relay, RelayConfig, WriteMode};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("CATLOG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading relay configuration: {e}");
            return;
        }
    };

    let relay = match Relay::new(config) {
        Ok(relay) => relay,
        Err(e) => {
            error!("Error creating relay: {e}");
            return;
        }
    };

    if let Err(e) = relay.start() {
        error!("Error starting streaming worker: {e}");
        return;
    }

    let settings = relay.settings();
    info!(
        "catlog-relay: forwarding stdin to {} (level {})",
        settings.endpoint, settings.level
    );

    let stdin_closed = tokio::select! {
        _ = forward_stdin(&relay) => {
            info!("stdin closed, shutting down");
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            false
        }
    };

    // deliver what was piped in before tearing the worker down
    if stdin_closed {
        relay.flush(DEFAULT_DRAIN_TIMEOUT).await;
    }

    if let Err(e) = relay.shutdown().await {
        error!("Error shutting down relay: {e}");
    }

    // stdin is read on a blocking thread that would otherwise keep the runtime alive
    std::process::exit(0);
}

/// Feeds every line read from stdin into the relay, the way a debug-print hook would.
async fn forward_stdin(relay: &Relay) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                relay.submit(&line, WriteMode::Overwrite);
            }
            Err(e) => {
                error!("Error reading stdin: {e}");
                break;
            }
        }
    }
}
