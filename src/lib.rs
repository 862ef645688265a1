//! printdesk -- operator tooling for a print-template service.
//!
//! This crate provides the GraphQL client for template types and files, the
//! service configuration view, and a load-test driver that fires randomized
//! print requests and correlates their completions from the service's
//! server-sent event stream.

pub mod api;
pub mod config;
pub mod loadtest;
pub mod service_config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::api::ApiClient;
use crate::config::AppConfig;
use crate::loadtest::report::{ResultsPrinter, StatusPrinter};
use crate::loadtest::sse::EventSource;
use crate::loadtest::{Driver, DriverHandle, HistoryStats, RequestWindow, UserId};

/// Knobs for one load-test session; `None` falls back to the config file.
#[derive(Debug, Clone, Default)]
pub struct LoadTestOptions {
    pub window_secs: Option<u64>,
    /// Stop after this long; run until `quit` or Ctrl-C otherwise.
    pub duration: Option<Duration>,
    pub user_id: Option<UserId>,
    /// Emit results as JSON lines instead of a table.
    pub json: bool,
    /// Wait for an explicit `start` instead of starting once ready.
    pub manual: bool,
    /// Read operator commands from stdin.
    pub interactive: bool,
}

/// Run a load-test session to completion and return its summary.
pub async fn run_load_test(config: &AppConfig, opts: LoadTestOptions) -> Result<HistoryStats> {
    let client = ApiClient::new(config.api.base_url.clone(), config.api.timeout())
        .context("failed to build API client")?;
    let window = RequestWindow::new(opts.window_secs.unwrap_or(config.load_test.window_secs))?;
    let user_id = opts.user_id.unwrap_or_else(UserId::random);

    let url = EventSource::subscription_url(client.base_url(), user_id)?;
    let source = EventSource::new(
        url,
        config.load_test.connect_timeout(),
        config.load_test.reconnect_delay(),
    )
    .context("failed to build event stream client")?;

    tracing::info!(
        %user_id,
        window_secs = window.secs(),
        base_url = %client.base_url(),
        "starting load test"
    );

    let base_url = client.base_url().to_string();
    let mut driver = Driver::new(Arc::new(client), user_id, window, StdRng::from_entropy())
        .with_autostart(!opts.manual);
    driver.observe(Box::new(StatusPrinter::new(std::io::stderr())));
    driver.observe_history(Box::new(ResultsPrinter::new(
        std::io::stdout(),
        base_url,
        opts.json,
    )));
    driver.attach_stream(source);

    let handle = driver.handle();
    if let Some(duration) = opts.duration {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tracing::info!(secs = duration.as_secs(), "load-test duration reached");
            handle.shutdown();
        });
    }
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.shutdown();
            }
        });
    }
    if opts.interactive {
        tokio::spawn(read_commands(handle));
    }

    let history = driver.run().await;
    Ok(history.stats())
}

/// Forward operator lines from stdin until EOF or the driver exits.
async fn read_commands(handle: DriverHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if !handle.submit(&line) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read operator input");
                break;
            }
        }
    }
}
