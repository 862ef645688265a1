//! Load-test driver: randomized print requests correlated with SSE completions.
//!
//! The driver owns a [`history::HistoryStore`] and processes every timer
//! firing, network response and stream frame on a single task, one event at a
//! time. Network calls and the event stream run as spawned tasks that only
//! post events back to the driver.

pub mod correlator;
pub mod countdown;
pub mod driver;
pub mod history;
pub mod report;
pub mod scheduler;
pub mod sse;

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;

pub use driver::{Command, Driver, DriverHandle, Notice, SessionObserver, SessionState, StartBlocker};
pub use history::{HistoryEntry, HistoryObserver, HistoryStats, HistoryStore, RequestState};

/// Default width of the randomization window, in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 20;
pub const MIN_WINDOW_SECS: u64 = 5;
pub const MAX_WINDOW_SECS: u64 = 60;

/// Refresh period of the "time to next request" countdown.
pub const COUNTDOWN_INTERVAL: Duration = Duration::from_millis(100);

/// Session-scoped numeric user identifier sent with every print request and
/// used to scope the completion stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(u32);

impl UserId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Draw a fresh identifier in `0..10000`.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(0..10_000))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upper bound of the random delay between two requests, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestWindow(u64);

impl RequestWindow {
    pub fn new(secs: u64) -> Result<Self, ControlError> {
        if !(MIN_WINDOW_SECS..=MAX_WINDOW_SECS).contains(&secs) {
            return Err(ControlError::WindowOutOfRange { secs });
        }
        Ok(Self(secs))
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 * 1000
    }
}

impl Default for RequestWindow {
    fn default() -> Self {
        Self(DEFAULT_WINDOW_SECS)
    }
}

/// Snapshot of a template eligible for load testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub id: String,
    pub title: String,
}

impl TemplateRef {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Connection state of the completion stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Operator controls that were refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("cannot start: {}", join_blockers(.blockers))]
    Blocked { blockers: Vec<StartBlocker> },

    #[error("window of {secs}s is outside 5..=60s")]
    WindowOutOfRange { secs: u64 },

    #[error("window can only be changed while the scheduler is stopped")]
    WindowLocked,
}

fn join_blockers(blockers: &[StartBlocker]) -> String {
    blockers
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The two API operations the driver depends on.
#[async_trait::async_trait]
pub trait PrintApi: Send + Sync {
    /// Fetch the templates currently flagged active.
    async fn active_templates(&self) -> Result<Vec<TemplateRef>, ApiError>;

    /// Submit a print request and return the correlation token.
    async fn print(&self, template_id: &str, user_id: UserId) -> Result<String, ApiError>;
}
