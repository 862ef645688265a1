//! Request history for a load-test session.
//!
//! Entries are only ever appended; each one moves forward through
//! `Requested -> Registered -> Done` or `Requested -> Error`. Every discrete
//! update bumps the store revision and is published to observers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::correlator::CompletionMessage;
use super::TemplateRef;

/// Position of an entry in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(usize);

impl EntryId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Requested,
    Registered,
    Error,
    Done,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Requested => write!(f, "requested"),
            RequestState::Registered => write!(f, "registered"),
            RequestState::Error => write!(f, "error"),
            RequestState::Done => write!(f, "done"),
        }
    }
}

/// Lifecycle of a single print request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Progress {
    Requested,
    Registered {
        registered_at: DateTime<Utc>,
        token: String,
    },
    /// The print call itself failed. Terminal.
    Error {
        error_at: DateTime<Utc>,
        error: String,
    },
    /// The completion event arrived. Terminal; `message.error` may still be set.
    Done {
        registered_at: DateTime<Utc>,
        token: String,
        done_at: DateTime<Utc>,
        message: CompletionMessage,
    },
}

/// One emitted print request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: EntryId,
    pub requested_at: DateTime<Utc>,
    pub template: TemplateRef,
    #[serde(flatten)]
    pub progress: Progress,
}

impl HistoryEntry {
    pub fn state(&self) -> RequestState {
        match self.progress {
            Progress::Requested => RequestState::Requested,
            Progress::Registered { .. } => RequestState::Registered,
            Progress::Error { .. } => RequestState::Error,
            Progress::Done { .. } => RequestState::Done,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match &self.progress {
            Progress::Registered { token, .. } | Progress::Done { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.progress, Progress::Error { .. } | Progress::Done { .. })
    }

    /// `Some(true)` for a clean completion, `Some(false)` for a transport
    /// error or an embedded processing error, `None` while pending.
    pub fn succeeded(&self) -> Option<bool> {
        match &self.progress {
            Progress::Done { message, .. } => Some(message.error.is_none()),
            Progress::Error { .. } => Some(false),
            _ => None,
        }
    }

    /// Time from emission to server acknowledgement.
    pub fn registration_latency(&self) -> Option<chrono::Duration> {
        match &self.progress {
            Progress::Registered { registered_at, .. } | Progress::Done { registered_at, .. } => {
                Some(*registered_at - self.requested_at)
            }
            _ => None,
        }
    }

    /// Time from acknowledgement to completion.
    pub fn completion_latency(&self) -> Option<chrono::Duration> {
        match &self.progress {
            Progress::Done {
                registered_at,
                done_at,
                ..
            } => Some(*done_at - *registered_at),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("no history entry #{}", .0.index())]
    UnknownEntry(EntryId),

    #[error("entry #{} cannot move from {from} to {to}", .id.index())]
    InvalidTransition {
        id: EntryId,
        from: RequestState,
        to: RequestState,
    },

    #[error("token {token} is already held by entry #{}", .holder.index())]
    DuplicateToken { token: String, holder: EntryId },
}

/// Receives every discrete update of a [`HistoryStore`].
pub trait HistoryObserver: Send {
    /// Called after `entry` changed; `revision` increases by one per update.
    fn history_changed(&mut self, revision: u64, entry: &HistoryEntry, history: &[HistoryEntry]);
}

/// Append-only store of request entries.
#[derive(Default)]
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
    revision: u64,
    observers: Vec<Box<dyn HistoryObserver>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn HistoryObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, id: EntryId) -> Option<&HistoryEntry> {
        self.entries.get(id.0)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Record a freshly emitted request.
    pub fn append(&mut self, template: TemplateRef, requested_at: DateTime<Utc>) -> EntryId {
        let id = EntryId(self.entries.len());
        self.entries.push(HistoryEntry {
            id,
            requested_at,
            template,
            progress: Progress::Requested,
        });
        self.publish(id);
        id
    }

    /// Move a `Requested` entry to `Registered`.
    pub fn register(
        &mut self,
        id: EntryId,
        token: String,
        registered_at: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        self.expect_requested(id, RequestState::Registered)?;
        if let Some(holder) = self.token_holder(&token) {
            return Err(HistoryError::DuplicateToken { token, holder });
        }
        self.entries[id.0].progress = Progress::Registered {
            registered_at,
            token,
        };
        self.publish(id);
        Ok(())
    }

    /// Move a `Requested` entry to `Error`.
    pub fn fail(
        &mut self,
        id: EntryId,
        error: String,
        error_at: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        self.expect_requested(id, RequestState::Error)?;
        self.entries[id.0].progress = Progress::Error { error_at, error };
        self.publish(id);
        Ok(())
    }

    /// Attach a completion to the newest `Registered` entry holding its token.
    ///
    /// Returns `None` when no such entry exists; nothing is mutated then.
    pub fn complete(
        &mut self,
        message: CompletionMessage,
        done_at: DateTime<Utc>,
    ) -> Option<EntryId> {
        // Completions overwhelmingly belong to recent requests.
        let idx = self.entries.iter().rposition(|e| {
            matches!(&e.progress, Progress::Registered { token, .. } if *token == message.token)
        })?;

        let entry = &mut self.entries[idx];
        let (registered_at, token) = match &entry.progress {
            Progress::Registered {
                registered_at,
                token,
            } => (*registered_at, token.clone()),
            _ => return None,
        };
        entry.progress = Progress::Done {
            registered_at,
            token,
            done_at,
            message,
        };

        let id = entry.id;
        self.publish(id);
        Some(id)
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats::from_entries(&self.entries)
    }

    fn expect_requested(&self, id: EntryId, to: RequestState) -> Result<(), HistoryError> {
        let entry = self.get(id).ok_or(HistoryError::UnknownEntry(id))?;
        match entry.state() {
            RequestState::Requested => Ok(()),
            from => Err(HistoryError::InvalidTransition { id, from, to }),
        }
    }

    fn token_holder(&self, token: &str) -> Option<EntryId> {
        self.entries
            .iter()
            .find(|e| e.token() == Some(token))
            .map(|e| e.id)
    }

    fn publish(&mut self, id: EntryId) {
        self.revision += 1;
        let entry = &self.entries[id.0];
        for observer in self.observers.iter_mut() {
            observer.history_changed(self.revision, entry, &self.entries);
        }
    }
}

/// Aggregate counters over a history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: usize,
    pub requested: usize,
    pub registered: usize,
    pub errored: usize,
    pub done_ok: usize,
    pub done_failed: usize,
    pub mean_registration_ms: Option<f64>,
    pub mean_completion_ms: Option<f64>,
}

impl HistoryStats {
    pub fn from_entries(entries: &[HistoryEntry]) -> Self {
        let mut stats = HistoryStats {
            total: entries.len(),
            ..Default::default()
        };

        let mut registration = Vec::new();
        let mut completion = Vec::new();

        for entry in entries {
            match &entry.progress {
                Progress::Requested => stats.requested += 1,
                Progress::Registered { .. } => stats.registered += 1,
                Progress::Error { .. } => stats.errored += 1,
                Progress::Done { message, .. } => {
                    if message.error.is_some() {
                        stats.done_failed += 1;
                    } else {
                        stats.done_ok += 1;
                    }
                }
            }
            if let Some(d) = entry.registration_latency() {
                registration.push(d.num_milliseconds() as f64);
            }
            if let Some(d) = entry.completion_latency() {
                completion.push(d.num_milliseconds() as f64);
            }
        }

        stats.mean_registration_ms = mean(&registration);
        stats.mean_completion_ms = mean(&completion);
        stats
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
