use chrono::{DateTime, Utc};
use ck_types::{CkError, FetchWindow, SeriesKey, TimeRange};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// What happened to one fetch window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowStatus {
    Written {
        rows: usize,
        rejected: usize,
        summaries: usize,
    },
    /// The source had nothing for this window.
    Empty { rejected: usize },
    Failed { kind: String, message: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub window: FetchWindow,
    pub status: WindowStatus,
}

impl WindowOutcome {
    pub fn failed(window: FetchWindow, error: &CkError) -> Self {
        Self {
            window,
            status: WindowStatus::Failed {
                kind: error.kind().to_string(),
                message: error.to_string(),
            },
        }
    }

    pub fn cancelled(window: FetchWindow) -> Self {
        Self {
            window,
            status: WindowStatus::Cancelled,
        }
    }
}

/// Per-series result of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReport {
    pub key: SeriesKey,
    pub instrument: String,
    /// Ranges the run set out to fetch.
    pub planned: Vec<TimeRange>,
    pub outcomes: Vec<WindowOutcome>,
    /// Planning failure that prevented any window from being attempted.
    pub error: Option<String>,
}

impl KeyReport {
    pub fn new(key: SeriesKey, instrument: &str) -> Self {
        Self {
            key,
            instrument: instrument.to_string(),
            planned: Vec::new(),
            outcomes: Vec::new(),
            error: None,
        }
    }

    pub fn rows_written(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                WindowStatus::Written { rows, .. } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn failed_windows(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, WindowStatus::Failed { .. }))
            .count()
    }

    pub fn cancelled_windows(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == WindowStatus::Cancelled)
            .count()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.planned.is_empty() && self.error.is_none()
    }
}

/// Result of one ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keys: Vec<KeyReport>,
}

impl IngestReport {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            keys: Vec::new(),
        }
    }

    pub fn rows_written(&self) -> usize {
        self.keys.iter().map(KeyReport::rows_written).sum()
    }

    pub fn failed_windows(&self) -> usize {
        self.keys.iter().map(KeyReport::failed_windows).sum()
    }

    pub fn cancelled_windows(&self) -> usize {
        self.keys.iter().map(KeyReport::cancelled_windows).sum()
    }

    pub fn key_errors(&self) -> usize {
        self.keys.iter().filter(|k| k.error.is_some()).count()
    }

    /// No failed, cancelled or unplanned work.
    pub fn is_complete(&self) -> bool {
        self.failed_windows() == 0 && self.cancelled_windows() == 0 && self.key_errors() == 0
    }

    pub fn key(&self, key: &SeriesKey) -> Option<&KeyReport> {
        self.keys.iter().find(|k| &k.key == key)
    }

    pub fn log_summary(&self) {
        for key in &self.keys {
            if let Some(error) = &key.error {
                warn!(
                    series = %key.key,
                    instrument = %key.instrument,
                    "planning failed: {}",
                    error
                );
                continue;
            }
            if key.is_up_to_date() {
                info!(series = %key.key, instrument = %key.instrument, "already up to date");
                continue;
            }
            info!(
                series = %key.key,
                instrument = %key.instrument,
                windows = key.outcomes.len(),
                rows = key.rows_written(),
                failed = key.failed_windows(),
                cancelled = key.cancelled_windows(),
                "series finished"
            );
            for outcome in &key.outcomes {
                if let WindowStatus::Failed { kind, message } = &outcome.status {
                    warn!(window = %outcome.window, kind = %kind, "window failed: {}", message);
                }
            }
        }

        let elapsed = self.finished_at - self.started_at;
        info!(
            run_id = %self.run_id,
            series = self.keys.len(),
            rows = self.rows_written(),
            failed_windows = self.failed_windows(),
            cancelled_windows = self.cancelled_windows(),
            "run finished in {}s",
            elapsed.num_seconds()
        );
    }
}

impl Default for IngestReport {
    fn default() -> Self {
        Self::new()
    }
}
