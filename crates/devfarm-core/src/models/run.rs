//! Flashing job and run models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named job template on the cloud (a "project" in Testdroid terms)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashJob {
    pub id: u64,
    pub name: String,
}

/// Lifecycle state of a run.
///
/// ```text
/// Created → Waiting → Running → Finished
///     \         \         \
///      └─────────┴─────────┴──→ Aborted | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Waiting,
    Running,
    Finished,
    Aborted,
    Failed,
    /// Anything the cloud reports that we do not model
    #[serde(other)]
    Unknown,
}

impl RunState {
    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Aborted | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Created => "CREATED",
            RunState::Waiting => "WAITING",
            RunState::Running => "RUNNING",
            RunState::Finished => "FINISHED",
            RunState::Aborted => "ABORTED",
            RunState::Failed => "FAILED",
            RunState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Result reported by a run once it stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// One execution of a [`FlashJob`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashRun {
    pub id: u64,
    /// Job this run belongs to
    pub job_id: u64,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl FlashRun {
    /// Stopped with a failed outcome, or stopped without finishing
    pub fn has_failed(&self) -> bool {
        match self.state {
            RunState::Aborted | RunState::Failed => true,
            RunState::Finished => self.outcome == Some(RunOutcome::Failed),
            _ => false,
        }
    }
}

/// A key/value parameter attached to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameter {
    pub id: u64,
    pub key: String,
    pub value: String,
}
