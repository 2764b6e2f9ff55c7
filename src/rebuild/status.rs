use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebuildPhase {
    #[default]
    Idle,
    Rebuilding,
    Reloading,
    Completed,
    Failed,
}

/// What caused a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Enroll,
    AddImage,
    Delete,
    DeleteImage,
    Manual,
    Cli,
}

impl Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TriggerSource::Enroll => "enroll",
            TriggerSource::AddImage => "add_image",
            TriggerSource::Delete => "delete",
            TriggerSource::DeleteImage => "delete_image",
            TriggerSource::Manual => "manual",
            TriggerSource::Cli => "cli",
        };
        write!(f, "{name}")
    }
}

/// Snapshot of the rebuild state machine, as served on `/api/rebuild_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildStatus {
    pub is_rebuilding: bool,
    /// 0..=100
    pub progress: u8,
    pub status: RebuildPhase,
    pub message: String,
    pub job_id: Option<Eid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub triggered_by: Option<TriggerSource>,
    /// Identities in the last successfully built store
    pub identity_count: Option<usize>,
}

impl Default for RebuildStatus {
    fn default() -> Self {
        Self {
            is_rebuilding: false,
            progress: 0,
            status: RebuildPhase::Idle,
            message: String::new(),
            job_id: None,
            started_at: None,
            completed_at: None,
            last_error: None,
            triggered_by: None,
            identity_count: None,
        }
    }
}

impl RebuildStatus {
    pub(crate) fn started(job_id: Eid, source: TriggerSource, previous: &RebuildStatus) -> Self {
        Self {
            is_rebuilding: true,
            progress: 10,
            status: RebuildPhase::Rebuilding,
            message: "Starting database rebuild...".to_string(),
            job_id: Some(job_id),
            started_at: Some(Utc::now()),
            completed_at: None,
            last_error: None,
            triggered_by: Some(source),
            identity_count: previous.identity_count,
        }
    }

    pub(crate) fn is_job(&self, job_id: &Eid) -> bool {
        self.job_id.as_ref() == Some(job_id)
    }

    pub(crate) fn complete(&mut self, message: String, identities: usize, last_error: Option<String>) {
        self.is_rebuilding = false;
        self.progress = 100;
        self.status = RebuildPhase::Completed;
        self.message = message;
        self.completed_at = Some(Utc::now());
        self.last_error = last_error;
        self.identity_count = Some(identities);
    }

    pub(crate) fn fail(&mut self, message: String, error: String) {
        self.is_rebuilding = false;
        self.progress = 0;
        self.status = RebuildPhase::Failed;
        self.message = message;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(error);
    }
}

/// Reply to a trigger request. Rejection leaves the status untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerOutcome {
    pub accepted: bool,
    pub message: String,
    pub status: RebuildStatus,
}
