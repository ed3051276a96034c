//! Cron job and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of checker kinds a job can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IssueTracker,
    ForgeComments,
    HttpPoll,
}

/// A persisted polling job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Checker-specific configuration, parsed by the checker itself.
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJob {
    /// Whether this job should fire now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.interval_seconds as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One execution of a job. History is capped per store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRun {
    pub id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_session_id: Option<String>,
    pub trigger_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trigger_count: u32,
}

/// A checker-produced situation worth acting on. One session is spawned per
/// trigger whose `dedupe_key` has never been seen for the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub dedupe_key: String,
    pub session_name: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub summary: String,
}

/// What a checker returns. Failures travel in `error`, never as a panic or
/// an `Err`; the scheduler records them and moves on.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub triggers: Vec<Trigger>,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            triggers: Vec::new(),
            error: Some(error.into()),
        }
    }
}
