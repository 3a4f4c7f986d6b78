use crate::error::{DubError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DubError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| DubError::validation(format!("invalid job id '{}': {}", s, e)))
    }
}

/// Position of a job in the pipeline. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Uploading,
    Transcribing,
    Translating,
    Synthesizing,
    Delivering,
    Done,
}

impl Stage {
    /// The stages that do work, in order.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Uploading,
        Stage::Transcribing,
        Stage::Translating,
        Stage::Synthesizing,
        Stage::Delivering,
    ];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Queued => Some(Stage::Uploading),
            Stage::Uploading => Some(Stage::Transcribing),
            Stage::Transcribing => Some(Stage::Translating),
            Stage::Translating => Some(Stage::Synthesizing),
            Stage::Synthesizing => Some(Stage::Delivering),
            Stage::Delivering => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Uploading => "uploading",
            Stage::Transcribing => "transcribing",
            Stage::Translating => "translating",
            Stage::Synthesizing => "synthesizing",
            Stage::Delivering => "delivering",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<StageOutcome>,
    pub retries: u32,
}

/// A remote object the job created, kept so a restart can finish cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub key: String,
    pub url: String,
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}: {}", self.kind, self.stage, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: Status,
    pub stage: Stage,
    pub source: PathBuf,
    pub target_language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub degraded: bool,
    pub source_duration_secs: Option<f64>,
}

impl Job {
    pub fn new(source: impl Into<PathBuf>, target_language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: Status::Queued,
            stage: Stage::Queued,
            source: source.into(),
            target_language: target_language.into(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            deadline: None,
            stages: Vec::new(),
            error: None,
            resources: Vec::new(),
            output_path: None,
            degraded: false,
            source_duration_secs: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stage_record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn total_retries(&self) -> u32 {
        self.stages.iter().map(|r| r.retries).sum()
    }

    /// Move to the next stage. Skipping ahead or going back is refused.
    pub fn enter_stage(&mut self, stage: Stage) -> Result<()> {
        if self.is_terminal() {
            return Err(DubError::validation(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }
        if self.stage.next() != Some(stage) || stage == Stage::Done {
            return Err(DubError::validation(format!(
                "illegal transition {} -> {}",
                self.stage, stage
            )));
        }
        self.close_current(StageOutcome::Completed);
        self.stage = stage;
        self.status = Status::Running;
        self.stages.push(StageRecord {
            stage,
            entered_at: Utc::now(),
            finished_at: None,
            outcome: None,
            retries: 0,
        });
        Ok(())
    }

    pub fn set_retries(&mut self, retries: u32) {
        if let Some(record) = self.open_record_mut() {
            record.retries = retries;
        }
    }

    /// Finish the last stage and mark the job succeeded.
    pub fn succeed(&mut self, output_path: Option<PathBuf>) -> Result<()> {
        if self.stage != Stage::Delivering {
            return Err(DubError::validation(format!(
                "cannot succeed from stage {}",
                self.stage
            )));
        }
        self.close_current(StageOutcome::Completed);
        self.output_path = output_path;
        self.finish(Status::Succeeded);
        Ok(())
    }

    pub fn fail(&mut self, error: &DubError) {
        self.terminate(Status::Failed, StageOutcome::Failed, error);
    }

    pub fn cancel(&mut self, error: &DubError) {
        self.terminate(Status::Cancelled, StageOutcome::Cancelled, error);
    }

    pub fn record_resource(&mut self, key: impl Into<String>, url: impl Into<String>) {
        self.resources.push(ResourceRecord {
            key: key.into(),
            url: url.into(),
            released: false,
        });
    }

    pub fn mark_resource_released(&mut self, key: &str) {
        for record in self.resources.iter_mut().filter(|r| r.key == key) {
            record.released = true;
        }
    }

    pub fn unreleased_resources(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.iter().filter(|r| !r.released)
    }

    fn terminate(&mut self, status: Status, outcome: StageOutcome, error: &DubError) {
        self.close_current(outcome);
        self.error = Some(ErrorDetail {
            kind: error.kind(),
            stage: self.stage,
            message: error.to_string(),
        });

        // Stages never reached are recorded as skipped.
        let now = Utc::now();
        let mut next = self.stage.next();
        while let Some(stage) = next {
            if stage == Stage::Done {
                break;
            }
            self.stages.push(StageRecord {
                stage,
                entered_at: now,
                finished_at: Some(now),
                outcome: Some(StageOutcome::Skipped),
                retries: 0,
            });
            next = stage.next();
        }
        self.finish(status);
    }

    fn finish(&mut self, status: Status) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    fn open_record_mut(&mut self) -> Option<&mut StageRecord> {
        self.stages.iter_mut().rev().find(|r| r.outcome.is_none())
    }

    fn close_current(&mut self, outcome: StageOutcome) {
        if let Some(record) = self.open_record_mut() {
            record.finished_at = Some(Utc::now());
            record.outcome = Some(outcome);
        }
    }
}
