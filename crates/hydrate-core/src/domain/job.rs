//! Job record, job type table and status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::JobError;
use super::ids::{EntityId, JobId};

/// Kind of curriculum node a job operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Subject,
    Chapter,
    Topic,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Subject => "SUBJECT",
            EntityType::Chapter => "CHAPTER",
            EntityType::Topic => "TOPIC",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUBJECT" => Ok(EntityType::Subject),
            "CHAPTER" => Ok(EntityType::Chapter),
            "TOPIC" => Ok(EntityType::Topic),
            _ => Err(UnknownVariant::new("entity type", s)),
        }
    }
}

/// Question difficulty. Question sets are generated once per difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(UnknownVariant::new("difficulty", s)),
        }
    }
}

/// The fixed set of hydration job types.
///
/// Each type is allowed on exactly one entity type (`entity_type()`); the
/// table is static, not inferred from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Subject -> chapters. Always a cascade root.
    Syllabus,
    /// Chapter -> topics.
    Topics,
    /// Topic -> study notes.
    Notes,
    /// Topic -> question set for one difficulty.
    Questions,
    /// Topic -> study guide built from existing notes and questions.
    Assemble,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Syllabus,
        JobType::Topics,
        JobType::Notes,
        JobType::Questions,
        JobType::Assemble,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Syllabus => "syllabus",
            JobType::Topics => "topics",
            JobType::Notes => "notes",
            JobType::Questions => "questions",
            JobType::Assemble => "assemble",
        }
    }

    /// The only entity type this job type may target.
    pub fn entity_type(self) -> EntityType {
        match self {
            JobType::Syllabus => EntityType::Subject,
            JobType::Topics => EntityType::Chapter,
            JobType::Notes | JobType::Questions | JobType::Assemble => EntityType::Topic,
        }
    }

    /// Content-bearing types must be submitted with an explicit language.
    pub fn requires_language(self) -> bool {
        !matches!(self, JobType::Assemble)
    }

    pub fn requires_difficulty(self) -> bool {
        matches!(self, JobType::Questions)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("job type", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Job status.
///
/// State transitions:
/// - Pending -> Running (atomic claim)
/// - Running -> Pending (kill switch at claim time, stale claim reaped)
/// - Running -> Completed | Failed (handler, or reconciler for cascade roots)
/// - Failed -> Pending (resubmission while attempts < max_attempts)
/// - Pending | Running -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Pending or running: the states the submission dedupe looks at.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected/completed pair for one progress counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub expected: u32,
    pub completed: u32,
}

impl Counter {
    pub fn new(expected: u32, completed: u32) -> Self {
        Self {
            expected,
            completed,
        }
    }
}

/// Root-only progress counters. Children contribute, they never carry these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub chapters: Counter,
    pub topics: Counter,
    pub notes: Counter,
    pub questions: Counter,
}

/// A hydration job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Equal to `id` for roots.
    pub root_id: JobId,
    pub parent_id: Option<JobId>,
    pub job_type: JobType,
    pub hierarchy_level: u8,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub language: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    /// `<CODE>::<message>`
    pub last_error: Option<String>,
    /// Only populated on roots.
    pub progress: Option<Progress>,
    pub content_ready: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A new root (or ad-hoc) job: level 1, `root_id == id`, no parent.
    pub fn new_root(
        id: JobId,
        job_type: JobType,
        entity_id: EntityId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            root_id: id,
            parent_id: None,
            job_type,
            hierarchy_level: 1,
            entity_type: job_type.entity_type(),
            entity_id,
            language: None,
            difficulty: None,
            payload: serde_json::Value::Object(Default::default()),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            locked_at: None,
            last_error: None,
            progress: (job_type == JobType::Syllabus).then(Progress::default),
            content_ready: false,
            created_at: now,
            completed_at: None,
        }
    }

    /// A child one level below `parent`, inheriting root, language and attempt limit.
    pub fn new_child(
        id: JobId,
        parent: &Job,
        job_type: JobType,
        entity_id: EntityId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            root_id: parent.root_id,
            parent_id: Some(parent.id),
            job_type,
            hierarchy_level: parent.hierarchy_level + 1,
            entity_type: job_type.entity_type(),
            entity_id,
            language: parent.language.clone(),
            difficulty: None,
            payload: serde_json::json!({ "rootJobId": parent.root_id }),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: parent.max_attempts,
            locked_at: None,
            last_error: None,
            progress: None,
            content_ready: false,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_difficulty(mut self, difficulty: Option<Difficulty>) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_root(&self) -> bool {
        self.root_id == self.id
    }

    /// Roots whose child levels are driven by the reconciler.
    /// Their handler leaves them `running` + `content_ready`.
    pub fn is_cascade_root(&self) -> bool {
        self.is_root() && self.job_type == JobType::Syllabus
    }

    /// Resolved for level-barrier purposes: terminal, or output durably persisted.
    /// A failure still waiting for automatic resubmission is not resolved.
    pub fn is_resolved(&self) -> bool {
        (self.status.is_terminal() && !self.awaits_retry()) || self.content_ready
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }

    /// Failed with a retryable code and attempts left; the reaper resubmits these.
    pub fn awaits_retry(&self) -> bool {
        self.can_retry()
            && self
                .last_error
                .as_deref()
                .is_some_and(|e| JobError::parse(e).is_retryable())
    }

    /// Short human label for logs and audit meta.
    pub fn label(&self) -> String {
        match self.difficulty {
            Some(d) => format!("{}:{}:{}", self.job_type, self.entity_id, d),
            None => format!("{}:{}", self.job_type, self.entity_id),
        }
    }
}
