//! Cascade shape: which job type runs at which hierarchy level.
//!
//! ```text
//! level 1  syllabus   SUBJECT          (root)
//! level 2  topics     CHAPTER          one per chapter
//! level 3  notes      TOPIC            one per topic
//! level 4  questions  TOPIC x {easy, medium, hard}
//! ```
//!
//! The hierarchy is fixed-depth. There are no arbitrary DAGs here.

use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus, JobType};

pub const ROOT_LEVEL: u8 = 1;
pub const DEEPEST_LEVEL: u8 = 4;

/// Job type created at `level`, or `None` outside the cascade.
pub fn job_type_at(level: u8) -> Option<JobType> {
    match level {
        1 => Some(JobType::Syllabus),
        2 => Some(JobType::Topics),
        3 => Some(JobType::Notes),
        4 => Some(JobType::Questions),
        _ => None,
    }
}

/// Level at which a job type sits in the cascade. `Assemble` is ad-hoc only.
pub fn level_of(job_type: JobType) -> Option<u8> {
    match job_type {
        JobType::Syllabus => Some(1),
        JobType::Topics => Some(2),
        JobType::Notes => Some(3),
        JobType::Questions => Some(4),
        JobType::Assemble => None,
    }
}

/// Status histogram of the jobs at one level of one root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub level: u8,
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    /// Failed jobs the reaper will resubmit; they hold the barrier.
    pub retrying: u32,
    pub cancelled: u32,
    /// Non-terminal jobs whose output is already persisted (roots awaiting children).
    pub content_ready: u32,
}

impl LevelSummary {
    pub fn from_jobs<'a>(level: u8, jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut summary = Self {
            level,
            ..Self::default()
        };
        for job in jobs {
            summary.add(job);
        }
        summary
    }

    pub fn add(&mut self, job: &Job) {
        match job.status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running if job.content_ready => self.content_ready += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed if job.awaits_retry() => self.retrying += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending
            + self.running
            + self.completed
            + self.failed
            + self.retrying
            + self.cancelled
            + self.content_ready
    }

    /// Jobs still holding the barrier.
    pub fn open(&self) -> u32 {
        self.pending + self.running + self.retrying
    }

    /// Barrier check: at least one job, and none pending, in flight or
    /// awaiting resubmission.
    ///
    /// Settled `failed` and `cancelled` jobs are resolved here; they are
    /// counted against the root at finalization instead.
    pub fn is_resolved(&self) -> bool {
        self.total() > 0 && self.open() == 0
    }

    pub fn failures(&self) -> u32 {
        self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityId, JobId};
    use chrono::Utc;

    fn job_with(status: JobStatus, content_ready: bool) -> Job {
        let mut job = Job::new_root(JobId::generate(), JobType::Topics, EntityId::generate(), 3, Utc::now());
        job.status = status;
        job.content_ready = content_ready;
        job
    }

    #[test]
    fn levels_round_trip_through_the_table() {
        for level in ROOT_LEVEL..=DEEPEST_LEVEL {
            let job_type = job_type_at(level).unwrap();
            assert_eq!(level_of(job_type), Some(level));
        }
        assert_eq!(job_type_at(DEEPEST_LEVEL + 1), None);
        assert_eq!(level_of(JobType::Assemble), None);
    }

    #[test]
    fn one_running_sibling_holds_the_barrier() {
        let jobs = [
            job_with(JobStatus::Completed, true),
            job_with(JobStatus::Completed, true),
            job_with(JobStatus::Running, false),
        ];
        let summary = LevelSummary::from_jobs(2, &jobs);
        assert_eq!(summary.total(), 3);
        assert!(!summary.is_resolved());
    }

    #[test]
    fn failed_and_cancelled_siblings_pass_the_barrier() {
        let jobs = [
            job_with(JobStatus::Completed, true),
            job_with(JobStatus::Failed, false),
            job_with(JobStatus::Cancelled, false),
        ];
        let summary = LevelSummary::from_jobs(2, &jobs);
        assert!(summary.is_resolved());
        assert_eq!(summary.failures(), 2);
    }

    #[test]
    fn a_failure_awaiting_resubmission_holds_the_barrier() {
        let mut retrying = job_with(JobStatus::Failed, false);
        retrying.attempts = 1;
        retrying.last_error = Some("TIMEOUT::generation timed out after 1000ms".to_string());
        let jobs = [job_with(JobStatus::Completed, true), retrying];

        let summary = LevelSummary::from_jobs(4, &jobs);
        assert_eq!(summary.retrying, 1);
        assert_eq!(summary.failures(), 0);
        assert!(!summary.is_resolved());
    }

    #[test]
    fn running_root_with_content_is_resolved() {
        let summary = LevelSummary::from_jobs(1, &[job_with(JobStatus::Running, true)]);
        assert!(summary.is_resolved());
    }

    #[test]
    fn empty_level_is_never_resolved() {
        assert!(!LevelSummary::default().is_resolved());
    }
}
