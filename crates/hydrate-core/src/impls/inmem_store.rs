//! InMemoryStore - 開発・テスト用の正本
//!
//! JobStore / ContentStore / AuditLog / SettingsSource を 1 つの
//! `tokio::sync::Mutex` の内側で実装します。各メソッドがロックを 1 回だけ取るので、
//! ポートの「1 メソッド = 1 トランザクション」がそのまま成り立ちます。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Ancestor, Assembly, AuditEntry, Chapter, ContentWrite, Difficulty, EntityContext, EntityId,
    EntityType, Job, JobError, JobId, JobStatus, NoteSet, OutboxEntry, OutboxId, Progress,
    QuestionSet, Subject, Topic,
};
use crate::ports::{
    AuditLog, CommitOutcome, ContentCounts, ContentStore, CreateOutcome, Dedupe, JobStore,
    SettingsSource, StoreError, Transition,
};

#[derive(Debug, Clone)]
struct LockRow {
    holder: String,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    // ULID 順 = 作成順
    jobs: BTreeMap<JobId, Job>,
    outbox: Vec<OutboxEntry>,
    audit: Vec<AuditEntry>,
    locks: HashMap<String, LockRow>,
    settings: HashMap<String, String>,
    subjects: BTreeMap<EntityId, Subject>,
    chapters: BTreeMap<EntityId, Chapter>,
    topics: BTreeMap<EntityId, Topic>,
    notes: HashMap<(EntityId, String), NoteSet>,
    questions: HashMap<(EntityId, Difficulty, String), QuestionSet>,
    assemblies: HashMap<EntityId, Assembly>,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))
    }

    fn outbox_mut(&mut self, id: OutboxId) -> Result<&mut OutboxEntry, StoreError> {
        self.outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::OutboxNotFound(id))
    }

    fn find_duplicate(&self, job: &Job, dedupe: Dedupe) -> Option<&Job> {
        self.jobs.values().find(|j| match dedupe {
            Dedupe::ActiveTarget => {
                j.status.is_active()
                    && j.job_type == job.job_type
                    && j.entity_type == job.entity_type
                    && j.entity_id == job.entity_id
                    && j.difficulty == job.difficulty
            }
            Dedupe::CascadeSlot => {
                j.root_id == job.root_id
                    && j.hierarchy_level == job.hierarchy_level
                    && j.job_type == job.job_type
                    && j.entity_id == job.entity_id
                    && j.difficulty == job.difficulty
            }
        })
    }

    fn apply(&mut self, write: ContentWrite) {
        match write {
            ContentWrite::Chapters { chapters, .. } => {
                for chapter in chapters {
                    self.chapters.insert(chapter.id, chapter);
                }
            }
            ContentWrite::Topics { topics, .. } => {
                for topic in topics {
                    self.topics.insert(topic.id, topic);
                }
            }
            ContentWrite::Notes(notes) => {
                self.notes
                    .insert((notes.topic_id, notes.language.clone()), notes);
            }
            ContentWrite::Questions(set) => {
                self.questions
                    .insert((set.topic_id, set.difficulty, set.language.clone()), set);
            }
            ContentWrite::Assembly(assembly) => {
                self.assemblies.insert(assembly.topic_id, assembly);
            }
        }
    }

    fn chapters_of(&self, subject_id: EntityId) -> Vec<Chapter> {
        let mut chapters: Vec<Chapter> = self
            .chapters
            .values()
            .filter(|c| c.subject_id == subject_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.position);
        chapters
    }

    fn topics_of(&self, chapter_id: EntityId) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .topics
            .values()
            .filter(|t| t.chapter_id == chapter_id)
            .cloned()
            .collect();
        topics.sort_by_key(|t| t.position);
        topics
    }

    fn topics_of_subject(&self, subject_id: EntityId) -> Vec<Topic> {
        self.chapters_of(subject_id)
            .iter()
            .flat_map(|c| self.topics_of(c.id))
            .collect()
    }
}

/// Leave a terminal or requeued job without an owner.
fn settle(job: &mut Job, status: JobStatus, now: DateTime<Utc>) -> JobStatus {
    let prev = job.status;
    job.status = status;
    job.locked_at = None;
    if status.is_terminal() {
        job.completed_at = Some(now);
    }
    prev
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── seeding / inspection (not part of any port) ─────────────────────

    pub async fn insert_subject(&self, subject: Subject) {
        self.state.lock().await.subjects.insert(subject.id, subject);
    }

    pub async fn insert_chapter(&self, chapter: Chapter) {
        self.state.lock().await.chapters.insert(chapter.id, chapter);
    }

    pub async fn insert_topic(&self, topic: Topic) {
        self.state.lock().await.topics.insert(topic.id, topic);
    }

    pub async fn insert_content(&self, write: ContentWrite) {
        self.state.lock().await.apply(write);
    }

    pub async fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .await
            .settings
            .insert(key.into(), value.into());
    }

    pub async fn remove_setting(&self, key: &str) {
        self.state.lock().await.settings.remove(key);
    }

    /// Insert or replace a job record directly, bypassing every guard.
    pub async fn put_job(&self, job: Job) {
        self.state.lock().await.jobs.insert(job.id, job);
    }

    /// Mutate a job record directly. Returns `false` if it does not exist.
    pub async fn update_job(&self, id: JobId, f: impl FnOnce(&mut Job)) -> bool {
        match self.state.lock().await.jobs.get_mut(&id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn all_outbox(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.outbox.clone()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(
        &self,
        job: Job,
        outbox: OutboxEntry,
        dedupe: Dedupe,
    ) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.find_duplicate(&job, dedupe) {
            return Ok(CreateOutcome {
                job: existing.clone(),
                existing: true,
            });
        }
        state.outbox.push(outbox);
        state.jobs.insert(job.id, job.clone());
        Ok(CreateOutcome {
            job,
            existing: false,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.locked_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn release_claim(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        job.status = JobStatus::Pending;
        job.attempts = job.attempts.saturating_sub(1);
        job.locked_at = None;
        Ok(Some(job.clone()))
    }

    async fn commit_output(
        &self,
        id: JobId,
        output: Option<ContentWrite>,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let status = state.job_mut(id)?.status;
        if status != JobStatus::Running {
            return Ok(CommitOutcome::Skipped { status });
        }
        if let Some(write) = output {
            state.apply(write);
        }
        let job = state.job_mut(id)?;
        job.content_ready = true;
        if job.is_cascade_root() {
            job.locked_at = None;
            return Ok(CommitOutcome::ContentReady(job.clone()));
        }
        let prev = settle(job, JobStatus::Completed, now);
        Ok(CommitOutcome::Completed(Transition {
            prev,
            job: job.clone(),
        }))
    }

    async fn fail_job(
        &self,
        id: JobId,
        error: &JobError,
        from: &[JobStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if !from.contains(&job.status) {
            return Ok(None);
        }
        job.last_error = Some(error.to_string());
        let prev = settle(job, JobStatus::Failed, now);
        Ok(Some(Transition {
            prev,
            job: job.clone(),
        }))
    }

    async fn cancel_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Ok(None);
        }
        let prev = settle(job, JobStatus::Cancelled, now);
        Ok(Some(Transition {
            prev,
            job: job.clone(),
        }))
    }

    async fn cancel_descendants(
        &self,
        root_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transition>, StoreError> {
        let mut state = self.state.lock().await;
        let mut cancelled = Vec::new();
        for job in state.jobs.values_mut() {
            if job.root_id == root_id && job.id != root_id && !job.status.is_terminal() {
                let prev = settle(job, JobStatus::Cancelled, now);
                cancelled.push(Transition {
                    prev,
                    job: job.clone(),
                });
            }
        }
        Ok(cancelled)
    }

    async fn requeue(
        &self,
        id: JobId,
        from: JobStatus,
        outbox: OutboxEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if job.status != from {
            return Ok(None);
        }
        let prev = settle(job, JobStatus::Pending, now);
        job.completed_at = None;
        let transition = Transition {
            prev,
            job: job.clone(),
        };
        state.outbox.push(outbox);
        Ok(Some(transition))
    }

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn running_roots(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.is_root() && j.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn jobs_at_level(&self, root_id: JobId, level: u8) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.root_id == root_id && j.hierarchy_level == level)
            .cloned()
            .collect())
    }

    async fn failed_descendants(&self, root_id: JobId) -> Result<u32, StoreError> {
        let state = self.state.lock().await;
        let count = state
            .jobs
            .values()
            .filter(|j| j.root_id == root_id && j.id != root_id)
            .filter(|j| matches!(j.status, JobStatus::Failed | JobStatus::Cancelled))
            .filter(|j| !j.awaits_retry())
            .count();
        Ok(count as u32)
    }

    async fn update_progress(&self, root_id: JobId, progress: Progress) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.job_mut(root_id)?.progress = Some(progress);
        Ok(())
    }

    async fn finalize_root(
        &self,
        root_id: JobId,
        status: JobStatus,
        error: Option<&JobError>,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(root_id)?;
        if !job.is_root() || job.status != JobStatus::Running {
            return Ok(None);
        }
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        let prev = settle(job, status, now);
        Ok(Some(Transition {
            prev,
            job: job.clone(),
        }))
    }

    async fn undelivered_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| !e.is_delivered())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn outbox_for_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: OutboxId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state.outbox_mut(id)?;
        entry.delivery_attempts += 1;
        entry.delivered_at.get_or_insert(now);
        Ok(())
    }

    async fn record_delivery_failure(&self, id: OutboxId, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state.outbox_mut(id)?;
        entry.delivery_attempts += 1;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.locks.get(name)
            && now - row.acquired_at < ttl
        {
            return Ok(false);
        }
        if let Some(stale) = state.locks.get(name) {
            tracing::warn!(
                lock = name,
                previous_holder = %stale.holder,
                acquired_at = %stale.acquired_at,
                "taking over expired lock"
            );
        }
        state.locks.insert(
            name.to_string(),
            LockRow {
                holder: holder.to_string(),
                acquired_at: now,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.locks.get(name).is_some_and(|row| row.holder == holder) {
            state.locks.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn subject(&self, id: EntityId) -> Result<Option<Subject>, StoreError> {
        Ok(self.state.lock().await.subjects.get(&id).cloned())
    }

    async fn entity_context(
        &self,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<EntityContext>, StoreError> {
        let state = self.state.lock().await;
        let subject_ancestor = |subject_id: EntityId| {
            state.subjects.get(&subject_id).map(|s| Ancestor {
                entity_type: EntityType::Subject,
                id: s.id,
                name: s.name.clone(),
            })
        };

        let context = match entity_type {
            EntityType::Subject => state.subjects.get(&id).map(|s| EntityContext {
                entity_type,
                id,
                name: s.name.clone(),
                summary: s.description.clone(),
                ancestry: Vec::new(),
            }),
            EntityType::Chapter => state.chapters.get(&id).and_then(|c| {
                Some(EntityContext {
                    entity_type,
                    id,
                    name: c.title.clone(),
                    summary: Some(c.summary.clone()),
                    ancestry: vec![subject_ancestor(c.subject_id)?],
                })
            }),
            EntityType::Topic => state.topics.get(&id).and_then(|t| {
                let chapter = state.chapters.get(&t.chapter_id)?;
                Some(EntityContext {
                    entity_type,
                    id,
                    name: t.title.clone(),
                    summary: Some(t.summary.clone()),
                    ancestry: vec![
                        subject_ancestor(chapter.subject_id)?,
                        Ancestor {
                            entity_type: EntityType::Chapter,
                            id: chapter.id,
                            name: chapter.title.clone(),
                        },
                    ],
                })
            }),
        };
        Ok(context)
    }

    async fn chapters_of(&self, subject_id: EntityId) -> Result<Vec<Chapter>, StoreError> {
        Ok(self.state.lock().await.chapters_of(subject_id))
    }

    async fn topics_of(&self, chapter_id: EntityId) -> Result<Vec<Topic>, StoreError> {
        Ok(self.state.lock().await.topics_of(chapter_id))
    }

    async fn topics_of_subject(&self, subject_id: EntityId) -> Result<Vec<Topic>, StoreError> {
        Ok(self.state.lock().await.topics_of_subject(subject_id))
    }

    async fn notes_for(
        &self,
        topic_id: EntityId,
        language: &str,
    ) -> Result<Option<NoteSet>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.notes.get(&(topic_id, language.to_string())).cloned())
    }

    async fn question_set(
        &self,
        topic_id: EntityId,
        difficulty: Difficulty,
        language: &str,
    ) -> Result<Option<QuestionSet>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .questions
            .get(&(topic_id, difficulty, language.to_string()))
            .cloned())
    }

    async fn assembly_for(&self, topic_id: EntityId) -> Result<Option<Assembly>, StoreError> {
        Ok(self.state.lock().await.assemblies.get(&topic_id).cloned())
    }

    async fn content_counts(
        &self,
        subject_id: EntityId,
        language: &str,
    ) -> Result<ContentCounts, StoreError> {
        let state = self.state.lock().await;
        let chapters = state.chapters_of(subject_id);
        let topics = state.topics_of_subject(subject_id);
        let topics_with_notes = topics
            .iter()
            .filter(|t| state.notes.contains_key(&(t.id, language.to_string())))
            .count();
        let question_sets = state
            .questions
            .keys()
            .filter(|(topic_id, _, lang)| lang == language && topics.iter().any(|t| t.id == *topic_id))
            .count();
        Ok(ContentCounts {
            chapters: chapters.len() as u32,
            topics: topics.len() as u32,
            topics_with_notes: topics_with_notes as u32,
            question_sets: question_sets as u32,
        })
    }
}

#[async_trait]
impl AuditLog for InMemoryStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.state.lock().await.audit.push(entry);
        Ok(())
    }

    async fn entries_for(&self, job_id: JobId) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingsSource for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.settings.get(key).cloned())
    }
}
