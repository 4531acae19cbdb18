//! Reconciler - カスケードを進める単一実行（single-flight）のパス
//!
//! 1 パスの流れ（ロックを取れたインスタンスだけが実行）:
//! 1. running の cascade root を列挙
//! 2. level 1 から順に level barrier を確認
//!    - 解決済み（全ジョブが terminal か content_ready）なら次の level を fan-out
//!    - 未解決の level で止まる
//! 3. root の progress をドメインレコードの実数から再計算
//! 4. 最深 level が解決したら（または fan-out 先が 0 件なら）root を確定
//!
//! fan-out は「不足分だけ作る」ので、途中でクラッシュしても次のパスで埋まります。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use crate::domain::{
    AuditEvent, AuditRecord, Counter, DEEPEST_LEVEL, Difficulty, EntityContext, EntityId,
    ErrorCode, Job, JobError, JobStatus, JobType, LevelSummary, OutboxEntry, Progress,
    ROOT_LEVEL, job_type_at,
};
use crate::ports::{Clock, ContentStore, Dedupe, IdGenerator, JobStore, StoreError};
use crate::retry::{RetryPolicy, retry_with_backoff};

use super::audit::Auditor;
use super::submitter::outbox_meta;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `false` when another instance held the lock; nothing was touched.
    pub acquired: bool,
    pub roots: usize,
    pub created: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Work planned for one child slot of the next level.
struct Slot {
    job_type: JobType,
    entity_id: EntityId,
    /// Entity whose job at the previous level becomes the parent.
    parent_entity: EntityId,
    difficulty: Option<Difficulty>,
}

#[derive(Clone)]
pub struct Reconciler {
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) audit: Auditor,
    pub(crate) queue_name: String,
    pub(crate) lock_name: String,
    pub(crate) lock_ttl: Duration,
    pub(crate) holder: String,
    pub(crate) store_retry: RetryPolicy,
}

impl Reconciler {
    /// One lock-guarded pass over every running cascade root.
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let ttl = chrono::Duration::from_std(self.lock_ttl).unwrap_or(chrono::Duration::MAX);
        let acquired = self
            .jobs
            .try_acquire_lock(&self.lock_name, &self.holder, self.clock.now(), ttl)
            .await?;
        if !acquired {
            tracing::debug!(holder = %self.holder, lock = %self.lock_name, "reconciliation lock held elsewhere");
            return Ok(ReconcileReport::default());
        }

        let result = self.pass().await;

        // エラー経路でも必ず解放する
        if let Err(err) = self.jobs.release_lock(&self.lock_name, &self.holder).await {
            tracing::warn!(holder = %self.holder, error = %err, "failed to release reconciliation lock");
        }
        result
    }

    async fn pass(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport {
            acquired: true,
            ..Default::default()
        };
        let roots = self.jobs.running_roots().await?;
        for root in roots.iter().filter(|r| r.is_cascade_root()) {
            report.roots += 1;
            match self.reconcile_root(root).await {
                Ok(outcome) => {
                    report.created += outcome.created;
                    match outcome.finalized {
                        Some(JobStatus::Completed) => report.completed += 1,
                        Some(_) => report.failed += 1,
                        None => {}
                    }
                }
                // 1 つの root の失敗で他の root を止めない
                Err(err) => {
                    tracing::error!(root_id = %root.id, error = %err, "root reconciliation failed");
                }
            }
        }
        if report.created > 0 || report.completed > 0 || report.failed > 0 {
            tracing::info!(?report, "reconciliation pass");
        }
        Ok(report)
    }

    async fn reconcile_root(&self, root: &Job) -> Result<RootOutcome, StoreError> {
        let mut outcome = RootOutcome::default();
        let mut finalize = false;

        for level in ROOT_LEVEL..=DEEPEST_LEVEL {
            let jobs = self.jobs.jobs_at_level(root.id, level).await?;
            let summary = LevelSummary::from_jobs(level, &jobs);
            if !summary.is_resolved() {
                tracing::debug!(root_id = %root.id, level, open = summary.open(), total = summary.total(), "level barrier holds");
                break;
            }
            if level == DEEPEST_LEVEL {
                finalize = true;
                break;
            }

            let next = level + 1;
            let planned = self.plan(root, next).await?;
            if planned.is_empty() {
                tracing::info!(root_id = %root.id, level = next, "nothing to fan out; finalizing early");
                finalize = true;
                break;
            }
            outcome.created += self.fan_out(root, &jobs, next, planned).await?;
        }

        self.refresh_progress(root).await?;
        if finalize {
            outcome.finalized = self.finalize(root).await?;
        }
        Ok(outcome)
    }

    /// Child slots of `level`, enumerated from the domain output of the level above.
    async fn plan(&self, root: &Job, level: u8) -> Result<Vec<Slot>, StoreError> {
        let Some(job_type) = job_type_at(level) else {
            return Ok(Vec::new());
        };
        let subject_id = root.entity_id;
        let slots = match job_type {
            JobType::Topics => self
                .content
                .chapters_of(subject_id)
                .await?
                .into_iter()
                .map(|chapter| Slot {
                    job_type,
                    entity_id: chapter.id,
                    parent_entity: subject_id,
                    difficulty: None,
                })
                .collect(),
            JobType::Notes => self
                .content
                .topics_of_subject(subject_id)
                .await?
                .into_iter()
                .map(|topic| Slot {
                    job_type,
                    entity_id: topic.id,
                    parent_entity: topic.chapter_id,
                    difficulty: None,
                })
                .collect(),
            JobType::Questions => {
                let language = root.language.as_deref().unwrap_or_default();
                let mut slots = Vec::new();
                for topic in self.content.topics_of_subject(subject_id).await? {
                    // notes のない topic には問題を作れない
                    if self.content.notes_for(topic.id, language).await?.is_none() {
                        continue;
                    }
                    slots.extend(Difficulty::ALL.into_iter().map(|difficulty| Slot {
                        job_type,
                        entity_id: topic.id,
                        parent_entity: topic.id,
                        difficulty: Some(difficulty),
                    }));
                }
                slots
            }
            JobType::Syllabus | JobType::Assemble => Vec::new(),
        };
        Ok(slots)
    }

    /// Create the planned slots that have no job yet. One store call per child.
    async fn fan_out(
        &self,
        root: &Job,
        parents: &[Job],
        level: u8,
        planned: Vec<Slot>,
    ) -> Result<usize, StoreError> {
        let existing: HashSet<(EntityId, Option<Difficulty>)> = self
            .jobs
            .jobs_at_level(root.id, level)
            .await?
            .into_iter()
            .map(|j| (j.entity_id, j.difficulty))
            .collect();
        let mut by_entity: HashMap<EntityId, &Job> = HashMap::new();
        for parent in parents {
            by_entity.entry(parent.entity_id).or_insert(parent);
        }

        let mut created = 0;
        for slot in planned {
            if existing.contains(&(slot.entity_id, slot.difficulty)) {
                continue;
            }
            let Some(parent) = by_entity.get(&slot.parent_entity) else {
                tracing::warn!(root_id = %root.id, level, entity_id = %slot.entity_id, "no parent job for child entity; skipping");
                continue;
            };
            if self.create_child(root, parent, &slot).await? {
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!(root_id = %root.id, level, created, "fanned out");
        }
        Ok(created)
    }

    async fn create_child(&self, root: &Job, parent: &Job, slot: &Slot) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let child = Job::new_child(self.ids.job_id(), parent, slot.job_type, slot.entity_id, now)
            .with_difficulty(slot.difficulty);
        let entity = self
            .content
            .entity_context(child.entity_type, child.entity_id)
            .await?
            .unwrap_or_else(|| EntityContext {
                entity_type: child.entity_type,
                id: child.entity_id,
                name: child.entity_id.to_string(),
                summary: None,
                ancestry: Vec::new(),
            });
        let outbox = OutboxEntry::for_job(
            self.ids.outbox_id(),
            &self.queue_name,
            child.id,
            outbox_meta(&child, &entity),
            now,
        );

        let outcome = retry_with_backoff(&self.store_retry, StoreError::is_transient, || {
            self.jobs
                .create_job(child.clone(), outbox.clone(), Dedupe::CascadeSlot)
        })
        .await?;
        if outcome.existing {
            return Ok(false);
        }
        self.audit
            .record(
                AuditRecord::new(child.id, AuditEvent::Created)
                    .transition(None, JobStatus::Pending)
                    .with_meta(json!({
                        "rootJobId": root.id,
                        "parentJobId": parent.id,
                        "level": child.hierarchy_level,
                        "entity": entity.breadcrumb(),
                        "difficulty": child.difficulty,
                    })),
            )
            .await;
        Ok(true)
    }

    /// Progress from domain record counts, not from child job bookkeeping.
    async fn refresh_progress(&self, root: &Job) -> Result<Progress, StoreError> {
        let language = root.language.as_deref().unwrap_or_default();
        let counts = self.content.content_counts(root.entity_id, language).await?;
        let target = self
            .content
            .subject(root.entity_id)
            .await?
            .and_then(|s| s.target_chapters);
        let progress = Progress {
            chapters: Counter::new(target.unwrap_or(counts.chapters), counts.chapters),
            topics: Counter::new(counts.topics, counts.topics),
            notes: Counter::new(counts.topics, counts.topics_with_notes),
            questions: Counter::new(
                counts.topics * Difficulty::ALL.len() as u32,
                counts.question_sets,
            ),
        };
        if root.progress != Some(progress) {
            self.jobs.update_progress(root.id, progress).await?;
        }
        Ok(progress)
    }

    /// Complete or fail the root by its failed/cancelled descendant count.
    async fn finalize(&self, root: &Job) -> Result<Option<JobStatus>, StoreError> {
        let failures = self.jobs.failed_descendants(root.id).await?;
        let (status, error) = if failures == 0 {
            (JobStatus::Completed, None)
        } else {
            (
                JobStatus::Failed,
                Some(JobError::new(
                    ErrorCode::DescendantsFailed,
                    format!("{failures} descendant job(s) failed or were cancelled"),
                )),
            )
        };

        let Some(transition) = self
            .jobs
            .finalize_root(root.id, status, error.as_ref(), self.clock.now())
            .await?
        else {
            return Ok(None);
        };
        match &error {
            Some(error) => self.audit.failed(&transition, error).await,
            None => {
                self.audit
                    .transition(
                        AuditEvent::Completed,
                        &transition,
                        json!({ "progress": transition.job.progress }),
                    )
                    .await
            }
        }
        tracing::info!(root_id = %root.id, %status, failures, "root finalized");
        Ok(Some(status))
    }
}

#[derive(Debug, Default)]
struct RootOutcome {
    created: usize,
    finalized: Option<JobStatus>,
}

/// ReconcilerLoop - `reconcile()` を一定間隔で呼ぶ
#[derive(Clone)]
pub struct ReconcilerLoop {
    pub(crate) reconciler: Reconciler,
    pub(crate) interval: Duration,
}

impl ReconcilerLoop {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(holder = %self.reconciler.holder, "reconciler started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if let Err(err) = self.reconciler.reconcile().await {
                tracing::error!(error = %err, "reconciliation failed");
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Chapter, ContentWrite, JobId, NoteSection, NoteSet, Question, QuestionSet, Topic,
    };
    use crate::testing::Harness;

    async fn complete(h: &Harness, jobs: &[Job]) {
        for job in jobs {
            h.store
                .update_job(job.id, |j| {
                    j.status = JobStatus::Completed;
                    j.content_ready = true;
                })
                .await;
        }
    }

    async fn level(h: &Harness, root: JobId, level: u8) -> Vec<Job> {
        h.store.jobs_at_level(root, level).await.unwrap()
    }

    async fn add_chapters(h: &Harness, subject: EntityId, n: u32) {
        let chapters = (1..=n)
            .map(|i| Chapter {
                id: EntityId::generate(),
                subject_id: subject,
                position: i,
                title: format!("Chapter {i}"),
                summary: format!("Summary of chapter {i}"),
            })
            .collect();
        h.store
            .insert_content(ContentWrite::Chapters {
                subject_id: subject,
                chapters,
            })
            .await;
    }

    async fn add_topics(h: &Harness, chapter: EntityId, n: u32) {
        let topics = (1..=n)
            .map(|i| Topic {
                id: EntityId::generate(),
                chapter_id: chapter,
                position: i,
                title: format!("Topic {i}"),
                summary: format!("Summary of topic {i}"),
            })
            .collect();
        h.store
            .insert_content(ContentWrite::Topics {
                chapter_id: chapter,
                topics,
            })
            .await;
    }

    async fn add_notes(h: &Harness, topic: EntityId) {
        h.store
            .insert_content(ContentWrite::Notes(NoteSet {
                topic_id: topic,
                language: "en".into(),
                title: "Notes".into(),
                sections: vec![NoteSection {
                    heading: "Overview".into(),
                    body: "Body".into(),
                }],
                key_points: vec![],
            }))
            .await;
    }

    async fn add_questions(h: &Harness, topic: EntityId, difficulty: Difficulty) {
        h.store
            .insert_content(ContentWrite::Questions(QuestionSet {
                topic_id: topic,
                difficulty,
                language: "en".into(),
                questions: vec![Question {
                    prompt: "Q".into(),
                    options: vec!["a".into(), "b".into()],
                    answer: 0,
                    explanation: "because".into(),
                }],
            }))
            .await;
    }

    #[tokio::test]
    async fn cascade_fans_out_3_9_27_and_completes_the_root() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        let reconciler = h.app.reconciler();

        add_chapters(&h, root.entity_id, 3).await;
        h.store.update_job(root.id, |j| j.content_ready = true).await;
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.created, 3);
        let topics_jobs = level(&h, root.id, 2).await;
        assert_eq!(topics_jobs.len(), 3);
        assert!(topics_jobs.iter().all(|j| j.job_type == JobType::Topics && j.parent_id == Some(root.id)));

        for job in &topics_jobs {
            add_topics(&h, job.entity_id, 3).await;
        }
        complete(&h, &topics_jobs).await;
        assert_eq!(reconciler.reconcile().await.unwrap().created, 9);
        let notes_jobs = level(&h, root.id, 3).await;
        assert_eq!(notes_jobs.len(), 9);

        for job in &notes_jobs {
            add_notes(&h, job.entity_id).await;
        }
        complete(&h, &notes_jobs).await;
        assert_eq!(reconciler.reconcile().await.unwrap().created, 27);
        let question_jobs = level(&h, root.id, 4).await;
        assert_eq!(question_jobs.len(), 27);
        assert!(question_jobs.iter().all(|j| j.difficulty.is_some() && j.hierarchy_level == 4));

        for job in &question_jobs {
            add_questions(&h, job.entity_id, job.difficulty.unwrap()).await;
        }
        complete(&h, &question_jobs).await;
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.completed, 1);

        let root = h.store.get_job(root.id).await.unwrap().unwrap();
        assert_eq!(root.status, JobStatus::Completed);
        let progress = root.progress.unwrap();
        assert_eq!(progress.chapters.completed, 3);
        assert_eq!(progress.topics.completed, 9);
        assert_eq!(progress.notes.completed, 9);
        assert_eq!(progress.questions.completed, 27);
        assert_eq!(progress.questions.expected, 27);
    }

    #[tokio::test]
    async fn level_barrier_holds_until_every_job_is_resolved() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        let topics_jobs = h.reconcile_until_level(&root, 2).await;
        for job in &topics_jobs {
            add_topics(&h, job.entity_id, 2).await;
        }

        complete(&h, &topics_jobs[..2]).await;
        h.store
            .update_job(topics_jobs[2].id, |j| j.status = JobStatus::Running)
            .await;
        let reconciler = h.app.reconciler();
        assert_eq!(reconciler.reconcile().await.unwrap().created, 0);
        assert!(level(&h, root.id, 3).await.is_empty());

        complete(&h, &topics_jobs[2..]).await;
        assert_eq!(reconciler.reconcile().await.unwrap().created, 6);
        assert_eq!(reconciler.reconcile().await.unwrap().created, 0);
        assert_eq!(level(&h, root.id, 3).await.len(), 6);
    }

    #[tokio::test]
    async fn failed_and_cancelled_children_pass_the_barrier_but_fail_the_root() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        let topics_jobs = h.reconcile_until_level(&root, 2).await;

        // 1 つ失敗、1 つキャンセル、1 つだけ topics を生成
        let now = h.clock.now();
        h.store.claim(topics_jobs[0].id, now).await.unwrap();
        h.store
            .fail_job(
                topics_jobs[0].id,
                &JobError::new(ErrorCode::ValidationFailed, "bad outline"),
                &[JobStatus::Running],
                now,
            )
            .await
            .unwrap();
        h.store.cancel_job(topics_jobs[1].id, now).await.unwrap();
        add_topics(&h, topics_jobs[2].entity_id, 1).await;
        complete(&h, &topics_jobs[2..]).await;

        let reconciler = h.app.reconciler();
        assert_eq!(reconciler.reconcile().await.unwrap().created, 1);
        let notes = level(&h, root.id, 3).await;
        add_notes(&h, notes[0].entity_id).await;
        complete(&h, &notes).await;
        assert_eq!(reconciler.reconcile().await.unwrap().created, 3);
        let questions = level(&h, root.id, 4).await;
        complete(&h, &questions).await;

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.failed, 1);
        let root = h.store.get_job(root.id).await.unwrap().unwrap();
        assert_eq!(root.status, JobStatus::Failed);
        let error = JobError::parse(root.last_error.as_deref().unwrap());
        assert_eq!(error.code, ErrorCode::DescendantsFailed);
        assert!(error.message.starts_with("2 "));
    }

    #[tokio::test]
    async fn a_child_awaiting_resubmission_defers_finalization() {
        let h = Harness::new().await;
        let root = h.running_root(1).await;
        let questions = h.reconcile_until_level(&root, 4).await;
        assert_eq!(questions.len(), 6);
        for job in &questions[1..] {
            add_questions(&h, job.entity_id, job.difficulty.unwrap()).await;
        }
        complete(&h, &questions[1..]).await;

        // 1 回目の試行がタイムアウト。attempts は 3 中 1
        let flaky = questions[0].id;
        let now = h.clock.now();
        h.store.claim(flaky, now).await.unwrap();
        h.store
            .fail_job(
                flaky,
                &JobError::new(ErrorCode::Timeout, "generation timed out after 1000ms"),
                &[JobStatus::Running],
                now,
            )
            .await
            .unwrap();

        let reconciler = h.app.reconciler();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!((report.completed, report.failed), (0, 0));
        assert_eq!(
            h.store.get_job(root.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        assert_eq!(h.app.reaper().reap_once().await.unwrap().resubmitted, 1);
        h.app.worker(0).run_once().await.unwrap();
        let retried = h.store.get_job(flaky).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Completed);
        assert_eq!(retried.attempts, 2);

        assert_eq!(reconciler.reconcile().await.unwrap().completed, 1);
        let root = h.store.get_job(root.id).await.unwrap().unwrap();
        assert_eq!(root.status, JobStatus::Completed);
        assert_eq!(root.last_error, None);
    }

    #[tokio::test]
    async fn exhausted_retryable_failures_fail_the_root() {
        let h = Harness::new().await;
        let root = h.running_root(1).await;
        let questions = h.reconcile_until_level(&root, 4).await;
        complete(&h, &questions[1..]).await;

        let flaky = questions[0].id;
        h.store
            .update_job(flaky, |j| {
                j.status = JobStatus::Failed;
                j.attempts = j.max_attempts;
                j.last_error = Some("TRANSPORT::connection reset".to_string());
            })
            .await;

        assert_eq!(h.app.reconciler().reconcile().await.unwrap().failed, 1);
        assert_eq!(
            h.store.get_job(root.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn empty_fan_out_finalizes_the_root_early() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        let topics_jobs = h.reconcile_until_level(&root, 2).await;
        // topics 生成が何も作らなかった
        complete(&h, &topics_jobs).await;

        let report = h.app.reconciler().reconcile().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            h.store.get_job(root.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn held_lock_makes_the_pass_a_no_op() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        add_chapters(&h, root.entity_id, 3).await;
        h.store.update_job(root.id, |j| j.content_ready = true).await;

        let config = h.app.config();
        assert!(h
            .store
            .try_acquire_lock(&config.lock_name, "someone-else", h.clock.now(), chrono::Duration::minutes(5))
            .await
            .unwrap());

        let report = h.app.reconciler().reconcile().await.unwrap();
        assert!(!report.acquired);
        assert!(level(&h, root.id, 2).await.is_empty());

        h.store.release_lock(&config.lock_name, "someone-else").await.unwrap();
        assert_eq!(h.app.reconciler().reconcile().await.unwrap().created, 3);
    }

    #[tokio::test]
    async fn passes_from_separate_holders_create_each_child_once() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        add_chapters(&h, root.entity_id, 3).await;
        h.store.update_job(root.id, |j| j.content_ready = true).await;

        let first = h.app.reconciler().reconcile().await.unwrap();
        let second = h.app.reconciler().reconcile().await.unwrap();

        assert!(first.acquired && second.acquired);
        assert_eq!((first.created, second.created), (3, 0));
        assert_eq!(level(&h, root.id, 2).await.len(), 3);
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let h = Harness::new().await;
        let config = h.app.config();
        h.store
            .try_acquire_lock(&config.lock_name, "crashed", h.clock.now(), chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert!(!h.app.reconciler().reconcile().await.unwrap().acquired);
        h.clock.advance(chrono::Duration::minutes(6));
        assert!(h.app.reconciler().reconcile().await.unwrap().acquired);
    }

    #[tokio::test]
    async fn roots_without_content_are_left_alone() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        add_chapters(&h, root.entity_id, 3).await;

        let report = h.app.reconciler().reconcile().await.unwrap();
        assert_eq!(report.roots, 1);
        assert_eq!(report.created, 0);
        let root = h.store.get_job(root.id).await.unwrap().unwrap();
        assert_eq!(root.status, JobStatus::Running);
        assert_eq!(root.progress.unwrap().chapters, Counter::new(3, 3));
    }
}
