//! Test harness: an `App` over the in-memory adapters with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::app::{App, AppBuilder, SubmitRequest, WorkOutcome};
use crate::config::HydrationConfig;
use crate::domain::{
    Chapter, ContentWrite, EntityId, EntityType, Job, JobId, JobStatus, JobType, Subject, Topic,
};
use crate::impls::{
    InMemoryDeliveryQueue, InMemoryLegacyJobs, InMemoryStore, QueueDispatcher, StubGenerator,
};
use crate::ports::{Clock, ContentStore, DeliveryQueue, JobStore, ManualClock};
use crate::retry::RetryPolicy;

/// Topics the harness writes per chapter when it simulates a topics job.
const SIMULATED_TOPICS: u32 = 2;

pub(crate) struct Harness {
    pub app: App,
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InMemoryDeliveryQueue>,
    pub generator: Arc<StubGenerator>,
    pub legacy: Arc<InMemoryLegacyJobs>,
    pub clock: Arc<ManualClock>,
}

pub(crate) fn test_config() -> HydrationConfig {
    let mut config = HydrationConfig::default()
        .with_poll_timeout(Duration::from_millis(10))
        .with_kill_switch_ttl(Duration::ZERO)
        .with_generation_timeout(Duration::from_secs(1))
        .with_evidence_retry(RetryPolicy::new(Duration::from_millis(1), 1.0, 2));
    config.store_retry = RetryPolicy::new(Duration::from_millis(1), 1.0, 3);
    config
}

impl Harness {
    pub async fn new() -> Self {
        let queue_name = test_config().queue_name;
        Self::with_routes(&[queue_name.as_str()]).await
    }

    /// Harness whose dispatcher only knows `routes`.
    pub async fn with_routes(routes: &[&str]) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let generator = Arc::new(StubGenerator::new());
        let legacy = Arc::new(InMemoryLegacyJobs::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher = Arc::new(QueueDispatcher::new(queue.clone(), routes.iter().copied()));

        let app = AppBuilder::new(test_config())
            .store(store.clone())
            .delivery_queue(queue.clone())
            .dispatcher(dispatcher)
            .generator(generator.clone())
            .legacy_source(legacy.clone())
            .clock(clock.clone())
            .with_default_handlers()
            .expect("default handlers register")
            .build()
            .expect("harness app builds");

        Self {
            app,
            store,
            queue,
            generator,
            legacy,
            clock,
        }
    }

    pub async fn seed_subject(&self, name: &str, target_chapters: Option<u32>) -> EntityId {
        let id = EntityId::generate();
        self.store
            .insert_subject(Subject {
                id,
                name: name.to_string(),
                description: None,
                target_chapters,
            })
            .await;
        id
    }

    /// A topic under a fresh subject and chapter.
    pub async fn seed_topic(&self, name: &str) -> EntityId {
        let subject_id = self.seed_subject("Biology", None).await;
        let chapter_id = EntityId::generate();
        self.store
            .insert_chapter(Chapter {
                id: chapter_id,
                subject_id,
                position: 1,
                title: "Plants".into(),
                summary: "How plants grow, feed and reproduce.".into(),
            })
            .await;
        let id = EntityId::generate();
        self.store
            .insert_topic(Topic {
                id,
                chapter_id,
                position: 1,
                title: name.to_string(),
                summary: format!("An introduction to {name}."),
            })
            .await;
        id
    }

    /// A submitted syllabus root that a worker has claimed, with its message consumed.
    pub async fn running_root(&self, chapters: u32) -> Job {
        let subject = self.seed_subject("Biology", Some(chapters)).await;
        let submission = self
            .app
            .submitter()
            .submit(
                SubmitRequest::new(JobType::Syllabus, EntityType::Subject, subject)
                    .with_language("en"),
            )
            .await
            .expect("syllabus submission");
        let queue_name = &self.app.config().queue_name;
        while self
            .queue
            .pop(queue_name, Duration::from_millis(1))
            .await
            .expect("queue pop")
            .is_some()
        {}
        self.store
            .claim(submission.job_id, self.clock.now())
            .await
            .expect("claim")
            .expect("root is pending")
    }

    /// Simulate handler output level by level until `level` has been fanned out.
    /// Returns the jobs at `level`.
    pub async fn reconcile_until_level(&self, root: &Job, level: u8) -> Vec<Job> {
        let subject = self
            .store
            .subject(root.entity_id)
            .await
            .expect("subject read")
            .expect("subject exists");
        if self.store.chapters_of(subject.id).await.expect("chapters").is_empty() {
            let count = subject.target_chapters.unwrap_or(3);
            let chapters = (1..=count)
                .map(|i| Chapter {
                    id: EntityId::generate(),
                    subject_id: subject.id,
                    position: i,
                    title: format!("Chapter {i}"),
                    summary: format!("What chapter {i} covers."),
                })
                .collect();
            self.store
                .insert_content(ContentWrite::Chapters {
                    subject_id: subject.id,
                    chapters,
                })
                .await;
        }
        self.store.update_job(root.id, |j| j.content_ready = true).await;

        let reconciler = self.app.reconciler();
        for current in 2..level {
            reconciler.reconcile().await.expect("reconcile");
            for job in self.store.jobs_at_level(root.id, current).await.expect("jobs") {
                self.simulate_output(&job).await;
                self.complete(job.id).await;
            }
        }
        reconciler.reconcile().await.expect("reconcile");
        self.store
            .jobs_at_level(root.id, level)
            .await
            .expect("jobs at level")
    }

    async fn simulate_output(&self, job: &Job) {
        let write = match job.job_type {
            JobType::Topics => ContentWrite::Topics {
                chapter_id: job.entity_id,
                topics: (1..=SIMULATED_TOPICS)
                    .map(|i| Topic {
                        id: EntityId::generate(),
                        chapter_id: job.entity_id,
                        position: i,
                        title: format!("Topic {i}"),
                        summary: format!("What topic {i} covers."),
                    })
                    .collect(),
            },
            JobType::Notes => ContentWrite::Notes(crate::domain::NoteSet {
                topic_id: job.entity_id,
                language: job.language.clone().unwrap_or_default(),
                title: "Notes".into(),
                sections: vec![crate::domain::NoteSection {
                    heading: "Overview".into(),
                    body: "Simulated notes body.".into(),
                }],
                key_points: Vec::new(),
            }),
            _ => return,
        };
        self.store.insert_content(write).await;
    }

    async fn complete(&self, job_id: JobId) {
        let now = self.clock.now();
        self.store
            .update_job(job_id, |j| {
                j.status = JobStatus::Completed;
                j.content_ready = true;
                j.completed_at = Some(now);
            })
            .await;
    }

    /// Drive publisher, workers and reconciler until `root_id` is terminal.
    pub async fn run_until_terminal(&self, root_id: JobId, max_rounds: usize) -> Job {
        let publisher = self.app.publisher();
        let worker = self.app.worker(0);
        let reconciler = self.app.reconciler();
        for _ in 0..max_rounds {
            publisher.publish_once().await.expect("publish");
            while worker.run_once().await.expect("worker") != WorkOutcome::Idle {}
            reconciler.reconcile().await.expect("reconcile");

            let root = self
                .store
                .get_job(root_id)
                .await
                .expect("root read")
                .expect("root exists");
            if root.status.is_terminal() {
                return root;
            }
        }
        panic!("root {root_id} not terminal after {max_rounds} rounds");
    }
}
