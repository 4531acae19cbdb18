//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! - ports を 1 か所で組み立て、各ループに同じ依存を配る
//! - 起動時検証（Fail-fast 設計）: 全 job type の handler と必須 port がそろわなければ build しない

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::HydrationConfig;
use crate::domain::JobType;
use crate::handlers::{
    AssembleHandler, NotesHandler, QuestionsHandler, SyllabusHandler, TopicsHandler,
};
use crate::impls::QueueDispatcher;
use crate::ports::{
    AuditLog, Clock, ContentStore, DeliveryQueue, Dispatcher, Generator, IdGenerator, JobStore,
    LegacyJobSource, SettingsSource, SystemClock, UlidGenerator,
};
use crate::typed::{Handler, RegistryError, TypedRegistry};
use crate::worker::WorkerGroup;

use super::audit::Auditor;
use super::delivery::Delivery;
use super::kill_switch::KillSwitch;
use super::legacy_adapter::LegacyAdapter;
use super::publisher_loop::PublisherLoop;
use super::reaper_loop::ReaperLoop;
use super::reconciler::{Reconciler, ReconcilerLoop};
use super::status::StatusService;
use super::submitter::Submitter;
use super::worker_loop::WorkerLoop;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryStore::new());
/// let app = AppBuilder::new(HydrationConfig::default())
///     .store(store)
///     .delivery_queue(Arc::new(InMemoryDeliveryQueue::new()))
///     .generator(Arc::new(StubGenerator::new()))
///     .with_default_handlers()?
///     .build()?;
/// let group = app.start();
/// ```
///
/// # Fail-fast 設計
/// - `JobType::ALL` の全種類に handler が必要
/// - 不足があれば `BuildError::MissingHandlers`
pub struct AppBuilder {
    config: HydrationConfig,
    registry: TypedRegistry,
    jobs: Option<Arc<dyn JobStore>>,
    content: Option<Arc<dyn ContentStore>>,
    audit_log: Option<Arc<dyn AuditLog>>,
    settings: Option<Arc<dyn SettingsSource>>,
    queue: Option<Arc<dyn DeliveryQueue>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    generator: Option<Arc<dyn Generator>>,
    legacy: Option<Arc<dyn LegacyJobSource>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers for job types: {0:?}. Every job type needs exactly one handler.")]
    MissingHandlers(Vec<JobType>),

    #[error("Missing port: {0}")]
    MissingPort(&'static str),
}

impl AppBuilder {
    pub fn new(config: HydrationConfig) -> Self {
        Self {
            config,
            registry: TypedRegistry::new(),
            jobs: None,
            content: None,
            audit_log: None,
            settings: None,
            queue: None,
            dispatcher: None,
            generator: None,
            legacy: None,
            clock: None,
            ids: None,
        }
    }

    /// One backend serving jobs, content, audit and settings.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: JobStore + ContentStore + AuditLog + SettingsSource + 'static,
    {
        let jobs: Arc<dyn JobStore> = store.clone();
        let content: Arc<dyn ContentStore> = store.clone();
        let audit_log: Arc<dyn AuditLog> = store.clone();
        let settings: Arc<dyn SettingsSource> = store;
        self.jobs = Some(jobs);
        self.content = Some(content);
        self.audit_log = Some(audit_log);
        self.settings = Some(settings);
        self
    }

    /// Settings from somewhere other than the store.
    pub fn settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn delivery_queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Defaults to a `QueueDispatcher` routing only the configured queue name.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Enables translation of `{ "legacyJobId": .. }` delivery messages.
    pub fn legacy_source(mut self, source: Arc<dyn LegacyJobSource>) -> Self {
        self.legacy = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Handler を登録
    ///
    /// ```ignore
    /// builder.register(NotesHandler)?;
    /// ```
    pub fn register<H: Handler>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.registry.register(handler)?;
        Ok(self)
    }

    /// Register the built-in handler for every job type.
    pub fn with_default_handlers(self) -> Result<Self, RegistryError> {
        self.register(SyllabusHandler)?
            .register(TopicsHandler)?
            .register(NotesHandler)?
            .register(QuestionsHandler)?
            .register(AssembleHandler)
    }

    pub fn build(self) -> Result<App, BuildError> {
        let missing = self.registry.missing_types();
        if !missing.is_empty() {
            return Err(BuildError::MissingHandlers(missing));
        }

        let jobs = self.jobs.ok_or(BuildError::MissingPort("job store"))?;
        let content = self.content.ok_or(BuildError::MissingPort("content store"))?;
        let audit_log = self.audit_log.ok_or(BuildError::MissingPort("audit log"))?;
        let settings = self.settings.ok_or(BuildError::MissingPort("settings source"))?;
        let queue = self.queue.ok_or(BuildError::MissingPort("delivery queue"))?;
        let generator = self.generator.ok_or(BuildError::MissingPort("generator"))?;

        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())) as Arc<dyn IdGenerator>);
        let dispatcher = self.dispatcher.unwrap_or_else(|| {
            Arc::new(QueueDispatcher::new(queue.clone(), [config.queue_name.clone()]))
                as Arc<dyn Dispatcher>
        });

        let audit = Auditor::new(audit_log.clone(), clock.clone(), ids.clone());
        let delivery = Delivery::new(jobs.clone(), dispatcher, clock.clone(), audit.clone());
        let kill_switch = Arc::new(KillSwitch::new(settings, config.kill_switch_ttl));
        let submitter = Submitter::new(
            jobs.clone(),
            content.clone(),
            ids.clone(),
            clock.clone(),
            audit.clone(),
            delivery.clone(),
            kill_switch.clone(),
            config.clone(),
        );
        let legacy = self
            .legacy
            .map(|source| LegacyAdapter::new(source, submitter.clone()));

        tracing::info!(
            queue = %config.queue_name,
            workers = config.worker_count,
            handlers = ?self.registry.registered_types(),
            "hydration app built"
        );

        Ok(App {
            config,
            jobs,
            content,
            audit_log,
            queue,
            generator,
            clock,
            ids,
            audit,
            delivery,
            kill_switch,
            registry: Arc::new(self.registry),
            submitter,
            legacy,
            reconcilers: AtomicUsize::new(0),
        })
    }
}

/// App は組み立て済みのエンジン
///
/// 各ループは `App` から作って spawn します。`start()` はそれをまとめて行います。
pub struct App {
    config: HydrationConfig,
    jobs: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    audit_log: Arc<dyn AuditLog>,
    queue: Arc<dyn DeliveryQueue>,
    generator: Arc<dyn Generator>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    audit: Auditor,
    delivery: Delivery,
    kill_switch: Arc<KillSwitch>,
    registry: Arc<TypedRegistry>,
    submitter: Submitter,
    legacy: Option<LegacyAdapter>,
    /// Reconciler holder ids must differ per instance.
    reconcilers: AtomicUsize,
}

impl App {
    pub fn config(&self) -> &HydrationConfig {
        &self.config
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn kill_switch(&self) -> Arc<KillSwitch> {
        self.kill_switch.clone()
    }

    pub fn worker(&self, worker_id: usize) -> WorkerLoop {
        WorkerLoop {
            worker_id,
            queue_name: self.config.queue_name.clone(),
            poll_timeout: self.config.poll_timeout,
            generation_timeout: self.config.generation_timeout,
            store_retry: self.config.store_retry.clone(),
            evidence_retry: self.config.evidence_retry.clone(),
            queue: self.queue.clone(),
            jobs: self.jobs.clone(),
            content: self.content.clone(),
            generator: self.generator.clone(),
            ids: self.ids.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            registry: self.registry.clone(),
            kill_switch: self.kill_switch.clone(),
            legacy: self.legacy.clone(),
        }
    }

    pub fn publisher(&self) -> PublisherLoop {
        PublisherLoop {
            jobs: self.jobs.clone(),
            delivery: self.delivery.clone(),
            batch: self.config.publish_batch,
            interval: self.config.publish_interval,
        }
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop {
            jobs: self.jobs.clone(),
            ids: self.ids.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            delivery: self.delivery.clone(),
            submitter: self.submitter.clone(),
            kill_switch: self.kill_switch.clone(),
            queue_name: self.config.queue_name.clone(),
            stale_claim_after: self.config.stale_claim_after,
            requeue_after: self.config.requeue_after,
            interval: self.config.reaper_interval,
        }
    }

    /// A reconciler with its own lock holder id.
    pub fn reconciler(&self) -> Reconciler {
        let seq = self.reconcilers.fetch_add(1, Ordering::Relaxed);
        Reconciler {
            jobs: self.jobs.clone(),
            content: self.content.clone(),
            ids: self.ids.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            queue_name: self.config.queue_name.clone(),
            lock_name: self.config.lock_name.clone(),
            lock_ttl: self.config.lock_ttl,
            holder: format!("reconciler-{}-{seq}", std::process::id()),
            store_retry: self.config.store_retry.clone(),
        }
    }

    pub fn reconciler_loop(&self) -> ReconcilerLoop {
        ReconcilerLoop {
            reconciler: self.reconciler(),
            interval: self.config.reconcile_interval,
        }
    }

    pub fn status(&self) -> StatusService {
        StatusService {
            jobs: self.jobs.clone(),
            audit_log: self.audit_log.clone(),
        }
    }

    /// Spawn `worker_count` workers plus the publisher, reaper and reconciler loops.
    pub fn start(&self) -> WorkerGroup {
        let mut group = WorkerGroup::new();
        for worker_id in 0..self.config.worker_count {
            let worker = self.worker(worker_id);
            group.spawn(move |shutdown| worker.run(shutdown));
        }
        let publisher = self.publisher();
        group.spawn(move |shutdown| publisher.run(shutdown));
        let reaper = self.reaper();
        group.spawn(move |shutdown| reaper.run(shutdown));
        let reconciler = self.reconciler_loop();
        group.spawn(move |shutdown| reconciler.run(shutdown));
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryDeliveryQueue, InMemoryStore, StubGenerator};

    fn wired() -> AppBuilder {
        AppBuilder::new(HydrationConfig::default())
            .store(Arc::new(InMemoryStore::new()))
            .delivery_queue(Arc::new(InMemoryDeliveryQueue::new()))
            .generator(Arc::new(StubGenerator::new()))
    }

    #[test]
    fn test_build_success() {
        let app = wired().with_default_handlers().unwrap().build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_handlers() {
        let app = wired()
            .register(SyllabusHandler)
            .unwrap()
            .register(NotesHandler)
            .unwrap()
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingHandlers(missing))
                if missing == vec![JobType::Topics, JobType::Questions, JobType::Assemble]
        ));
    }

    #[test]
    fn test_duplicate_handler_is_rejected() {
        let result = wired().with_default_handlers().unwrap().register(NotesHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(JobType::Notes))));
    }

    #[test]
    fn test_build_missing_port() {
        let app = AppBuilder::new(HydrationConfig::default())
            .store(Arc::new(InMemoryStore::new()))
            .generator(Arc::new(StubGenerator::new()))
            .with_default_handlers()
            .unwrap()
            .build();
        assert!(matches!(app, Err(BuildError::MissingPort("delivery queue"))));
    }

    #[test]
    fn test_reconcilers_get_distinct_holders() {
        let app = wired().with_default_handlers().unwrap().build().unwrap();
        assert_ne!(app.reconciler().holder, app.reconciler().holder);
    }

    #[tokio::test]
    async fn test_started_group_shuts_down() {
        let config = HydrationConfig::default()
            .with_workers(2)
            .with_poll_timeout(std::time::Duration::from_millis(20));
        let app = AppBuilder::new(config)
            .store(Arc::new(InMemoryStore::new()))
            .delivery_queue(Arc::new(InMemoryDeliveryQueue::new()))
            .generator(Arc::new(StubGenerator::new()))
            .with_default_handlers()
            .unwrap()
            .build()
            .unwrap();

        let group = app.start();
        assert_eq!(group.len(), 5);
        tokio::time::timeout(std::time::Duration::from_secs(5), group.shutdown_and_join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_pipeline_hydrates_a_subject() {
        use crate::app::SubmitRequest;
        use crate::domain::{AuditEvent, EntityType, JobStatus};
        use crate::ports::{AuditLog, ContentStore};
        use crate::testing::Harness;

        let h = Harness::new().await;
        let subject = h.seed_subject("Biology", Some(2)).await;
        let root_id = h
            .app
            .submitter()
            .submit(SubmitRequest::new(JobType::Syllabus, EntityType::Subject, subject).with_language("en"))
            .await
            .unwrap()
            .job_id;

        let root = h.run_until_terminal(root_id, 10).await;
        assert_eq!(root.status, JobStatus::Completed);

        // 2 chapters x 3 topics, 6 notes, 18 question sets
        let counts = h.store.content_counts(subject, "en").await.unwrap();
        assert_eq!(counts.chapters, 2);
        assert_eq!(counts.topics, 6);
        assert_eq!(counts.topics_with_notes, 6);
        assert_eq!(counts.question_sets, 18);

        let progress = root.progress.unwrap();
        assert_eq!(progress.questions.expected, 18);
        assert_eq!(progress.questions.completed, 18);

        let jobs = h.store.all_jobs().await;
        assert_eq!(jobs.len(), 1 + 2 + 6 + 18);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
        assert!(jobs.iter().all(|j| j.root_id == root_id));

        let trail = h.store.entries_for(root_id).await.unwrap();
        assert_eq!(trail.last().map(|e| e.event), Some(AuditEvent::Completed));
    }

    #[tokio::test]
    async fn a_second_language_counts_only_its_own_content() {
        use crate::app::SubmitRequest;
        use crate::domain::{Counter, EntityType, JobStatus};
        use crate::ports::ContentStore;
        use crate::testing::Harness;

        let h = Harness::new().await;
        let subject = h.seed_subject("Biology", Some(2)).await;
        let submitter = h.app.submitter();
        let syllabus = |language: &str| {
            SubmitRequest::new(JobType::Syllabus, EntityType::Subject, subject).with_language(language)
        };

        let en = submitter.submit(syllabus("en")).await.unwrap().job_id;
        assert_eq!(h.run_until_terminal(en, 10).await.status, JobStatus::Completed);

        // chapters と topics は言語に依存しない
        let fr_counts = h.store.content_counts(subject, "fr").await.unwrap();
        assert_eq!(fr_counts.topics, 6);
        assert_eq!(fr_counts.topics_with_notes, 0);
        assert_eq!(fr_counts.question_sets, 0);

        let fr = submitter.submit(syllabus("fr")).await.unwrap().job_id;
        let root = h.run_until_terminal(fr, 10).await;
        assert_eq!(root.status, JobStatus::Completed);
        let progress = root.progress.unwrap();
        assert_eq!(progress.notes, Counter::new(6, 6));
        assert_eq!(progress.questions, Counter::new(18, 18));

        let en_counts = h.store.content_counts(subject, "en").await.unwrap();
        assert_eq!(en_counts.question_sets, 18);
    }
}
