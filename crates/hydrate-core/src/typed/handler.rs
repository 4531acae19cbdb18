//! Handler trait - job type ごとの生成ハンドラ
//!
//! - ジェネリック trait (`Handler`) : draft 型・prompt・成果物への変換を型で書く
//! - Object-safe trait (`DynHandler`) : registry に格納するための型消去
//! - `TypedHandler<H>` : 共通パイプライン（context 取得 → 既存確認 → 生成 →
//!   parse → 検証 → commit）を 1 か所で実装する

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::app::Auditor;
use crate::domain::{
    AuditEvent, AuditRecord, ContentWrite, EntityContext, ErrorCode, Job, JobError, JobType,
};
use crate::ports::{
    Clock, CommitOutcome, ContentStore, GenerationError, Generator, IdGenerator, JobStore,
    StoreError,
};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::validation::{ContentContract, parse_output};

/// Everything a handler run may touch.
pub struct HandlerContext<'a> {
    pub jobs: &'a dyn JobStore,
    pub content: &'a dyn ContentStore,
    pub generator: &'a dyn Generator,
    pub ids: &'a dyn IdGenerator,
    pub clock: &'a dyn Clock,
    pub audit: &'a Auditor,
    pub generation_timeout: Duration,
    pub store_retry: &'a RetryPolicy,
}

/// What a handler is generating for.
pub struct Target<'a> {
    pub job: &'a Job,
    pub entity: &'a EntityContext,
    /// Extra inputs loaded by `Handler::inputs` (parent content, targets).
    pub inputs: &'a Value,
}

impl Target<'_> {
    /// Language of content-bearing jobs; its absence is a contract violation.
    pub fn language(&self) -> Result<&str, JobError> {
        self.job.language.as_deref().ok_or_else(|| {
            JobError::new(
                ErrorCode::ValidationFailed,
                format!("{} job has no language", self.job.job_type),
            )
        })
    }
}

/// Handler は 1 つの job type の生成を担当する
///
/// ```ignore
/// struct NotesHandler;
///
/// #[async_trait]
/// impl Handler for NotesHandler {
///     const JOB_TYPE: JobType = JobType::Notes;
///     type Draft = NotesDraft;
///     ...
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    const JOB_TYPE: JobType;

    /// Shape the generation output is parsed into.
    type Draft: DeserializeOwned + ContentContract + Send + 'static;

    /// Summary of already-persisted output for this job, if any.
    async fn existing_output(
        &self,
        job: &Job,
        content: &dyn ContentStore,
    ) -> Result<Option<Value>, StoreError>;

    /// Inputs beyond the entity context. Missing parent content is DEPENDENCY_MISSING.
    async fn inputs(
        &self,
        _job: &Job,
        _entity: &EntityContext,
        _content: &dyn ContentStore,
    ) -> Result<Value, JobError> {
        Ok(Value::Null)
    }

    fn prompt(&self, target: &Target<'_>) -> String;

    /// Turn a validated draft into the records to commit.
    fn into_write(
        &self,
        target: &Target<'_>,
        draft: Self::Draft,
        ids: &dyn IdGenerator,
    ) -> Result<ContentWrite, JobError>;

    /// Post-commit evidence that the output really exists.
    async fn has_evidence(&self, job: &Job, content: &dyn ContentStore) -> Result<bool, StoreError> {
        Ok(self.existing_output(job, content).await?.is_some())
    }
}

/// Result of a successful handler run.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub commit: CommitOutcome,
    /// Output already existed; nothing was generated.
    pub reused: bool,
    pub meta: Value,
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `TypedHandler<H>` を DynHandler に変換することで
/// `HashMap<JobType, Arc<dyn DynHandler>>` に格納できるようにします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, job: &Job, cx: &HandlerContext<'_>) -> Result<HandlerOutcome, JobError>;

    async fn verify(&self, job: &Job, content: &dyn ContentStore) -> Result<bool, StoreError>;
}

pub struct TypedHandler<H: Handler> {
    handler: H,
    _marker: PhantomData<fn() -> H::Draft>,
}

impl<H: Handler> TypedHandler<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

pub(crate) fn store_failure(err: StoreError) -> JobError {
    let code = match err {
        StoreError::JobNotFound(_) | StoreError::OutboxNotFound(_) => ErrorCode::DependencyMissing,
        ref e if e.is_transient() => ErrorCode::Transport,
        _ => ErrorCode::Unknown,
    };
    JobError::new(code, err.to_string())
}

fn generation_failure(err: GenerationError) -> JobError {
    match err {
        GenerationError::Timeout(_) => JobError::new(ErrorCode::Timeout, err.to_string()),
        GenerationError::Transport(_) => JobError::new(ErrorCode::Transport, err.to_string()),
        GenerationError::Backend(message) => JobError::infer(message),
    }
}

impl<H: Handler> TypedHandler<H> {
    async fn commit(
        &self,
        job: &Job,
        output: Option<ContentWrite>,
        cx: &HandlerContext<'_>,
    ) -> Result<CommitOutcome, JobError> {
        retry_with_backoff(cx.store_retry, StoreError::is_transient, || {
            cx.jobs.commit_output(job.id, output.clone(), cx.clock.now())
        })
        .await
        .map_err(store_failure)
    }
}

#[async_trait]
impl<H: Handler> DynHandler for TypedHandler<H> {
    fn job_type(&self) -> JobType {
        H::JOB_TYPE
    }

    async fn run(&self, job: &Job, cx: &HandlerContext<'_>) -> Result<HandlerOutcome, JobError> {
        let entity = cx
            .content
            .entity_context(job.entity_type, job.entity_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| {
                JobError::new(
                    ErrorCode::DependencyMissing,
                    format!("{} {} not found", job.entity_type, job.entity_id),
                )
            })?;

        // 既に成果物があれば生成せずに完了扱い（at-least-once 配送への冪等性）
        if let Some(existing) = self
            .handler
            .existing_output(job, cx.content)
            .await
            .map_err(store_failure)?
        {
            tracing::info!(job_id = %job.id, job_type = %job.job_type, "output already exists; reusing");
            let commit = self.commit(job, None, cx).await?;
            return Ok(HandlerOutcome {
                commit,
                reused: true,
                meta: existing,
            });
        }

        let inputs = self.handler.inputs(job, &entity, cx.content).await?;
        let target = Target {
            job,
            entity: &entity,
            inputs: &inputs,
        };
        let prompt = self.handler.prompt(&target);
        let meta = json!({
            "jobId": job.id,
            "jobType": job.job_type,
            "entityName": entity.name,
            "breadcrumb": entity.breadcrumb(),
            "language": job.language,
            "difficulty": job.difficulty,
            "inputs": inputs,
        });

        let started = std::time::Instant::now();
        let generation = match tokio::time::timeout(
            cx.generation_timeout,
            cx.generator.generate(&prompt, &meta, cx.generation_timeout),
        )
        .await
        {
            Err(_) => {
                return Err(JobError::new(
                    ErrorCode::Timeout,
                    format!(
                        "generation timed out after {}ms",
                        cx.generation_timeout.as_millis()
                    ),
                ));
            }
            Ok(result) => result.map_err(generation_failure)?,
        };

        cx.audit
            .record(AuditRecord::new(job.id, AuditEvent::ResponseReceived).with_meta(json!({
                "chars": generation.content.len(),
                "elapsedMs": started.elapsed().as_millis() as u64,
                "usage": generation.usage,
                "costUsd": generation.cost_usd,
            })))
            .await;

        let checked = parse_output::<H::Draft>(&generation.content).and_then(|draft| {
            draft.check()?;
            self.handler.into_write(&target, draft, cx.ids)
        });
        let write = match checked {
            Ok(write) => write,
            Err(err) => {
                cx.audit
                    .record(
                        AuditRecord::new(job.id, AuditEvent::ValidationFailed).with_meta(json!({
                            "code": err.code,
                            "message": err.message,
                        })),
                    )
                    .await;
                return Err(err);
            }
        };
        let records = write.record_count();
        cx.audit
            .record(
                AuditRecord::new(job.id, AuditEvent::ValidationPassed)
                    .with_meta(json!({ "records": records })),
            )
            .await;

        let commit = self.commit(job, Some(write), cx).await?;
        Ok(HandlerOutcome {
            commit,
            reused: false,
            meta: json!({ "records": records }),
        })
    }

    async fn verify(&self, job: &Job, content: &dyn ContentStore) -> Result<bool, StoreError> {
        self.handler.has_evidence(job, content).await
    }
}
