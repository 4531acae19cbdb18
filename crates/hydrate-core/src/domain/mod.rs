//! Domain model (IDs, jobs, cascade shape, audit, outbox, content).
//!
//! I/O を持たない純粋な型だけを置きます。状態遷移の「実行」は ports 側、
//! 遷移の「ルール」（terminal 判定・level barrier など）はここに置きます。

pub mod audit;
pub mod cascade;
pub mod content;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outbox;

pub use self::audit::{AuditEntry, AuditEvent, AuditRecord};
pub use self::cascade::{DEEPEST_LEVEL, LevelSummary, ROOT_LEVEL, job_type_at, level_of};
pub use self::content::{
    Ancestor, Assembly, Chapter, ContentWrite, EntityContext, NoteSection, NoteSet, OutlineItem,
    Question, QuestionSet, Subject, Topic,
};
pub use self::errors::{ErrorCode, JobError, infer_code};
pub use self::ids::{AuditId, EntityId, JobId, OutboxId, ParseIdError};
pub use self::job::{
    Counter, Difficulty, EntityType, Job, JobStatus, JobType, Progress, UnknownVariant,
};
pub use self::outbox::{DeliveryMessage, OutboxEntry};
