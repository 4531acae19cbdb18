//! ContentStore port - カリキュラム成果物の読み取り
//!
//! 書き込みは `JobStore::commit_output` がジョブ完了と同一トランザクションで行うので、
//! ここは読み取り専用です。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Assembly, Chapter, Difficulty, EntityContext, EntityId, EntityType, NoteSet, QuestionSet,
    Subject, Topic,
};

use super::job_store::StoreError;

/// Domain record counts under one subject, used for root progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCounts {
    pub chapters: u32,
    pub topics: u32,
    pub topics_with_notes: u32,
    pub question_sets: u32,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn subject(&self, id: EntityId) -> Result<Option<Subject>, StoreError>;

    /// Name and ancestry of an entity. `None` if it does not exist.
    async fn entity_context(
        &self,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<EntityContext>, StoreError>;

    /// Chapters of a subject, by position.
    async fn chapters_of(&self, subject_id: EntityId) -> Result<Vec<Chapter>, StoreError>;

    /// Topics of one chapter, by position.
    async fn topics_of(&self, chapter_id: EntityId) -> Result<Vec<Topic>, StoreError>;

    /// Every topic under a subject, chapter order then position.
    async fn topics_of_subject(&self, subject_id: EntityId) -> Result<Vec<Topic>, StoreError>;

    async fn notes_for(
        &self,
        topic_id: EntityId,
        language: &str,
    ) -> Result<Option<NoteSet>, StoreError>;

    async fn question_set(
        &self,
        topic_id: EntityId,
        difficulty: Difficulty,
        language: &str,
    ) -> Result<Option<QuestionSet>, StoreError>;

    async fn assembly_for(&self, topic_id: EntityId) -> Result<Option<Assembly>, StoreError>;

    /// Record counts under a subject. Notes and question sets count only `language`.
    async fn content_counts(
        &self,
        subject_id: EntityId,
        language: &str,
    ) -> Result<ContentCounts, StoreError>;
}
