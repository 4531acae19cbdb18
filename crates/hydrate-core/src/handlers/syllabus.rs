//! syllabus: SUBJECT → chapters. Always a cascade root.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{
    Chapter, ContentWrite, EntityContext, ErrorCode, Job, JobError, JobType, OutlineItem,
};
use crate::ports::{ContentStore, IdGenerator, StoreError};
use crate::typed::handler::store_failure;
use crate::typed::{Handler, Target};
use crate::validation::{ContentContract, require_count, require_text};

const MAX_CHAPTERS: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct SyllabusDraft {
    pub chapters: Vec<OutlineItem>,
}

impl ContentContract for SyllabusDraft {
    fn check(&self) -> Result<(), JobError> {
        require_count("chapters", self.chapters.len(), 1, MAX_CHAPTERS)?;
        check_outline("chapters", &self.chapters)
    }
}

/// Titles and summaries of an outline, plus title uniqueness.
pub(crate) fn check_outline(field: &str, items: &[OutlineItem]) -> Result<(), JobError> {
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        require_text(&format!("{field}[{i}].title"), &item.title, 3)?;
        require_text(&format!("{field}[{i}].summary"), &item.summary, 20)?;
        if !seen.insert(item.title.trim().to_lowercase()) {
            return Err(JobError::new(
                ErrorCode::ValidationFailed,
                format!("{field}[{i}].title '{}' is duplicated", item.title),
            ));
        }
    }
    Ok(())
}

pub struct SyllabusHandler;

#[async_trait]
impl Handler for SyllabusHandler {
    const JOB_TYPE: JobType = JobType::Syllabus;
    type Draft = SyllabusDraft;

    async fn existing_output(
        &self,
        job: &Job,
        content: &dyn ContentStore,
    ) -> Result<Option<Value>, StoreError> {
        let chapters = content.chapters_of(job.entity_id).await?;
        Ok((!chapters.is_empty()).then(|| json!({ "chapters": chapters.len() })))
    }

    async fn inputs(
        &self,
        job: &Job,
        _entity: &EntityContext,
        content: &dyn ContentStore,
    ) -> Result<Value, JobError> {
        let subject = content
            .subject(job.entity_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| {
                JobError::new(
                    ErrorCode::DependencyMissing,
                    format!("subject {} not found", job.entity_id),
                )
            })?;
        Ok(json!({ "targetChapters": subject.target_chapters }))
    }

    fn prompt(&self, target: &Target<'_>) -> String {
        let count = match target.inputs["targetChapters"].as_u64() {
            Some(n) => format!("exactly {n}"),
            None => "between 3 and 12".to_string(),
        };
        format!(
            "Design the syllabus for the subject \"{name}\".\n\
             {summary}\n\
             Write {count} chapters in {language}, ordered from foundations to advanced material.\n\
             Respond with JSON only: {{\"chapters\": [{{\"title\": string, \"summary\": string}}]}}",
            name = target.entity.name,
            summary = target.entity.summary.as_deref().unwrap_or_default(),
            language = target.job.language.as_deref().unwrap_or("the subject's language"),
        )
    }

    fn into_write(
        &self,
        target: &Target<'_>,
        draft: SyllabusDraft,
        ids: &dyn IdGenerator,
    ) -> Result<ContentWrite, JobError> {
        if let Some(expected) = target.inputs["targetChapters"].as_u64()
            && draft.chapters.len() as u64 != expected
        {
            return Err(JobError::new(
                ErrorCode::ValidationFailed,
                format!(
                    "expected {expected} chapters, got {}",
                    draft.chapters.len()
                ),
            ));
        }
        let subject_id = target.job.entity_id;
        let chapters = draft
            .chapters
            .into_iter()
            .enumerate()
            .map(|(i, item)| Chapter {
                id: ids.entity_id(),
                subject_id,
                position: i as u32 + 1,
                title: item.title.trim().to_string(),
                summary: item.summary.trim().to_string(),
            })
            .collect();
        Ok(ContentWrite::Chapters {
            subject_id,
            chapters,
        })
    }
}
