//! notes: TOPIC → study notes in one language.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{ContentWrite, Job, JobError, JobType, NoteSection, NoteSet};
use crate::ports::{ContentStore, IdGenerator, StoreError};
use crate::typed::{Handler, Target};
use crate::validation::{ContentContract, require_count, require_text};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesDraft {
    pub title: String,
    pub sections: Vec<NoteSection>,
    #[serde(default)]
    pub key_points: Vec<String>,
}

impl ContentContract for NotesDraft {
    fn check(&self) -> Result<(), JobError> {
        require_text("title", &self.title, 3)?;
        require_count("sections", self.sections.len(), 1, 12)?;
        for (i, section) in self.sections.iter().enumerate() {
            require_text(&format!("sections[{i}].heading"), &section.heading, 3)?;
            require_text(&format!("sections[{i}].body"), &section.body, 40)?;
        }
        for (i, point) in self.key_points.iter().enumerate() {
            require_text(&format!("keyPoints[{i}]"), point, 5)?;
        }
        Ok(())
    }
}

pub struct NotesHandler;

#[async_trait]
impl Handler for NotesHandler {
    const JOB_TYPE: JobType = JobType::Notes;
    type Draft = NotesDraft;

    async fn existing_output(
        &self,
        job: &Job,
        content: &dyn ContentStore,
    ) -> Result<Option<Value>, StoreError> {
        let Some(language) = job.language.as_deref() else {
            return Ok(None);
        };
        let notes = content.notes_for(job.entity_id, language).await?;
        Ok(notes.map(|n| json!({ "sections": n.sections.len() })))
    }

    fn prompt(&self, target: &Target<'_>) -> String {
        format!(
            "Write study notes for the topic \"{breadcrumb}\".\n\
             Topic summary: {summary}\n\
             Language: {language}. Cover the topic fully now; do not defer material to other lessons.\n\
             Respond with JSON only: {{\"title\": string, \"sections\": [{{\"heading\": string, \"body\": string}}], \"keyPoints\": [string]}}",
            breadcrumb = target.entity.breadcrumb(),
            summary = target.entity.summary.as_deref().unwrap_or_default(),
            language = target.job.language.as_deref().unwrap_or_default(),
        )
    }

    fn into_write(
        &self,
        target: &Target<'_>,
        draft: NotesDraft,
        _ids: &dyn IdGenerator,
    ) -> Result<ContentWrite, JobError> {
        Ok(ContentWrite::Notes(NoteSet {
            topic_id: target.job.entity_id,
            language: target.language()?.to_string(),
            title: draft.title.trim().to_string(),
            sections: draft.sections,
            key_points: draft.key_points,
        }))
    }
}
