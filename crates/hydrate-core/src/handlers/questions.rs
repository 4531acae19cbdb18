//! questions: TOPIC → question set for one difficulty, built from the topic's notes.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{
    ContentWrite, EntityContext, ErrorCode, Job, JobError, JobType, Question, QuestionSet,
};
use crate::ports::{ContentStore, IdGenerator, StoreError};
use crate::typed::handler::store_failure;
use crate::typed::{Handler, Target};
use crate::validation::{ContentContract, require_count, require_text};

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionsDraft {
    pub questions: Vec<Question>,
}

impl ContentContract for QuestionsDraft {
    fn check(&self) -> Result<(), JobError> {
        require_count("questions", self.questions.len(), 3, 25)?;
        for (i, q) in self.questions.iter().enumerate() {
            require_text(&format!("questions[{i}].prompt"), &q.prompt, 10)?;
            require_count(&format!("questions[{i}].options"), q.options.len(), 2, 6)?;
            let mut seen = HashSet::new();
            for (j, option) in q.options.iter().enumerate() {
                require_text(&format!("questions[{i}].options[{j}]"), option, 1)?;
                if !seen.insert(option.trim().to_lowercase()) {
                    return Err(JobError::new(
                        ErrorCode::ValidationFailed,
                        format!("questions[{i}] repeats option '{option}'"),
                    ));
                }
            }
            if q.answer >= q.options.len() {
                return Err(JobError::new(
                    ErrorCode::ValidationFailed,
                    format!(
                        "questions[{i}].answer {} is out of range for {} options",
                        q.answer,
                        q.options.len()
                    ),
                ));
            }
            require_text(&format!("questions[{i}].explanation"), &q.explanation, 10)?;
        }
        Ok(())
    }
}

pub struct QuestionsHandler;

#[async_trait]
impl Handler for QuestionsHandler {
    const JOB_TYPE: JobType = JobType::Questions;
    type Draft = QuestionsDraft;

    async fn existing_output(
        &self,
        job: &Job,
        content: &dyn ContentStore,
    ) -> Result<Option<Value>, StoreError> {
        let (Some(language), Some(difficulty)) = (job.language.as_deref(), job.difficulty) else {
            return Ok(None);
        };
        let set = content
            .question_set(job.entity_id, difficulty, language)
            .await?;
        Ok(set.map(|s| json!({ "questions": s.questions.len() })))
    }

    async fn inputs(
        &self,
        job: &Job,
        _entity: &EntityContext,
        content: &dyn ContentStore,
    ) -> Result<Value, JobError> {
        let language = job.language.as_deref().unwrap_or_default();
        let notes = content
            .notes_for(job.entity_id, language)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| {
                JobError::new(
                    ErrorCode::DependencyMissing,
                    format!("notes for topic {} ({language}) not found", job.entity_id),
                )
            })?;
        Ok(json!({
            "notesTitle": notes.title,
            "keyPoints": notes.key_points,
            "headings": notes.sections.iter().map(|s| s.heading.as_str()).collect::<Vec<_>>(),
        }))
    }

    fn prompt(&self, target: &Target<'_>) -> String {
        format!(
            "Write {difficulty} multiple-choice questions for the topic \"{breadcrumb}\".\n\
             Base every question on these notes: {notes}\n\
             Language: {language}. Each question has 4 options and one correct answer index.\n\
             Respond with JSON only: {{\"questions\": [{{\"prompt\": string, \"options\": [string], \"answer\": number, \"explanation\": string}}]}}",
            difficulty = target
                .job
                .difficulty
                .map(|d| d.as_str())
                .unwrap_or("medium"),
            breadcrumb = target.entity.breadcrumb(),
            notes = target.inputs,
            language = target.job.language.as_deref().unwrap_or_default(),
        )
    }

    fn into_write(
        &self,
        target: &Target<'_>,
        draft: QuestionsDraft,
        _ids: &dyn IdGenerator,
    ) -> Result<ContentWrite, JobError> {
        let difficulty = target.job.difficulty.ok_or_else(|| {
            JobError::new(ErrorCode::ValidationFailed, "questions job has no difficulty")
        })?;
        Ok(ContentWrite::Questions(QuestionSet {
            topic_id: target.job.entity_id,
            difficulty,
            language: target.language()?.to_string(),
            questions: draft.questions,
        }))
    }
}
