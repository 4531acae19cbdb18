//! assemble: TOPIC → study guide from existing notes and question sets. Ad-hoc only.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{
    Assembly, ContentWrite, Difficulty, EntityContext, ErrorCode, Job, JobError, JobType,
};
use crate::ports::{ContentStore, IdGenerator, StoreError};
use crate::typed::handler::store_failure;
use crate::typed::{Handler, Target};
use crate::validation::{ContentContract, require_count, require_text};

/// Assemble jobs may be submitted without a language; they then read this one.
pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyDraft {
    pub summary: String,
    pub study_plan: Vec<String>,
}

impl ContentContract for AssemblyDraft {
    fn check(&self) -> Result<(), JobError> {
        require_text("summary", &self.summary, 40)?;
        require_count("studyPlan", self.study_plan.len(), 1, 20)?;
        for (i, step) in self.study_plan.iter().enumerate() {
            require_text(&format!("studyPlan[{i}]"), step, 5)?;
        }
        Ok(())
    }
}

pub struct AssembleHandler;

#[async_trait]
impl Handler for AssembleHandler {
    const JOB_TYPE: JobType = JobType::Assemble;
    type Draft = AssemblyDraft;

    async fn existing_output(
        &self,
        job: &Job,
        content: &dyn ContentStore,
    ) -> Result<Option<Value>, StoreError> {
        let assembly = content.assembly_for(job.entity_id).await?;
        Ok(assembly.map(|a| json!({ "steps": a.study_plan.len() })))
    }

    async fn inputs(
        &self,
        job: &Job,
        _entity: &EntityContext,
        content: &dyn ContentStore,
    ) -> Result<Value, JobError> {
        let language = job.language.as_deref().unwrap_or(DEFAULT_LANGUAGE);
        let missing = |what: &str| {
            JobError::new(
                ErrorCode::DependencyMissing,
                format!("{what} for topic {} ({language}) not found", job.entity_id),
            )
        };

        let notes = content
            .notes_for(job.entity_id, language)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| missing("notes"))?;

        let mut question_counts = serde_json::Map::new();
        for difficulty in Difficulty::ALL {
            if let Some(set) = content
                .question_set(job.entity_id, difficulty, language)
                .await
                .map_err(store_failure)?
            {
                question_counts.insert(difficulty.to_string(), json!(set.questions.len()));
            }
        }
        if question_counts.is_empty() {
            return Err(missing("question sets"));
        }

        Ok(json!({
            "notesTitle": notes.title,
            "keyPoints": notes.key_points,
            "questionSets": question_counts,
        }))
    }

    fn prompt(&self, target: &Target<'_>) -> String {
        format!(
            "Assemble a study guide for \"{breadcrumb}\" from the material below.\n\
             {inputs}\n\
             Respond with JSON only: {{\"summary\": string, \"studyPlan\": [string]}}",
            breadcrumb = target.entity.breadcrumb(),
            inputs = target.inputs,
        )
    }

    fn into_write(
        &self,
        target: &Target<'_>,
        draft: AssemblyDraft,
        _ids: &dyn IdGenerator,
    ) -> Result<ContentWrite, JobError> {
        Ok(ContentWrite::Assembly(Assembly {
            topic_id: target.job.entity_id,
            summary: draft.summary.trim().to_string(),
            study_plan: draft.study_plan,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{SubmitRequest, WorkOutcome};
    use crate::domain::{EntityType, JobStatus, NoteSection, NoteSet, Question, QuestionSet};
    use crate::ports::JobStore;
    use crate::testing::Harness;

    async fn submit(h: &Harness, topic: crate::domain::EntityId) -> crate::domain::JobId {
        h.app
            .submitter()
            .submit(SubmitRequest::new(JobType::Assemble, EntityType::Topic, topic))
            .await
            .unwrap()
            .job_id
    }

    #[test]
    fn short_steps_are_rejected() {
        let draft = AssemblyDraft {
            summary: "A compact guide that ties the notes to each practice question set.".into(),
            study_plan: vec!["Go".into()],
        };
        assert_eq!(draft.check().unwrap_err().code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn assembly_without_notes_is_a_missing_dependency() {
        let h = Harness::new().await;
        let topic = h.seed_topic("Photosynthesis").await;
        let job_id = submit(&h, topic).await;

        let outcome = h.app.worker(0).run_once().await.unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Failed { ref error, .. } if error.code == ErrorCode::DependencyMissing
        ));
        assert_eq!(h.generator.calls(), 0);
        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn assembly_reads_default_language_material() {
        let h = Harness::new().await;
        let topic = h.seed_topic("Photosynthesis").await;
        h.store
            .insert_content(ContentWrite::Notes(NoteSet {
                topic_id: topic,
                language: DEFAULT_LANGUAGE.into(),
                title: "Photosynthesis".into(),
                sections: vec![NoteSection {
                    heading: "Light".into(),
                    body: "Chlorophyll absorbs light.".into(),
                }],
                key_points: vec!["Light drives the reaction".into()],
            }))
            .await;
        h.store
            .insert_content(ContentWrite::Questions(QuestionSet {
                topic_id: topic,
                difficulty: Difficulty::Easy,
                language: DEFAULT_LANGUAGE.into(),
                questions: vec![Question {
                    prompt: "What absorbs light?".into(),
                    options: vec!["Chlorophyll".into(), "Water".into()],
                    answer: 0,
                    explanation: "Chlorophyll is the pigment.".into(),
                }],
            }))
            .await;
        let job_id = submit(&h, topic).await;

        let outcome = h.app.worker(0).run_once().await.unwrap();
        assert_eq!(outcome, WorkOutcome::Completed { job_id, reused: false });
        let assembly = h.store.assembly_for(topic).await.unwrap().unwrap();
        assert!(!assembly.study_plan.is_empty());
    }
}
