//! topics: CHAPTER → topics.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{ContentWrite, Job, JobError, JobType, OutlineItem, Topic};
use crate::ports::{ContentStore, IdGenerator, StoreError};
use crate::typed::{Handler, Target};
use crate::validation::{ContentContract, require_count};

use super::syllabus::check_outline;

const MAX_TOPICS: usize = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsDraft {
    pub topics: Vec<OutlineItem>,
}

impl ContentContract for TopicsDraft {
    fn check(&self) -> Result<(), JobError> {
        require_count("topics", self.topics.len(), 1, MAX_TOPICS)?;
        check_outline("topics", &self.topics)
    }
}

pub struct TopicsHandler;

#[async_trait]
impl Handler for TopicsHandler {
    const JOB_TYPE: JobType = JobType::Topics;
    type Draft = TopicsDraft;

    async fn existing_output(
        &self,
        job: &Job,
        content: &dyn ContentStore,
    ) -> Result<Option<Value>, StoreError> {
        let topics = content.topics_of(job.entity_id).await?;
        Ok((!topics.is_empty()).then(|| json!({ "topics": topics.len() })))
    }

    fn prompt(&self, target: &Target<'_>) -> String {
        format!(
            "Break the chapter \"{breadcrumb}\" into teachable topics.\n\
             Chapter summary: {summary}\n\
             Write between 2 and 8 topics in {language}; each topic must fit one study session.\n\
             Respond with JSON only: {{\"topics\": [{{\"title\": string, \"summary\": string}}]}}",
            breadcrumb = target.entity.breadcrumb(),
            summary = target.entity.summary.as_deref().unwrap_or_default(),
            language = target.job.language.as_deref().unwrap_or("the subject's language"),
        )
    }

    fn into_write(
        &self,
        target: &Target<'_>,
        draft: TopicsDraft,
        ids: &dyn IdGenerator,
    ) -> Result<ContentWrite, JobError> {
        let chapter_id = target.job.entity_id;
        let topics = draft
            .topics
            .into_iter()
            .enumerate()
            .map(|(i, item)| Topic {
                id: ids.entity_id(),
                chapter_id,
                position: i as u32 + 1,
                title: item.title.trim().to_string(),
                summary: item.summary.trim().to_string(),
            })
            .collect();
        Ok(ContentWrite::Topics { chapter_id, topics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorCode;

    #[test]
    fn too_many_topics_fail() {
        let topics = (0..=MAX_TOPICS)
            .map(|i| OutlineItem {
                title: format!("Topic number {i}"),
                summary: format!("A focused look at idea number {i} in this chapter."),
            })
            .collect();
        let draft = TopicsDraft { topics };
        assert_eq!(draft.check().unwrap_err().code, ErrorCode::ValidationFailed);
    }
}
