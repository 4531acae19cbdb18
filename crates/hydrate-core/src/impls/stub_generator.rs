//! StubGenerator - 決定的な生成バックエンド（CLI デモ・テスト用）
//!
//! prompt meta の `jobType` を見て、その型の content contract を満たす JSON を
//! markdown fence 付きで返します。job type ごとに応答を差し替えられるので、
//! placeholder・timeout・transport 失敗の再現にも使います。

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::domain::JobType;
use crate::ports::{Generation, GenerationError, Generator, Usage};

/// Scripted reply for one job type.
#[derive(Debug, Clone)]
pub enum StubReply {
    Text(String),
    Fail(GenerationError),
    /// Sleep before answering normally; used to trip the caller's timeout.
    Delay(Duration),
}

pub struct StubGenerator {
    default_chapters: usize,
    topics_per_chapter: usize,
    overrides: Mutex<HashMap<JobType, StubReply>>,
    calls: AtomicUsize,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self {
            default_chapters: 3,
            topics_per_chapter: 3,
            overrides: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_topics_per_chapter(mut self, n: usize) -> Self {
        self.topics_per_chapter = n;
        self
    }

    pub fn with_default_chapters(mut self, n: usize) -> Self {
        self.default_chapters = n;
        self
    }

    pub fn set_reply(&self, job_type: JobType, reply: StubReply) {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_type, reply);
    }

    pub fn clear_reply(&self, job_type: JobType) {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_type);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply_for(&self, job_type: JobType) -> Option<StubReply> {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_type)
            .cloned()
    }

    fn body(&self, job_type: JobType, meta: &Value) -> Value {
        let name = meta["entityName"].as_str().unwrap_or("this subject");
        match job_type {
            JobType::Syllabus => {
                let count = meta["inputs"]["targetChapters"]
                    .as_u64()
                    .map(|n| n as usize)
                    .unwrap_or(self.default_chapters);
                json!({ "chapters": outline(name, "Chapter", count) })
            }
            JobType::Topics => json!({ "topics": outline(name, "Topic", self.topics_per_chapter) }),
            JobType::Notes => json!({
                "title": format!("Study notes: {name}"),
                "sections": [
                    {
                        "heading": "Key ideas",
                        "body": format!("{name} is introduced through its core definitions, the vocabulary used to describe it and a worked example."),
                    },
                    {
                        "heading": "Common mistakes",
                        "body": format!("Learners often confuse {name} with neighbouring ideas; comparing two short cases side by side makes the difference clear."),
                    },
                ],
                "keyPoints": [
                    format!("Define {name} in one sentence"),
                    format!("Apply {name} to a familiar example"),
                ],
            }),
            JobType::Questions => {
                let difficulty = meta["difficulty"].as_str().unwrap_or("medium");
                let questions: Vec<Value> = (1..=3)
                    .map(|i| {
                        json!({
                            "prompt": format!("({difficulty}) Question {i}: which statement about {name} is accurate?"),
                            "options": [
                                format!("{name} statement A{i}"),
                                format!("{name} statement B{i}"),
                                format!("{name} statement C{i}"),
                                format!("{name} statement D{i}"),
                            ],
                            "answer": (i - 1) % 4,
                            "explanation": format!("Statement {i} matches the definition given in the notes on {name}."),
                        })
                    })
                    .collect();
                json!({ "questions": questions })
            }
            JobType::Assemble => json!({
                "summary": format!("A compact study guide for {name} that links the notes to the practice questions at every difficulty."),
                "studyPlan": [
                    "Read the key ideas section twice",
                    "Answer the easy questions without notes",
                    "Review mistakes, then attempt the hard set",
                ],
            }),
        }
    }
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn outline(parent: &str, kind: &str, count: usize) -> Vec<Value> {
    (1..=count)
        .map(|i| {
            json!({
                "title": format!("{parent}: {kind} {i}"),
                "summary": format!("{kind} {i} of {parent}, covering its main concepts with worked examples."),
            })
        })
        .collect()
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(
        &self,
        prompt: &str,
        meta: &Value,
        _timeout: Duration,
    ) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let job_type: JobType = meta["jobType"]
            .as_str()
            .unwrap_or_default()
            .parse()
            .map_err(|e| GenerationError::Backend(format!("stub cannot answer: {e}")))?;

        match self.reply_for(job_type) {
            Some(StubReply::Text(text)) => return Ok(generation(prompt, text)),
            Some(StubReply::Fail(err)) => return Err(err),
            Some(StubReply::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let body = self.body(job_type, meta);
        let text = format!("Here is the requested content.\n```json\n{body:#}\n```\n");
        Ok(generation(prompt, text))
    }
}

fn generation(prompt: &str, content: String) -> Generation {
    Generation {
        usage: Some(Usage {
            input_tokens: (prompt.len() / 4) as u32,
            output_tokens: (content.len() / 4) as u32,
        }),
        cost_usd: Some(0.0),
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::extract_json;

    #[tokio::test]
    async fn syllabus_honours_the_target_chapter_count() {
        let stub = StubGenerator::new();
        let meta = json!({ "jobType": "syllabus", "entityName": "Biology", "inputs": { "targetChapters": 5 } });
        let out = stub.generate("p", &meta, Duration::from_secs(1)).await.unwrap();
        let body: Value = serde_json::from_str(extract_json(&out.content)).unwrap();
        assert_eq!(body["chapters"].as_array().unwrap().len(), 5);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_returned() {
        let stub = StubGenerator::new();
        stub.set_reply(JobType::Notes, StubReply::Fail(GenerationError::Transport("reset".into())));
        let meta = json!({ "jobType": "notes" });
        let err = stub.generate("p", &meta, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, GenerationError::Transport("reset".into()));
    }
}
