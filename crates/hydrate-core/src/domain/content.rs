//! Curriculum content records.
//!
//! These are the domain outputs handlers persist. The schema itself belongs
//! to the content service; the engine only needs enough shape to write
//! records, check for existing output and enumerate children for fan-out.

use serde::{Deserialize, Serialize};

use super::ids::EntityId;
use super::job::{Difficulty, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Planned chapter count, if the subject was created with one.
    #[serde(default)]
    pub target_chapters: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: EntityId,
    pub subject_id: EntityId,
    pub position: u32,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: EntityId,
    pub chapter_id: EntityId,
    pub position: u32,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSection {
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSet {
    pub topic_id: EntityId,
    pub language: String,
    pub title: String,
    pub sections: Vec<NoteSection>,
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub prompt: String,
    pub options: Vec<String>,
    /// Index into `options`.
    pub answer: usize,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSet {
    pub topic_id: EntityId,
    pub difficulty: Difficulty,
    pub language: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assembly {
    pub topic_id: EntityId,
    pub summary: String,
    pub study_plan: Vec<String>,
}

/// Generated chapter or topic outline entry, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineItem {
    pub title: String,
    pub summary: String,
}

/// Records a handler commits together with its job completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentWrite {
    Chapters {
        subject_id: EntityId,
        chapters: Vec<Chapter>,
    },
    Topics {
        chapter_id: EntityId,
        topics: Vec<Topic>,
    },
    Notes(NoteSet),
    Questions(QuestionSet),
    Assembly(Assembly),
}

impl ContentWrite {
    /// Number of domain records this write creates.
    pub fn record_count(&self) -> usize {
        match self {
            ContentWrite::Chapters { chapters, .. } => chapters.len(),
            ContentWrite::Topics { topics, .. } => topics.len(),
            ContentWrite::Notes(_) | ContentWrite::Questions(_) | ContentWrite::Assembly(_) => 1,
        }
    }
}

/// One step of an entity's ancestry, nearest parent last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ancestor {
    pub entity_type: EntityType,
    pub id: EntityId,
    pub name: String,
}

/// Read-only context about a target entity: its name and its ancestry.
///
/// Used as generation context by handlers and denormalized into audit and
/// outbox meta by the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    pub entity_type: EntityType,
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub ancestry: Vec<Ancestor>,
}

impl EntityContext {
    /// "Subject > Chapter > Topic" breadcrumb.
    pub fn breadcrumb(&self) -> String {
        self.ancestry
            .iter()
            .map(|a| a.name.as_str())
            .chain(std::iter::once(self.name.as_str()))
            .collect::<Vec<_>>()
            .join(" > ")
    }

    pub fn subject_id(&self) -> EntityId {
        self.ancestry
            .iter()
            .find(|a| a.entity_type == EntityType::Subject)
            .map(|a| a.id)
            .unwrap_or(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadcrumb_walks_ancestry_then_self() {
        let subject = EntityId::generate();
        let ctx = EntityContext {
            entity_type: EntityType::Topic,
            id: EntityId::generate(),
            name: "Photosynthesis".into(),
            summary: None,
            ancestry: vec![
                Ancestor {
                    entity_type: EntityType::Subject,
                    id: subject,
                    name: "Biology".into(),
                },
                Ancestor {
                    entity_type: EntityType::Chapter,
                    id: EntityId::generate(),
                    name: "Plants".into(),
                },
            ],
        };
        assert_eq!(ctx.breadcrumb(), "Biology > Plants > Photosynthesis");
        assert_eq!(ctx.subject_id(), subject);
    }
}
