//! Per-type generation handlers.
//!
//! Each handler owns its draft shape, content contract, prompt and the
//! records it commits. The generic pipeline lives in `typed::TypedHandler`.

pub mod assemble;
pub mod notes;
pub mod questions;
pub mod syllabus;
pub mod topics;

pub use self::assemble::AssembleHandler;
pub use self::notes::NotesHandler;
pub use self::questions::QuestionsHandler;
pub use self::syllabus::SyllabusHandler;
pub use self::topics::TopicsHandler;
