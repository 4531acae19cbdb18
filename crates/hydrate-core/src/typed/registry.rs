//! TypedRegistry - Handler の登録と管理
//!
//! - `HashMap<JobType, Arc<dyn DynHandler>>` で型消去された handler を保持
//! - job type は閉じた enum なので、「全種類そろっているか」を起動時に検査できる

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::JobType;

use super::handler::{DynHandler, Handler, TypedHandler};

/// TypedRegistry は型付き Handler を登録・管理
///
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register(NotesHandler)?;
/// let handler = registry.get(JobType::Notes);
/// ```
#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<JobType, Arc<dyn DynHandler>>,
}

/// RegistryError は TypedRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for job type '{0}' is already registered")]
    AlreadyRegistered(JobType),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(&mut self, handler: H) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&H::JOB_TYPE) {
            return Err(RegistryError::AlreadyRegistered(H::JOB_TYPE));
        }
        self.handlers
            .insert(H::JOB_TYPE, Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    /// Job types with no handler, in declaration order.
    pub fn missing_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect()
    }
}
