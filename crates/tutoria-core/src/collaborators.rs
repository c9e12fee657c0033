use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dialogue::BlockReference;
use crate::errors::{GenerationError, TutorError};
use crate::record::SessionRecord;

/// Answer produced by the tutor for the newest user entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorAnswer {
    pub response: String,
    #[serde(default)]
    pub block_id: Option<String>,
    #[serde(default)]
    pub block_name: Option<String>,
    #[serde(default)]
    pub progress: Option<u32>,
}

impl TutorAnswer {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Default::default()
        }
    }

    pub fn block(&self) -> BlockReference {
        BlockReference {
            block_id: self.block_id.clone(),
            block_name: self.block_name.clone(),
        }
    }
}

/// The AI tutor. Receives the full session snapshot it should answer for.
#[async_trait]
pub trait Tutor: Send + Sync {
    async fn invoke(&self, snapshot: &SessionRecord) -> Result<TutorAnswer, TutorError>;
}

/// Turns a visual workspace into program source. An empty string is a valid result.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        workspace: &serde_json::Value,
        language: &str,
    ) -> Result<String, GenerationError>;
}
