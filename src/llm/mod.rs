//! LLM service seams
//!
//! The dispatch core only sees these two traits. `gemini` provides the
//! production implementation, `mock` the scripted ones used in tests and
//! offline runs.

use crate::models::{Message, RouteTarget};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod gemini;
pub mod mock;

pub use gemini::GeminiClient;
pub use mock::{ScriptedGenerator, StaticRouteClassifier};

/// Structured-output classification: history in, one target out
#[async_trait]
pub trait RouteClassifier: Send + Sync {
    /// `options` lists every admissible answer. Implementations must return
    /// one of them or an error.
    async fn classify(
        &self,
        system_instruction: &str,
        history: &[Message],
        options: &[RouteTarget],
    ) -> Result<RouteTarget>;
}

/// Function declaration offered to the generation service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub history: Vec<Message>,
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationResponse {
    Text(String),
    ToolCall { name: String, arguments: Value },
}

/// Free-text or tool-call generation
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse>;
}
