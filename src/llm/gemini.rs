//! Gemini REST client
//!
//! One long-lived reqwest::Client for connection pooling. Implements both
//! LLM seams: classification uses an enum response schema, generation
//! offers the worker's formulas as function declarations.

use super::{
    GenerationRequest, GenerationResponse, GenerationService, RouteClassifier, ToolDeclaration,
};
use crate::error::OrchestrationError;
use crate::models::{Message, MessagePayload, MessageRole, RouteTarget};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    async fn call(&self, request: &GeminiRequest) -> Result<GeminiResponse> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            BASE_URL,
            self.model,
            self.api_key
        );

        debug!(model = %self.model, turns = request.contents.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(OrchestrationError::LlmError(format!(
                "Gemini API error ({}): {}",
                status, error_text
            )));
        }

        response.json::<GeminiResponse>().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::LlmError(format!("Gemini parse error: {}", e))
        })
    }
}

#[async_trait]
impl RouteClassifier for GeminiClient {
    async fn classify(
        &self,
        system_instruction: &str,
        history: &[Message],
        options: &[RouteTarget],
    ) -> Result<RouteTarget> {
        let allowed: Vec<String> = options.iter().map(|t| t.to_string()).collect();

        let request = GeminiRequest {
            contents: to_contents(history),
            system_instruction: Some(SystemInstruction::text(system_instruction)),
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 32,
                response_mime_type: Some("text/x.enum".to_string()),
                response_schema: Some(json!({ "type": "STRING", "enum": allowed })),
            },
            tools: None,
        };

        let response = self.call(&request).await?;
        let answer = first_text(&response).ok_or_else(|| {
            OrchestrationError::ClassificationError("empty classification response".to_string())
        })?;

        let target: RouteTarget = answer.parse()?;
        if !options.contains(&target) {
            return Err(OrchestrationError::ClassificationError(format!(
                "target '{}' not among offered options",
                target
            )));
        }

        info!(target = %target, "Gemini classification received");
        Ok(target)
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![ToolGroup {
                function_declarations: request.tools.iter().map(FunctionDeclaration::from).collect(),
            }])
        };

        let body = GeminiRequest {
            contents: to_contents(&request.history),
            system_instruction: Some(SystemInstruction::text(&request.system_instruction)),
            generation_config: GenerationConfig {
                temperature: 0.1,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
                response_mime_type: None,
                response_schema: None,
            },
            tools,
        };

        let response = self.call(&body).await?;

        let parts = response
            .candidates
            .first()
            .map(|c| c.content.parts.as_slice())
            .unwrap_or_default();

        if let Some(call) = parts.iter().find_map(|p| p.function_call.as_ref()) {
            info!(tool = %call.name, "Gemini requested a tool call");
            return Ok(GenerationResponse::ToolCall {
                name: call.name.clone(),
                arguments: call.args.clone(),
            });
        }

        first_text(&response)
            .map(GenerationResponse::Text)
            .ok_or_else(|| OrchestrationError::LlmError("Empty response from Gemini".to_string()))
    }
}

fn first_text(response: &GeminiResponse) -> Option<String> {
    let text: String = response
        .candidates
        .first()?
        .content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();

    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Map conversation history onto Gemini turns
fn to_contents(history: &[Message]) -> Vec<Content> {
    history
        .iter()
        .map(|msg| match (&msg.role, &msg.payload) {
            (_, Some(MessagePayload::ToolCall { tool, arguments })) => Content {
                role: Some("model".to_string()),
                parts: vec![Part::function_call(tool, arguments.clone())],
            },
            (_, Some(MessagePayload::ToolResult { tool, output })) => Content {
                role: Some("user".to_string()),
                parts: vec![Part::function_response(tool, output.clone())],
            },
            (MessageRole::User, None) => Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(&msg.content)],
            },
            (MessageRole::Worker, None) => Content {
                role: Some("model".to_string()),
                parts: vec![Part::text(&msg.content)],
            },
            (MessageRole::System, None) => Content {
                role: Some("model".to_string()),
                parts: vec![Part::text(&format!("[system] {}", msg.content))],
            },
        })
        .collect()
}

// ===== Wire types =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolGroup>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn function_call(name: &str, args: Value) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: name.to_string(),
                args,
            }),
            ..Default::default()
        }
    }

    fn function_response(name: &str, output: Value) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                name: name.to_string(),
                response: json!({ "result": output }),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

impl SystemInstruction {
    fn text(text: &str) -> Self {
        Self {
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDeclaration> for FunctionDeclaration {
    fn from(tool: &ToolDeclaration) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}
