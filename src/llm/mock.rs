//! Scripted LLM services
//!
//! Keep the dispatch core runnable without network access. Both replay a
//! fixed script; once exhausted they repeat the last entry.

use super::{GenerationRequest, GenerationResponse, GenerationService, RouteClassifier};
use crate::error::OrchestrationError;
use crate::models::{Message, RouteTarget};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Route classifier returning scripted answers in order
pub struct StaticRouteClassifier {
    script: Vec<Result<RouteTarget>>,
    cursor: AtomicUsize,
}

impl StaticRouteClassifier {
    pub fn always(target: RouteTarget) -> Self {
        Self::scripted(vec![Ok(target)])
    }

    pub fn failing(reason: &str) -> Self {
        Self::scripted(vec![Err(OrchestrationError::LlmError(reason.to_string()))])
    }

    pub fn scripted(script: Vec<Result<RouteTarget>>) -> Self {
        Self {
            script,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

fn replay<T: Clone>(script: &[Result<T>], index: usize) -> Result<T> {
    let Some(last) = script.len().checked_sub(1) else {
        return Err(OrchestrationError::LlmError("empty script".to_string()));
    };

    match &script[index.min(last)] {
        Ok(value) => Ok(value.clone()),
        Err(e) => Err(OrchestrationError::LlmError(e.to_string())),
    }
}

#[async_trait]
impl RouteClassifier for StaticRouteClassifier {
    async fn classify(
        &self,
        _system_instruction: &str,
        _history: &[Message],
        _options: &[RouteTarget],
    ) -> Result<RouteTarget> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        replay(&self.script, index)
    }
}

/// Generation service replaying scripted responses; records every request
pub struct ScriptedGenerator {
    script: Vec<Result<GenerationResponse>>,
    cursor: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<GenerationResponse>) -> Self {
        Self::with_results(script.into_iter().map(Ok).collect())
    }

    pub fn with_results(script: Vec<Result<GenerationResponse>>) -> Self {
        Self {
            script,
            cursor: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn text(answer: &str) -> Self {
        Self::new(vec![GenerationResponse::Text(answer.to_string())])
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request);
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        replay(&self.script, index)
    }
}
