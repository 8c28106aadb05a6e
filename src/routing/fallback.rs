//! LLM-backed fallback classifier
//!
//! Wraps a [`RouteClassifier`] so that every failure mode collapses into a
//! FINISH decision. The caller never sees an error from here.

use crate::llm::RouteClassifier;
use crate::models::{Message, RouteTarget, RoutingDecision, RoutingMethod, WorkerSpec};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const FALLBACK_CONFIDENCE: f64 = 0.95;

pub struct FallbackClassifier {
    service: Arc<dyn RouteClassifier>,
    system_instruction: String,
    options: Vec<RouteTarget>,
    timeout: Duration,
}

impl FallbackClassifier {
    pub fn new(service: Arc<dyn RouteClassifier>, specs: &[WorkerSpec], timeout: Duration) -> Self {
        let mut options: Vec<RouteTarget> = specs.iter().map(|s| RouteTarget::Worker(s.id)).collect();
        options.push(RouteTarget::Finish);

        Self {
            service,
            system_instruction: build_system_instruction(specs),
            options,
            timeout,
        }
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub async fn classify(&self, history: &[Message]) -> RoutingDecision {
        let call = self
            .service
            .classify(&self.system_instruction, history, &self.options);

        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(target)) if self.options.contains(&target) => Ok(target),
            Ok(Ok(target)) => Err(format!("invalid target '{}'", target)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        };

        match outcome {
            Ok(target) => {
                info!(target = %target, "Fallback classifier decided");
                RoutingDecision::new(target, FALLBACK_CONFIDENCE, RoutingMethod::Fallback)
            }
            Err(diagnostic) => {
                warn!(%diagnostic, "Fallback classifier failed, finishing turn");
                RoutingDecision::new(RouteTarget::Finish, FALLBACK_CONFIDENCE, RoutingMethod::Fallback)
                    .with_meta("fallback_error", diagnostic)
            }
        }
    }
}

/// Routing instruction listing every registered worker and the decision rules
pub fn build_system_instruction(specs: &[WorkerSpec]) -> String {
    let mut prompt = String::from(
        "You supervise a team of specialised financial workers. Read the whole \
         conversation and answer with exactly one worker id, or FINISH.\n\nWorkers:\n",
    );

    for spec in specs {
        let tools: Vec<String> = spec
            .tools
            .iter()
            .map(|t| {
                let params: Vec<&str> = t.params.iter().map(|p| p.name.as_str()).collect();
                if params.is_empty() {
                    t.name.clone()
                } else {
                    format!("{}({})", t.name, params.join(", "))
                }
            })
            .collect();

        prompt.push_str(&format!("- {}: {}", spec.id, spec.description));
        if !tools.is_empty() {
            prompt.push_str(&format!(" [tools: {}]", tools.join("; ")));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "\nRules, in order:\n\
         1. If the last worker message completed the task and the user has not asked anything new, answer FINISH.\n\
         2. Theory, definitions and documentation questions go to retrieval-worker.\n\
         3. Requests for usage examples or help go to help-worker.\n\
         4. Never send the conversation to the same worker twice in a row without new user input; answer FINISH instead.\n\
         5. If a worker said the request is outside its speciality, pick the appropriate worker.\n\
         6. If a worker asked for missing data and the user has not supplied it, answer FINISH.\n\
         7. When unsure, answer FINISH.\n",
    );

    prompt
}
