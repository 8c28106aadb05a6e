//! Formula-backed calculation workers
//!
//! The LLM only chooses the tool and extracts its arguments. Validation and
//! arithmetic happen here, deterministically.

use super::{Worker, WorkerOutput, WorkerRequest};
use crate::error::OrchestrationError;
use crate::finance::FinanceTool;
use crate::llm::{GenerationRequest, GenerationResponse, GenerationService};
use crate::models::{Message, OutcomeKind, WorkerId, WorkerSpec};
use crate::outcome::{MISMATCH_MARKER, MISSING_INPUT_MARKER, SUCCESS_MARKER};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CalculationWorker {
    spec: WorkerSpec,
    tools: Vec<FinanceTool>,
    generation: Arc<dyn GenerationService>,
}

impl CalculationWorker {
    pub fn new(
        id: WorkerId,
        description: &str,
        tools: Vec<FinanceTool>,
        generation: Arc<dyn GenerationService>,
    ) -> Self {
        let spec = WorkerSpec {
            id,
            description: description.to_string(),
            tools: tools.iter().map(FinanceTool::spec).collect(),
            terminal: false,
        };

        Self {
            spec,
            tools,
            generation,
        }
    }

    fn id(&self) -> WorkerId {
        self.spec.id
    }

    fn system_instruction(&self) -> String {
        let tools: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
        format!(
            "You are the {id} ({desc}). Your only tools are: {tools}.\n\
             - Call exactly one tool, copying every value the user gave. Rates go in percent (6 for 6%).\n\
             - Never invent values. If a required value is missing, reply \"{missing}: \" followed by the missing fields.\n\
             - If the request needs a tool you do not have, reply \"{mismatch}\".\n\
             - After reporting a result, end with \"{done}\".",
            id = self.spec.id,
            desc = self.spec.description,
            tools = tools.join(", "),
            missing = MISSING_INPUT_MARKER,
            mismatch = MISMATCH_MARKER,
            done = SUCCESS_MARKER,
        )
    }

    fn run_tool(&self, name: &str, arguments: Value) -> Result<WorkerOutput> {
        let id = self.id();
        let call = Message::tool_call(id, name, arguments.clone());

        let Some(tool) = FinanceTool::from_name(name).filter(|t| self.tools.contains(t)) else {
            warn!(worker = %id, tool = name, "Tool not available to this worker");
            return Ok(WorkerOutput {
                messages: vec![
                    call,
                    Message::worker(
                        id,
                        format!("{}: the tool '{}' is not available to {}.", MISMATCH_MARKER, name, id),
                    ),
                ],
                signal: Some(OutcomeKind::CapabilityMismatch),
            });
        };

        let missing = tool.missing_params(&arguments);
        if !missing.is_empty() {
            info!(worker = %id, tool = name, ?missing, "Required arguments missing");
            return Ok(WorkerOutput {
                messages: vec![call, Message::worker(id, missing_text(&missing))],
                signal: Some(OutcomeKind::MissingInput),
            });
        }

        match tool.evaluate(&arguments) {
            Ok(value) => {
                info!(worker = %id, tool = name, value, "Calculation completed");
                Ok(WorkerOutput {
                    messages: vec![
                        call,
                        Message::tool_result(id, name, json!(value)),
                        Message::worker(id, format!("{}. {}", tool.format_result(value), SUCCESS_MARKER)),
                    ],
                    signal: Some(OutcomeKind::Success),
                })
            }
            Err(OrchestrationError::InvalidToolInput(reason)) => {
                info!(worker = %id, tool = name, %reason, "Arguments rejected");
                Ok(WorkerOutput {
                    messages: vec![
                        call,
                        Message::worker(
                            id,
                            format!("{}: invalid input, {}. Please provide a corrected value.", MISSING_INPUT_MARKER, reason),
                        ),
                    ],
                    signal: Some(OutcomeKind::MissingInput),
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn missing_text(missing: &[String]) -> String {
    format!(
        "{}: missing {}. Please provide these values to run the calculation.",
        MISSING_INPUT_MARKER,
        missing.join(", ")
    )
}

#[async_trait::async_trait]
impl Worker for CalculationWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        debug!(
            session_id = %request.session_id,
            worker = %self.id(),
            history = request.history.len(),
            "Calculation worker started"
        );
        let cancel = request.cancel.clone();

        let generation = GenerationRequest {
            system_instruction: self.system_instruction(),
            history: request.history,
            tools: self.tools.iter().map(FinanceTool::declaration).collect(),
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled),
            response = self.generation.generate(generation) => response?,
        };

        match response {
            GenerationResponse::ToolCall { name, arguments } => self.run_tool(&name, arguments),
            // free text is classified from its markers
            GenerationResponse::Text(text) => Ok(WorkerOutput {
                messages: vec![Message::worker(self.id(), text)],
                signal: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use crate::models::MessagePayload;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn worker(response: GenerationResponse) -> (CalculationWorker, Arc<ScriptedGenerator>) {
        let generator = Arc::new(ScriptedGenerator::new(vec![response]));
        let worker = CalculationWorker::new(
            WorkerId::CorporateFinance,
            "Corporate finance",
            vec![FinanceTool::NetPresentValue, FinanceTool::Wacc],
            generator.clone(),
        );
        (worker, generator)
    }

    fn request(text: &str) -> WorkerRequest {
        WorkerRequest {
            session_id: Uuid::new_v4(),
            history: vec![Message::user(text)],
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_tool_call() {
        let (worker, generator) = worker(GenerationResponse::ToolCall {
            name: "npv".to_string(),
            arguments: json!({
                "discount_rate": 10,
                "initial_investment": 100000,
                "cash_flows": [30000, 40000, 50000]
            }),
        });

        let output = worker.execute(request("Calcula el VAN")).await.unwrap();

        assert_eq!(output.signal, Some(OutcomeKind::Success));
        assert_eq!(output.messages.len(), 3);
        assert!(matches!(output.messages[0].payload, Some(MessagePayload::ToolCall { .. })));
        let answer = output.final_answer().unwrap();
        assert!(answer.content.contains("-2103.68"));
        assert!(answer.content.ends_with(SUCCESS_MARKER));

        let sent = generator.requests();
        assert_eq!(sent[0].tools.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_arguments_named() {
        let (worker, _) = worker(GenerationResponse::ToolCall {
            name: "npv".to_string(),
            arguments: json!({ "initial_investment": 100000, "cash_flows": [1, 2] }),
        });

        let output = worker.execute(request("VAN de 100000")).await.unwrap();

        assert_eq!(output.signal, Some(OutcomeKind::MissingInput));
        let answer = output.final_answer().unwrap();
        assert!(answer.content.starts_with("Faltan_datos: missing discount_rate"));
    }

    #[tokio::test]
    async fn test_contract_violation_asks_for_correction() {
        let (worker, _) = worker(GenerationResponse::ToolCall {
            name: "wacc".to_string(),
            arguments: json!({
                "tax_rate": 30, "cost_of_debt": 8, "cost_of_equity": 12,
                "debt_value": -5, "equity_value": 600
            }),
        });

        let output = worker.execute(request("WACC")).await.unwrap();
        assert_eq!(output.signal, Some(OutcomeKind::MissingInput));
        assert!(output.final_answer().unwrap().content.contains("debt_value"));
    }

    #[tokio::test]
    async fn test_foreign_tool_is_a_mismatch() {
        let (worker, _) = worker(GenerationResponse::ToolCall {
            name: "black_scholes_call".to_string(),
            arguments: json!({}),
        });

        let output = worker.execute(request("precio de la call")).await.unwrap();
        assert_eq!(output.signal, Some(OutcomeKind::CapabilityMismatch));
    }

    #[tokio::test]
    async fn test_text_answer_has_no_signal() {
        let (worker, _) = worker(GenerationResponse::Text(
            "Faltan_datos: missing rate".to_string(),
        ));

        let output = worker.execute(request("Calcula el VAN")).await.unwrap();
        assert_eq!(output.signal, None);
        assert_eq!(output.messages[0].content, "Faltan_datos: missing rate");
    }

    #[tokio::test]
    async fn test_generation_error_propagates() {
        let generator = Arc::new(ScriptedGenerator::with_results(vec![Err(
            OrchestrationError::LlmError("503".to_string()),
        )]));
        let worker = CalculationWorker::new(
            WorkerId::Equity,
            "Equity",
            vec![FinanceTool::GordonGrowth],
            generator,
        );

        assert!(worker.execute(request("Gordon")).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_request_skips_generation() {
        let (worker, generator) = worker(GenerationResponse::Text("late".to_string()));
        let req = request("Calcula el VAN");
        req.cancel.cancel();

        let result = worker.execute(req).await;

        assert!(matches!(result, Err(OrchestrationError::Cancelled)));
        assert!(generator.requests().is_empty());
    }
}
