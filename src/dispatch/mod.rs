//! Dispatch loop
//!
//! AWAITING-DISPATCH → DISPATCHING → EXECUTING-WORKER → AWAITING-DISPATCH | FINISHED
//!
//! One turn per user message. Every worker round is routed through the
//! outcome classifier and the circuit breaker, then checkpointed.

pub mod session;

use crate::breaker::{CircuitBreaker, TripReason};
use crate::config::{AppConfig, DispatchConfig};
use crate::error::OrchestrationError;
use crate::llm::{GeminiClient, GenerationService, RouteClassifier};
use crate::models::{
    Message, MessageRole, OutcomeKind, OutcomeRecord, RouteTarget, RoutingDecision, RoutingMethod,
    WorkerId,
};
use crate::outcome::{MarkerOutcomeClassifier, OutcomeClassifier, BLOCKING_MARKER};
use crate::routing::{FallbackClassifier, FastClassifier, HybridRouter, RoutingPatterns};
use crate::search::{HttpSemanticSearch, SemanticSearch, StaticSearch};
use crate::state::{build_checkpoint_store, CheckpointStore, ConversationState};
use crate::workers::{create_default_registry, WorkerOutput, WorkerRegistry, WorkerRequest};
use crate::Result;
use serde::Serialize;
use session::SessionLocks;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingDispatch,
    Dispatching,
    ExecutingWorker(WorkerId),
    Finished(FinishReason),
}

/// Why a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FinishReason {
    /// A terminal worker answered
    Terminal(WorkerId),
    /// The router chose FINISH
    Finish,
    LoopGuard,
    BreakerOpen(TripReason),
    RoundCeiling,
}

/// Result of one user turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub session_id: Uuid,
    /// Message to show the user
    pub reply: Option<Message>,
    /// Every message appended during the turn, user message included
    pub appended: Vec<Message>,
    pub decisions: Vec<RoutingDecision>,
    pub outcomes: Vec<OutcomeKind>,
    pub rounds: u32,
    pub finish: FinishReason,
    pub trace: Vec<String>,
}

/// Turn-local bookkeeping
struct Turn {
    start: usize,
    rounds: u32,
    first_dispatch: bool,
    technical_fault: bool,
    decisions: Vec<RoutingDecision>,
    outcomes: Vec<OutcomeKind>,
    trace: Vec<String>,
}

pub struct Dispatcher {
    router: HybridRouter,
    registry: Arc<WorkerRegistry>,
    outcome: Arc<dyn OutcomeClassifier>,
    breaker: CircuitBreaker,
    store: Arc<dyn CheckpointStore>,
    locks: SessionLocks,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        router: HybridRouter,
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn CheckpointStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            router,
            registry,
            outcome: Arc::new(MarkerOutcomeClassifier),
            breaker: CircuitBreaker::new(config.breaker),
            store,
            locks: SessionLocks::new(),
            config,
        }
    }

    pub fn with_outcome_classifier(mut self, outcome: Arc<dyn OutcomeClassifier>) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Sessions with a turn in flight or queued
    pub fn active_sessions(&self) -> usize {
        self.locks.len()
    }

    /// Run one user turn to completion.
    ///
    /// Only checkpoint-store failures and cancellation surface as errors.
    /// On cancellation the rounds completed before it stay persisted.
    pub async fn handle_message(
        &self,
        session_id: Uuid,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        let _guard = self.locks.acquire(session_id).await;

        let mut state = self
            .store
            .get(session_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(session_id));

        let start = state.len();
        state.append(Message::user(text));
        state.turn_count += 1;
        self.store.put(&state).await?;

        info!(
            session_id = %session_id,
            turn = state.turn_count,
            "Dispatcher: turn started"
        );

        let mut turn = Turn {
            start,
            rounds: 0,
            first_dispatch: true,
            technical_fault: false,
            decisions: Vec::new(),
            outcomes: Vec::new(),
            trace: vec!["INPUT: user message received".to_string()],
        };

        let finish = self.run_turn(&mut state, &mut turn, &cancel).await?;

        let appended: Vec<Message> = state.messages()[turn.start..].to_vec();
        let reply = appended
            .iter()
            .rev()
            .find(|m| m.is_final_answer() || m.role == MessageRole::System)
            .cloned();

        info!(
            session_id = %session_id,
            rounds = turn.rounds,
            finish = ?finish,
            "Dispatcher: turn finished"
        );

        Ok(TurnReport {
            session_id,
            reply,
            appended,
            decisions: turn.decisions,
            outcomes: turn.outcomes,
            rounds: turn.rounds,
            finish,
            trace: turn.trace,
        })
    }

    async fn run_turn(
        &self,
        state: &mut ConversationState,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<FinishReason> {
        let mut phase = Phase::AwaitingDispatch;

        loop {
            phase = match phase {
                Phase::AwaitingDispatch => {
                    if let Some(reason) = state.breaker.open {
                        warn!(session_id = %state.session_id, %reason, "Circuit open, not dispatching");
                        turn.trace.push(format!("BREAKER: open ({})", reason));
                        state.append(Message::system(reason.diagnostic()));
                        Phase::Finished(FinishReason::BreakerOpen(reason))
                    } else if turn.rounds >= self.config.max_rounds_per_turn {
                        warn!(session_id = %state.session_id, rounds = turn.rounds, "Round ceiling reached");
                        turn.trace.push("CEILING: too many rounds".to_string());
                        state.append(Message::system(format!(
                            "Stopped after {} dispatch rounds without completing the request; \
                             the specialists kept failing or handing the request back. \
                             Please rephrase the question with every required value.",
                            turn.rounds
                        )));
                        Phase::Finished(FinishReason::RoundCeiling)
                    } else {
                        Phase::Dispatching
                    }
                }

                Phase::Dispatching => {
                    let decision = tokio::select! {
                        _ = cancel.cancelled() => {
                            warn!(session_id = %state.session_id, "Turn cancelled while routing");
                            return Err(OrchestrationError::Cancelled);
                        }
                        decision = self.router.route(state.messages()) => decision,
                    };
                    let decision = self.apply_loop_guard(state, decision);

                    if decision.metadata.contains_key("fallback_error") {
                        turn.technical_fault = true;
                    }

                    debug!(
                        session_id = %state.session_id,
                        target = %decision.target,
                        confidence = decision.confidence(),
                        method = ?decision.method,
                        "Routing decision"
                    );
                    turn.trace.push(format!(
                        "ROUTE: {} ({:?}, {:.2})",
                        decision.target,
                        decision.method,
                        decision.confidence()
                    ));

                    state.target = Some(decision.target);
                    let forced = decision.method == RoutingMethod::Forced;
                    let target = decision.target;
                    turn.decisions.push(decision);

                    match target {
                        RouteTarget::Worker(id) if self.registry.get(id).is_some() => {
                            if turn.first_dispatch {
                                if let Some(last) = state.last_dispatched {
                                    if last != id {
                                        self.breaker.on_topic_change(&mut state.breaker);
                                    }
                                }
                                turn.first_dispatch = false;
                            }
                            Phase::ExecutingWorker(id)
                        }
                        RouteTarget::Worker(id) => {
                            warn!(worker = %id, "Routed to unregistered worker, finishing");
                            Phase::Finished(FinishReason::Finish)
                        }
                        _ if forced => Phase::Finished(FinishReason::LoopGuard),
                        _ => Phase::Finished(FinishReason::Finish),
                    }
                }

                Phase::ExecutingWorker(id) => {
                    turn.rounds += 1;
                    state.last_dispatched = Some(id);
                    state.fresh_user_input = false;

                    let record = match self.execute_worker(id, state, cancel).await? {
                        Ok(output) => {
                            let record = self.classify_output(&output);
                            for message in output.messages {
                                state.append(message);
                            }
                            record
                        }
                        Err(reason) => {
                            // synthesized, classified, never appended
                            turn.technical_fault = true;
                            let synthetic =
                                Message::worker(id, format!("{}: {}", BLOCKING_MARKER, reason));
                            self.outcome.classify(&synthetic, Some(OutcomeKind::BlockingError))
                        }
                    };

                    turn.outcomes.push(record.kind);
                    turn.trace.push(format!("OUTCOME: {} -> {}", id, record.kind));
                    self.breaker.record(&mut state.breaker, record.kind);
                    state.touch();
                    self.store.put(state).await?;

                    info!(
                        session_id = %state.session_id,
                        worker = %id,
                        outcome = %record.kind,
                        round = turn.rounds,
                        "Worker round completed"
                    );

                    if self.registry.is_terminal(id) {
                        Phase::Finished(FinishReason::Terminal(id))
                    } else {
                        Phase::AwaitingDispatch
                    }
                }

                Phase::Finished(reason) => {
                    self.explain_silent_turn(state, turn, reason);
                    state.target = None;
                    state.touch();
                    self.store.put(state).await?;
                    return Ok(reason);
                }
            };
        }
    }

    /// Same worker twice without new user input is a loop
    fn apply_loop_guard(&self, state: &ConversationState, decision: RoutingDecision) -> RoutingDecision {
        match decision.target {
            RouteTarget::Worker(id)
                if state.last_dispatched == Some(id) && !state.fresh_user_input =>
            {
                warn!(worker = %id, "Loop guard: same worker without new user input");
                RoutingDecision::forced_finish("loop_guard")
                    .with_meta("repeated_worker", id.to_string())
                    .with_meta("original_method", format!("{:?}", decision.method))
            }
            _ => decision,
        }
    }

    /// Outer `Err` only for cancellation; inner `Err` carries the failure
    /// reason of a worker that errored, panicked or timed out.
    async fn execute_worker(
        &self,
        id: WorkerId,
        state: &ConversationState,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<WorkerOutput, String>> {
        let Some(worker) = self.registry.get(id) else {
            return Ok(Err(format!("worker {} is not registered", id)));
        };

        let request = WorkerRequest {
            session_id: state.session_id,
            history: state.messages().to_vec(),
            cancel: cancel.child_token(),
        };

        let worker_cancel = request.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = worker_cancel.cancelled() => Err(OrchestrationError::Cancelled),
                result = worker.execute(request) => result,
            }
        });
        // also fires when the whole turn future is dropped
        let _abort = AbortOnDrop(handle.abort_handle());

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(worker = %id, "Turn cancelled during worker execution");
                Err(OrchestrationError::Cancelled)
            }
            joined = tokio::time::timeout(self.config.worker_timeout, handle) => {
                let outcome = match joined {
                    Ok(Ok(Ok(output))) => Ok(output),
                    Ok(Ok(Err(e))) => {
                        error!(worker = %id, error = %e, "Worker failed");
                        Err(format!("worker {} failed: {}", id, e))
                    }
                    Ok(Err(join_error)) => {
                        error!(worker = %id, panicked = join_error.is_panic(), "Worker task aborted");
                        Err(format!("worker {} crashed", id))
                    }
                    Err(_) => {
                        error!(worker = %id, timeout = ?self.config.worker_timeout, "Worker timed out");
                        Err(format!(
                            "worker {} timed out after {}s",
                            id,
                            self.config.worker_timeout.as_secs_f32()
                        ))
                    }
                };
                Ok(outcome)
            }
        }
    }

    fn classify_output(&self, output: &WorkerOutput) -> OutcomeRecord {
        match output.final_answer().or_else(|| output.messages.last()) {
            Some(message) => self.outcome.classify(message, output.signal),
            None => OutcomeRecord::new(output.signal.unwrap_or(OutcomeKind::Unknown), ""),
        }
    }

    /// A turn that produced nothing for the user still has to say why
    fn explain_silent_turn(&self, state: &mut ConversationState, turn: &Turn, reason: FinishReason) {
        let answered = state.messages()[turn.start..]
            .iter()
            .any(|m| m.is_final_answer() || m.role == MessageRole::System);
        if answered {
            return;
        }

        let text = if turn.technical_fault {
            "The request could not be completed because of a technical fault. \
             Please try again in a moment."
                .to_string()
        } else if reason == FinishReason::LoopGuard {
            "The request was handed back without progress, so processing stopped. \
             Please add the missing details or rephrase the question."
                .to_string()
        } else {
            "I have nothing to answer for this message. Ask for help to see example questions."
                .to_string()
        };

        state.append(Message::system(text));
    }

    /// Delete the session checkpoint, closing an open breaker
    pub async fn reset_session(&self, session_id: Uuid) -> Result<bool> {
        let _guard = self.locks.acquire(session_id).await;
        let existed = self.store.delete(session_id).await?;
        info!(session_id = %session_id, existed, "Session reset");
        Ok(existed)
    }

    pub async fn session_state(&self, session_id: Uuid) -> Result<Option<ConversationState>> {
        self.store.get(session_id).await
    }
}

/// Aborts the worker task once the round is over or abandoned
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Wire the production collaborators from configuration
pub fn build_dispatcher(config: &AppConfig) -> Result<Dispatcher> {
    let gemini = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone().unwrap_or_default(),
        config.gemini_model.clone(),
    )?);
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY not set: fallback routing will finish turns and calculations will fail");
    }

    let search: Arc<dyn SemanticSearch> = match &config.semantic_search_url {
        Some(url) => Arc::new(HttpSemanticSearch::new(url)?),
        None => {
            warn!("SEMANTIC_SEARCH_URL not set: retrieval answers with the unavailable fallback");
            Arc::new(StaticSearch::unavailable())
        }
    };

    let generation: Arc<dyn GenerationService> = gemini.clone();
    let classifier: Arc<dyn RouteClassifier> = gemini;

    let registry = Arc::new(create_default_registry(generation, search));
    let patterns = Arc::new(RoutingPatterns::load(config.routing_patterns_path.as_deref()).compile());

    let router = HybridRouter::new(
        FastClassifier::new(patterns),
        FallbackClassifier::new(classifier, &registry.specs(), config.dispatch.classifier_timeout),
        config.dispatch.confidence_threshold,
    );

    let store = build_checkpoint_store(config.database_url.as_deref());

    Ok(Dispatcher::new(router, registry, store, config.dispatch.clone()))
}

#[cfg(test)]
mod tests;
