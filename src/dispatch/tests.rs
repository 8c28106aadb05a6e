use super::*;
use crate::breaker::TripReason;
use crate::llm::{GenerationResponse, ScriptedGenerator, StaticRouteClassifier};
use crate::models::{WorkerSpec, MessagePayload};
use crate::outcome::{MISSING_INPUT_MARKER, SUCCESS_MARKER};
use crate::routing::CompiledPatterns;
use crate::search::{SearchHit, StaticSearch};
use crate::state::InMemoryCheckpointStore;
use crate::workers::Worker;
use serde_json::{json, Map};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Clone)]
enum Behaviour {
    Reply(&'static str, Option<OutcomeKind>),
    Fail,
    Panic,
    Hang,
    /// Sleeps, then counts a completed call
    Slow(Duration, Arc<AtomicUsize>),
}

struct TestWorker {
    spec: WorkerSpec,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

impl TestWorker {
    fn new(id: WorkerId, behaviour: Behaviour) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = Self {
            spec: WorkerSpec {
                id,
                description: format!("test worker {}", id),
                tools: Vec::new(),
                terminal: false,
            },
            behaviour,
            calls: calls.clone(),
        };
        (worker, calls)
    }
}

#[async_trait::async_trait]
impl Worker for TestWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn execute(&self, _request: WorkerRequest) -> Result<WorkerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Reply(text, signal) => Ok(WorkerOutput {
                messages: vec![Message::worker(self.spec.id, *text)],
                signal: *signal,
            }),
            Behaviour::Fail => Err(OrchestrationError::ToolError("division by zero".to_string())),
            Behaviour::Panic => panic!("worker exploded"),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(WorkerOutput::default())
            }
            Behaviour::Slow(delay, completed) => {
                tokio::time::sleep(*delay).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(WorkerOutput {
                    messages: vec![Message::worker(self.spec.id, "done late")],
                    signal: None,
                })
            }
        }
    }
}

fn dispatcher_with(
    registry: WorkerRegistry,
    classifier: Arc<StaticRouteClassifier>,
    config: DispatchConfig,
) -> Dispatcher {
    let registry = Arc::new(registry);
    let router = HybridRouter::new(
        FastClassifier::new(Arc::new(CompiledPatterns::default())),
        FallbackClassifier::new(classifier, &registry.specs(), config.classifier_timeout),
        config.confidence_threshold,
    );
    Dispatcher::new(router, registry, Arc::new(InMemoryCheckpointStore::new()), config)
}

fn single_worker(
    worker: TestWorker,
    classifier: Arc<StaticRouteClassifier>,
    config: DispatchConfig,
) -> Dispatcher {
    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(worker));
    dispatcher_with(registry, classifier, config)
}

fn finish_classifier() -> Arc<StaticRouteClassifier> {
    Arc::new(StaticRouteClassifier::always(RouteTarget::Finish))
}

async fn send(dispatcher: &Dispatcher, session: Uuid, text: &str) -> TurnReport {
    dispatcher
        .handle_message(session, text, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_calculation_request_completes_in_one_round() {
    let generator = Arc::new(ScriptedGenerator::new(vec![GenerationResponse::ToolCall {
        name: "npv".to_string(),
        arguments: json!({
            "discount_rate": 10,
            "initial_investment": 100000,
            "cash_flows": [30000, 40000, 50000]
        }),
    }]));
    let classifier = finish_classifier();
    let registry = create_default_registry(generator, Arc::new(StaticSearch::empty()));
    let dispatcher = dispatcher_with(registry, classifier.clone(), DispatchConfig::default());

    let session = Uuid::new_v4();
    let report = send(
        &dispatcher,
        session,
        "Calculate VAN: initial investment 100000, flows [30000,40000,50000], rate 10%",
    )
    .await;

    assert_eq!(report.rounds, 1);
    assert_eq!(report.outcomes, vec![OutcomeKind::Success]);
    assert_eq!(report.finish, FinishReason::Finish);

    let first = &report.decisions[0];
    assert_eq!(first.target, RouteTarget::Worker(WorkerId::CorporateFinance));
    assert_eq!(first.method, RoutingMethod::Fast);
    assert_eq!(first.metadata["fast_bypass"], json!(true));

    let reply = report.reply.unwrap();
    assert!(reply.content.contains("-2103.68"));
    assert!(reply.content.ends_with(SUCCESS_MARKER));

    // user + tool call + tool result + answer
    assert_eq!(report.appended.len(), 4);
    assert!(matches!(
        report.appended[1].payload,
        Some(MessagePayload::ToolCall { .. })
    ));

    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert!(state.breaker.is_zero());
    assert_eq!(state.target, None);
    assert_eq!(state.last_dispatched, Some(WorkerId::CorporateFinance));
}

#[tokio::test]
async fn test_conceptual_question_goes_to_terminal_retrieval() {
    let search = StaticSearch::with_hits(vec![SearchHit {
        snippet: "WACC weights each source of capital by its market value.".to_string(),
        source: Some("/data/cfa/reading_36.pdf".to_string()),
        score: Some(0.91),
        metadata: Map::new(),
    }]);
    let classifier = finish_classifier();
    let registry = create_default_registry(
        Arc::new(ScriptedGenerator::text("unused")),
        Arc::new(search),
    );
    let dispatcher = dispatcher_with(registry, classifier.clone(), DispatchConfig::default());

    let report = send(&dispatcher, Uuid::new_v4(), "What is WACC?").await;

    assert_eq!(report.finish, FinishReason::Terminal(WorkerId::Retrieval));
    assert_eq!(report.rounds, 1);
    assert_eq!(classifier.calls(), 0);
    assert!(report.reply.unwrap().content.contains("reading_36.pdf"));
}

#[tokio::test]
async fn test_loop_guard_stops_repeat_dispatch() {
    let (worker, calls) = TestWorker::new(WorkerId::Equity, Behaviour::Reply("The value is 33.33", None));
    let classifier = Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity)));
    let dispatcher = single_worker(worker, classifier, DispatchConfig::default());

    let report = send(&dispatcher, Uuid::new_v4(), "hola").await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.finish, FinishReason::LoopGuard);
    assert_eq!(report.decisions.len(), 2);
    assert_eq!(report.decisions[1].method, RoutingMethod::Forced);
    assert_eq!(report.decisions[1].target, RouteTarget::Finish);
    assert_eq!(report.decisions[1].metadata["reason"], json!("loop_guard"));
    // the worker answer is the reply, no extra system message
    assert_eq!(report.reply.unwrap().content, "The value is 33.33");
}

#[tokio::test]
async fn test_repeated_missing_input_opens_breaker() {
    let (worker, calls) = TestWorker::new(
        WorkerId::CorporateFinance,
        Behaviour::Reply("Faltan_datos: missing discount_rate, cash_flows", None),
    );
    let dispatcher = single_worker(worker, finish_classifier(), DispatchConfig::default());
    let session = Uuid::new_v4();

    for _ in 0..2 {
        let report = send(&dispatcher, session, "Calcula el VAN con inversión 100000").await;
        assert_eq!(report.outcomes, vec![OutcomeKind::MissingInput]);
        assert!(report.reply.unwrap().content.starts_with(MISSING_INPUT_MARKER));
    }

    let report = send(&dispatcher, session, "Calcula el VAN con inversión 100000").await;
    assert_eq!(report.finish, FinishReason::BreakerOpen(TripReason::MissingInput));

    let reply = report.reply.unwrap();
    assert_eq!(reply.role, MessageRole::System);
    assert!(reply.content.contains("provide the required data"));

    // circuit stays open: no further worker calls
    let report = send(&dispatcher, session, "Calcula el VAN con inversión 100000").await;
    assert_eq!(report.rounds, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.finish, FinishReason::BreakerOpen(TripReason::MissingInput));
}

#[tokio::test]
async fn test_failing_worker_counts_as_blocking() {
    let (worker, calls) = TestWorker::new(WorkerId::Equity, Behaviour::Fail);
    let classifier = Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity)));
    let dispatcher = single_worker(worker, classifier, DispatchConfig::default());
    let session = Uuid::new_v4();

    let report = send(&dispatcher, session, "hola").await;
    assert_eq!(report.outcomes, vec![OutcomeKind::BlockingError]);
    // user message and explanation only
    assert_eq!(report.appended.len(), 2);
    assert!(report.appended.iter().all(|m| m.role != MessageRole::Worker));
    let reply = report.reply.unwrap();
    assert_eq!(reply.role, MessageRole::System);
    assert!(reply.content.contains("technical fault"));

    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert_eq!(state.breaker.blocking, 1);
    assert!(!state.breaker.is_open());

    let report = send(&dispatcher, session, "hola otra vez").await;
    assert_eq!(report.finish, FinishReason::BreakerOpen(TripReason::BlockingErrors));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_panicking_worker_is_contained() {
    let (worker, _) = TestWorker::new(WorkerId::Equity, Behaviour::Panic);
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity))),
        DispatchConfig::default(),
    );
    let session = Uuid::new_v4();

    let report = send(&dispatcher, session, "hola").await;

    assert_eq!(report.outcomes, vec![OutcomeKind::BlockingError]);
    assert!(report.reply.unwrap().content.contains("technical fault"));
    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert_eq!(state.breaker.blocking, 1);
}

#[tokio::test]
async fn test_worker_timeout_is_blocking() {
    let (worker, _) = TestWorker::new(WorkerId::Equity, Behaviour::Hang);
    let config = DispatchConfig {
        worker_timeout: Duration::from_millis(50),
        ..DispatchConfig::default()
    };
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity))),
        config,
    );

    let report = send(&dispatcher, Uuid::new_v4(), "hola").await;
    assert_eq!(report.outcomes, vec![OutcomeKind::BlockingError]);
    assert_eq!(report.finish, FinishReason::LoopGuard);
}

#[tokio::test]
async fn test_cancellation_keeps_completed_state() {
    let (worker, _) = TestWorker::new(WorkerId::Equity, Behaviour::Hang);
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity))),
        DispatchConfig::default(),
    );
    let session = Uuid::new_v4();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = dispatcher.handle_message(session, "hola", cancel).await;
    assert!(matches!(result, Err(OrchestrationError::Cancelled)));

    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state.messages()[0].role, MessageRole::User);
    assert!(state.breaker.is_zero());
}

#[tokio::test]
async fn test_round_ceiling() {
    let (equity, _) = TestWorker::new(WorkerId::Equity, Behaviour::Reply("partial", None));
    let (portfolio, _) = TestWorker::new(WorkerId::Portfolio, Behaviour::Reply("partial", None));
    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(equity));
    registry.register(Arc::new(portfolio));

    let ping_pong = (0..10)
        .map(|i| {
            Ok(RouteTarget::Worker(if i % 2 == 0 {
                WorkerId::Equity
            } else {
                WorkerId::Portfolio
            }))
        })
        .collect();
    let config = DispatchConfig {
        max_rounds_per_turn: 3,
        ..DispatchConfig::default()
    };
    let dispatcher = dispatcher_with(
        registry,
        Arc::new(StaticRouteClassifier::scripted(ping_pong)),
        config,
    );

    let report = send(&dispatcher, Uuid::new_v4(), "hola").await;
    assert_eq!(report.rounds, 3);
    assert_eq!(report.finish, FinishReason::RoundCeiling);
    assert_eq!(report.reply.unwrap().role, MessageRole::System);
}

#[tokio::test]
async fn test_topic_change_clears_counters() {
    let (corporate, _) = TestWorker::new(
        WorkerId::CorporateFinance,
        Behaviour::Reply("Error_bloqueante: tool failed", None),
    );
    let (equity, _) = TestWorker::new(WorkerId::Equity, Behaviour::Reply("The share is worth 31.25", None));
    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(corporate));
    registry.register(Arc::new(equity));
    let dispatcher = dispatcher_with(registry, finish_classifier(), DispatchConfig::default());
    let session = Uuid::new_v4();

    send(&dispatcher, session, "Calcula el VAN con inversión 100000").await;
    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert_eq!(state.breaker.blocking, 1);

    let report = send(&dispatcher, session, "Calcula con Gordon: D1 2.5, Ke 12%, g 4%").await;
    assert_eq!(report.decisions[0].target, RouteTarget::Worker(WorkerId::Equity));
    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert!(state.breaker.is_zero());
}

#[tokio::test]
async fn test_fallback_failure_reports_technical_fault() {
    let (worker, calls) = TestWorker::new(WorkerId::Equity, Behaviour::Reply("unused", None));
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::failing("quota exceeded")),
        DispatchConfig::default(),
    );

    let report = send(&dispatcher, Uuid::new_v4(), "hola").await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.finish, FinishReason::Finish);
    assert!(report.decisions[0].metadata.contains_key("fallback_error"));
    assert!(report.reply.unwrap().content.contains("technical fault"));
}

#[tokio::test]
async fn test_nothing_to_answer() {
    let (worker, _) = TestWorker::new(WorkerId::Equity, Behaviour::Reply("unused", None));
    let dispatcher = single_worker(worker, finish_classifier(), DispatchConfig::default());

    let report = send(&dispatcher, Uuid::new_v4(), "hola").await;
    assert_eq!(report.rounds, 0);
    assert!(report.reply.unwrap().content.contains("nothing to answer"));
}

#[tokio::test]
async fn test_reset_session_closes_breaker() {
    let (worker, calls) = TestWorker::new(WorkerId::Equity, Behaviour::Fail);
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity))),
        DispatchConfig::default(),
    );
    let session = Uuid::new_v4();

    send(&dispatcher, session, "hola").await;
    send(&dispatcher, session, "hola").await;
    let state = dispatcher.session_state(session).await.unwrap().unwrap();
    assert!(state.breaker.is_open());

    assert!(dispatcher.reset_session(session).await.unwrap());
    assert!(dispatcher.session_state(session).await.unwrap().is_none());
    assert!(!dispatcher.reset_session(session).await.unwrap());

    send(&dispatcher, session, "hola").await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (worker, _) = TestWorker::new(WorkerId::Equity, Behaviour::Fail);
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity))),
        DispatchConfig::default(),
    );
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    send(&dispatcher, first, "hola").await;
    send(&dispatcher, first, "hola").await;
    let report = send(&dispatcher, second, "hola").await;

    assert_eq!(report.rounds, 1);
    let state = dispatcher.session_state(second).await.unwrap().unwrap();
    assert!(!state.breaker.is_open());
    assert_eq!(state.turn_count, 1);
}

fn slow_equity_dispatcher() -> (Arc<Dispatcher>, Arc<AtomicUsize>) {
    let completed = Arc::new(AtomicUsize::new(0));
    let (worker, _) = TestWorker::new(
        WorkerId::Equity,
        Behaviour::Slow(Duration::from_millis(200), completed.clone()),
    );
    let dispatcher = single_worker(
        worker,
        Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Equity))),
        DispatchConfig::default(),
    );
    (Arc::new(dispatcher), completed)
}

#[tokio::test]
async fn test_dropped_turn_with_drop_guard_stops_worker() {
    let (dispatcher, completed) = slow_equity_dispatcher();

    // same shape as the chat handler: the token is cancelled when the turn is dropped
    let turn = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let _guard = cancel.clone().drop_guard();
            dispatcher.handle_message(Uuid::new_v4(), "hola", cancel).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    turn.abort();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(completed.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.active_sessions(), 0);
}

#[tokio::test]
async fn test_dropped_turn_without_cancel_stops_worker() {
    let (dispatcher, completed) = slow_equity_dispatcher();

    let turn = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .handle_message(Uuid::new_v4(), "hola", CancellationToken::new())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    turn.abort();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_finished_sessions_release_locks() {
    let (worker, _) = TestWorker::new(WorkerId::Equity, Behaviour::Reply("unused", None));
    let dispatcher = single_worker(worker, finish_classifier(), DispatchConfig::default());

    for _ in 0..100 {
        send(&dispatcher, Uuid::new_v4(), "hola").await;
    }
    assert_eq!(dispatcher.active_sessions(), 0);

    let session = Uuid::new_v4();
    send(&dispatcher, session, "hola").await;
    dispatcher.reset_session(session).await.unwrap();
    assert_eq!(dispatcher.active_sessions(), 0);
}
