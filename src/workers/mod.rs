//! Worker trait and registry
//!
//! A worker receives the conversation history and returns the messages it
//! wants appended plus, ideally, a structured outcome signal. Workers never
//! touch the conversation state directly.

use crate::finance::FinanceTool;
use crate::llm::GenerationService;
use crate::models::{Message, OutcomeKind, WorkerId, WorkerSpec};
use crate::search::SemanticSearch;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod calculation;
pub mod guardrails;
pub mod help;
pub mod retrieval;

pub use calculation::CalculationWorker;
pub use help::HelpWorker;
pub use retrieval::RetrievalWorker;

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub session_id: Uuid,
    pub history: Vec<Message>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    pub messages: Vec<Message>,
    pub signal: Option<OutcomeKind>,
}

impl WorkerOutput {
    pub fn answer(message: Message, signal: OutcomeKind) -> Self {
        Self {
            messages: vec![message],
            signal: Some(signal),
        }
    }

    /// The last final answer in the output, skipping tool traffic
    pub fn final_answer(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_final_answer())
    }
}

#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    fn spec(&self) -> &WorkerSpec;

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput>;
}

/// Typed worker table, immutable after startup
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.spec().id, worker);
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<dyn Worker>> {
        self.workers.get(&id).cloned()
    }

    pub fn is_terminal(&self, id: WorkerId) -> bool {
        self.workers.get(&id).map_or(false, |w| w.spec().terminal)
    }

    /// Specs in stable `WorkerId` order
    pub fn specs(&self) -> Vec<WorkerSpec> {
        let mut specs: Vec<WorkerSpec> = self.workers.values().map(|w| w.spec().clone()).collect();
        specs.sort_by_key(|s| s.id);
        specs
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// The standard seven workers
pub fn create_default_registry(
    generation: Arc<dyn GenerationService>,
    search: Arc<dyn SemanticSearch>,
) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();

    let calculation = [
        (
            WorkerId::FixedIncome,
            "Fixed income: bond pricing",
            vec![FinanceTool::BondValue],
        ),
        (
            WorkerId::CorporateFinance,
            "Corporate finance: project NPV and cost of capital",
            vec![FinanceTool::NetPresentValue, FinanceTool::Wacc],
        ),
        (
            WorkerId::Equity,
            "Equity valuation with the dividend discount model",
            vec![FinanceTool::GordonGrowth],
        ),
        (
            WorkerId::Portfolio,
            "Portfolio management: CAPM and risk-adjusted returns",
            vec![FinanceTool::Capm, FinanceTool::SharpeRatio],
        ),
        (
            WorkerId::Derivatives,
            "Derivatives: European call option pricing",
            vec![FinanceTool::BlackScholesCall],
        ),
    ];

    for (id, description, tools) in calculation {
        registry.register(Arc::new(CalculationWorker::new(
            id,
            description,
            tools,
            generation.clone(),
        )));
    }

    registry.register(Arc::new(HelpWorker::new()));
    registry.register(Arc::new(RetrievalWorker::new(search)));

    registry
}
