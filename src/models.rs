//! Core data models for the dispatch core

use crate::error::OrchestrationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//
// ================= Workers =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerId {
    #[serde(rename = "fixed-income-worker")]
    FixedIncome,
    #[serde(rename = "corporate-finance-worker")]
    CorporateFinance,
    #[serde(rename = "equity-worker")]
    Equity,
    #[serde(rename = "portfolio-worker")]
    Portfolio,
    #[serde(rename = "derivatives-worker")]
    Derivatives,
    #[serde(rename = "help-worker")]
    Help,
    #[serde(rename = "retrieval-worker")]
    Retrieval,
}

impl WorkerId {
    pub const ALL: [WorkerId; 7] = [
        WorkerId::FixedIncome,
        WorkerId::CorporateFinance,
        WorkerId::Equity,
        WorkerId::Portfolio,
        WorkerId::Derivatives,
        WorkerId::Help,
        WorkerId::Retrieval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerId::FixedIncome => "fixed-income-worker",
            WorkerId::CorporateFinance => "corporate-finance-worker",
            WorkerId::Equity => "equity-worker",
            WorkerId::Portfolio => "portfolio-worker",
            WorkerId::Derivatives => "derivatives-worker",
            WorkerId::Help => "help-worker",
            WorkerId::Retrieval => "retrieval-worker",
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerId {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        WorkerId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| OrchestrationError::WorkerNotFound(wanted.to_string()))
    }
}

/// Declared parameter a worker needs before it can act
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
}

impl ParamSpec {
    pub fn new(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Number,
    Percentage,
    Integer,
    List,
}

/// One tool a worker can run, with the inputs it cannot do without
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

/// Static registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub description: String,
    pub tools: Vec<ToolSpec>,
    /// Terminal workers end the turn instead of returning to the dispatcher
    pub terminal: bool,
}

impl WorkerSpec {
    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.tools.iter().flat_map(|t| t.params.iter())
    }
}

//
// ================= Routing =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RouteTarget {
    Worker(WorkerId),
    Finish,
    /// No worker could be picked deterministically
    Undecided,
}

impl RouteTarget {
    pub const FINISH: &'static str = "FINISH";
    pub const UNDECIDED: &'static str = "UNDECIDED";

    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            RouteTarget::Worker(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, RouteTarget::Finish)
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Worker(id) => f.write_str(id.as_str()),
            RouteTarget::Finish => f.write_str(Self::FINISH),
            RouteTarget::Undecided => f.write_str(Self::UNDECIDED),
        }
    }
}

impl FromStr for RouteTarget {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"');
        if trimmed.eq_ignore_ascii_case(Self::FINISH) {
            Ok(RouteTarget::Finish)
        } else if trimmed.eq_ignore_ascii_case(Self::UNDECIDED) {
            Ok(RouteTarget::Undecided)
        } else {
            trimmed.parse::<WorkerId>().map(RouteTarget::Worker)
        }
    }
}

impl From<RouteTarget> for String {
    fn from(target: RouteTarget) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for RouteTarget {
    type Error = OrchestrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMethod {
    Fast,
    Fallback,
    Forced,
}

/// One routing decision, produced once per dispatch step
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    confidence: f64,
    pub method: RoutingMethod,
    pub metadata: Map<String, Value>,
}

impl RoutingDecision {
    /// Panics when `confidence` is outside `[0, 1]` or NaN.
    pub fn new(target: RouteTarget, confidence: f64, method: RoutingMethod) -> Self {
        assert!(
            (0.0..=1.0).contains(&confidence),
            "routing confidence must lie in [0, 1], got {}",
            confidence
        );

        Self {
            target,
            confidence,
            method,
            metadata: Map::new(),
        }
    }

    /// Forced FINISH carrying the reason in metadata
    pub fn forced_finish(reason: &str) -> Self {
        Self::new(RouteTarget::Finish, 1.0, RoutingMethod::Forced).with_meta("reason", reason)
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Worker,
    System,
}

/// Structured tool traffic attached to a worker message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    ToolCall { tool: String, arguments: Value },
    ToolResult { tool: String, output: Value },
}

/// One turn of dialogue. Never mutated once appended to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: Uuid,
    /// Position in the conversation, assigned on append
    pub sequence: u64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(role: MessageRole, content: String, worker: Option<WorkerId>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            sequence: 0,
            role,
            content,
            payload: None,
            worker,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(MessageRole::User, content.into(), None)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::build(MessageRole::System, content.into(), None)
    }

    pub fn worker(worker: WorkerId, content: impl Into<String>) -> Self {
        Self::build(MessageRole::Worker, content.into(), Some(worker))
    }

    pub fn tool_call(worker: WorkerId, tool: &str, arguments: Value) -> Self {
        let mut msg = Self::build(
            MessageRole::Worker,
            format!("[tool call] {}", tool),
            Some(worker),
        );
        msg.payload = Some(MessagePayload::ToolCall {
            tool: tool.to_string(),
            arguments,
        });
        msg
    }

    pub fn tool_result(worker: WorkerId, tool: &str, output: Value) -> Self {
        let mut msg = Self::build(
            MessageRole::Worker,
            format!("[tool result] {}: {}", tool, output),
            Some(worker),
        );
        msg.payload = Some(MessagePayload::ToolResult {
            tool: tool.to_string(),
            output,
        });
        msg
    }

    /// A worker's final answer, as opposed to intermediate tool traffic
    pub fn is_final_answer(&self) -> bool {
        self.role == MessageRole::Worker && self.payload.is_none()
    }
}

//
// ================= Outcomes =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Success,
    MissingInput,
    BlockingError,
    CapabilityMismatch,
    Unknown,
}

impl OutcomeKind {
    /// Outcomes that count against the circuit breaker
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OutcomeKind::MissingInput | OutcomeKind::BlockingError | OutcomeKind::CapabilityMismatch
        )
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::MissingInput => "missing-input",
            OutcomeKind::BlockingError => "blocking-error",
            OutcomeKind::CapabilityMismatch => "capability-mismatch",
            OutcomeKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classification of one worker execution
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub kind: OutcomeKind,
    pub raw_text: String,
}

impl OutcomeRecord {
    pub fn new(kind: OutcomeKind, raw_text: impl Into<String>) -> Self {
        Self {
            kind,
            raw_text: raw_text.into(),
        }
    }
}
