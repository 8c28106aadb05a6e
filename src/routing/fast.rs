//! Deterministic fast-path intent classifier
//!
//! Pure pattern matching over the latest user message. No I/O, never fails.

use super::patterns::CompiledPatterns;
use crate::models::{Message, MessageRole, RouteTarget, RoutingDecision, RoutingMethod, WorkerId};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    /// Alternation order matters: the leftmost-first alternative wins, so a
    /// bracketed list is one parameter rather than one per element.
    static ref PARAM_RE: Regex = Regex::new(
        r"(?xi)
        (?P<list>\[\s*\d+(?:\.\d+)?(?:\s*[,;]\s*\d+(?:\.\d+)?)*\s*\])
        | (?P<percent>\d+(?:[.,]\d+)?\s?%)
        | (?P<scaled>[$€]?\d+(?:\.\d+)?\s?(?:k|mm|m|bn)\b)
        | (?P<currency>[$€]\s?\d[\d,]*(?:\.\d+)?)
        | (?P<thousands>\d{1,3}(?:,\d{3})+(?:\.\d+)?)
        | (?P<number>\d+(?:\.\d+)?)
        "
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractedKind {
    List,
    Percentage,
    Scaled,
    Currency,
    Number,
}

/// Numeric candidate found in a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedParam {
    pub kind: ExtractedKind,
    pub raw: String,
}

/// Extract candidate numeric parameters in order of appearance
pub fn extract_params(text: &str) -> Vec<ExtractedParam> {
    PARAM_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let (kind, m) = if let Some(m) = caps.name("list") {
                (ExtractedKind::List, m)
            } else if let Some(m) = caps.name("percent") {
                (ExtractedKind::Percentage, m)
            } else if let Some(m) = caps.name("scaled") {
                (ExtractedKind::Scaled, m)
            } else if let Some(m) = caps.name("currency") {
                (ExtractedKind::Currency, m)
            } else if let Some(m) = caps.name("thousands") {
                (ExtractedKind::Number, m)
            } else {
                (ExtractedKind::Number, caps.name("number")?)
            };

            Some(ExtractedParam {
                kind,
                raw: m.as_str().to_string(),
            })
        })
        .collect()
}

/// Fast classifier over precompiled pattern tables
#[derive(Debug, Clone)]
pub struct FastClassifier {
    patterns: Arc<CompiledPatterns>,
}

impl FastClassifier {
    pub fn new(patterns: Arc<CompiledPatterns>) -> Self {
        Self { patterns }
    }

    /// Classify the conversation by its latest message
    pub fn classify(&self, history: &[Message]) -> RoutingDecision {
        match history.last() {
            Some(msg) if msg.role == MessageRole::User => self.classify_text(&msg.content),
            _ => RoutingDecision::new(RouteTarget::Undecided, 0.0, RoutingMethod::Fast)
                .with_meta("reason", "no_user_message"),
        }
    }

    pub fn classify_text(&self, text: &str) -> RoutingDecision {
        let has_intent = self.patterns.has_calc_intent(text);

        if !has_intent && self.patterns.has_rag_intent(text) {
            debug!("Conceptual intent detected, routing to retrieval");
            return RoutingDecision::new(
                RouteTarget::Worker(WorkerId::Retrieval),
                1.0,
                RoutingMethod::Fast,
            )
            .with_meta("reason", "rag_keyword_match");
        }

        let params = extract_params(text);
        let rule = self.patterns.match_rule(text);

        // tenths, so the sum stays exact
        let mut score: u32 = 0;
        if has_intent {
            score += 4;
        }
        if let Some(rule) = rule {
            score += 4;
            if params.len() >= rule.required_params {
                score += 2;
            } else if params.len() + 1 >= rule.required_params {
                score += 1;
            }
        }
        let confidence = f64::from(score) / 10.0;

        let target = rule
            .map(|r| RouteTarget::Worker(r.worker))
            .unwrap_or(RouteTarget::Undecided);

        debug!(
            target = %target,
            confidence,
            has_intent,
            params = params.len(),
            "Fast classification"
        );

        let sample: Vec<&str> = params.iter().take(3).map(|p| p.raw.as_str()).collect();

        RoutingDecision::new(target, confidence, RoutingMethod::Fast)
            .with_meta("has_intent", has_intent)
            .with_meta("params_detected", params.len())
            .with_meta("params_sample", json!(sample))
            .with_meta("rule_priority", rule.map(|r| r.priority).unwrap_or(0))
            .with_meta("required_params", rule.map(|r| r.required_params).unwrap_or(0))
    }
}

impl Default for FastClassifier {
    fn default() -> Self {
        Self::new(Arc::new(CompiledPatterns::default()))
    }
}
