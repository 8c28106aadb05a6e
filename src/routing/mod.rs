//! Two-tier routing: deterministic patterns first, LLM supervisor second

pub mod fallback;
pub mod fast;
pub mod patterns;

pub use fallback::{build_system_instruction, FallbackClassifier, FALLBACK_CONFIDENCE};
pub use fast::{extract_params, ExtractedParam, FastClassifier};
pub use patterns::{CompiledPatterns, RoutingPatterns};

use crate::models::{Message, RoutingDecision};
use tracing::{debug, info};

/// Hybrid dispatch strategy. Pure composition of the two classifiers.
pub struct HybridRouter {
    fast: FastClassifier,
    fallback: FallbackClassifier,
    threshold: f64,
}

impl HybridRouter {
    pub fn new(fast: FastClassifier, fallback: FallbackClassifier, threshold: f64) -> Self {
        Self {
            fast,
            fallback,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn route(&self, history: &[Message]) -> RoutingDecision {
        let fast = self.fast.classify(history);

        if fast.confidence() >= self.threshold && fast.target.worker().is_some() {
            info!(
                target = %fast.target,
                confidence = fast.confidence(),
                "Fast bypass"
            );
            return fast
                .with_meta("fast_bypass", true)
                .with_meta("threshold_used", self.threshold);
        }

        debug!(
            fast_target = %fast.target,
            fast_confidence = fast.confidence(),
            "Fast path not confident, asking fallback classifier"
        );

        self.fallback
            .classify(history)
            .await
            .with_meta("fast_bypass", false)
            .with_meta("threshold_used", self.threshold)
            .with_meta("fast_confidence", fast.confidence())
            .with_meta("fast_target", fast.target.to_string())
    }
}
