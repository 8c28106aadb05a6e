//! Worker outcome classification
//!
//! Workers are expected to return a structured signal. Text markers are only
//! consulted when that signal is absent.

use crate::models::{Message, MessagePayload, OutcomeKind, OutcomeRecord};

pub const SUCCESS_MARKER: &str = "Tarea_completada";
pub const BLOCKING_MARKER: &str = "Error_bloqueante";
pub const MISSING_INPUT_MARKER: &str = "Faltan_datos";
pub const MISMATCH_MARKER: &str = "No_es_mi_especialidad";

const LEGACY_BLOCKING_PHRASES: &[&str] = &[
    "technical problem",
    "tool failed",
    "problema técnico",
    "problema tecnico",
    "herramienta falló",
    "herramienta fallo",
    "no puedo calcular",
];

pub trait OutcomeClassifier: Send + Sync {
    /// `signal` is the worker's structured outcome, if it reported one
    fn classify(&self, message: &Message, signal: Option<OutcomeKind>) -> OutcomeRecord;
}

/// Marker-based classifier
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerOutcomeClassifier;

impl MarkerOutcomeClassifier {
    pub fn classify_text(text: &str) -> OutcomeKind {
        let lowered = text.to_lowercase();
        let has = |marker: &str| lowered.contains(&marker.to_lowercase());

        if has(SUCCESS_MARKER) {
            OutcomeKind::Success
        } else if has(BLOCKING_MARKER) {
            OutcomeKind::BlockingError
        } else if has(MISSING_INPUT_MARKER) {
            OutcomeKind::MissingInput
        } else if has(MISMATCH_MARKER) {
            OutcomeKind::CapabilityMismatch
        } else if LEGACY_BLOCKING_PHRASES.iter().any(|p| lowered.contains(p)) {
            OutcomeKind::BlockingError
        } else {
            OutcomeKind::Unknown
        }
    }
}

impl OutcomeClassifier for MarkerOutcomeClassifier {
    fn classify(&self, message: &Message, signal: Option<OutcomeKind>) -> OutcomeRecord {
        if let Some(MessagePayload::ToolCall { .. }) = message.payload {
            return OutcomeRecord::new(OutcomeKind::Unknown, message.content.clone());
        }

        let kind = signal.unwrap_or_else(|| Self::classify_text(&message.content));
        OutcomeRecord::new(kind, message.content.clone())
    }
}
