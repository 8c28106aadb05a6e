//! Query guardrails for the retrieval worker
//!
//! Refuses requests to reproduce indexed material verbatim or to dump its
//! full structure.

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use tracing::warn;

const VERBATIM_PATTERNS: &[&str] = &[
    r"\b(transcribe|transcribir|transcripci[oó]n)\b",
    r"\b(copia|copiar|c[oó]piame)\b",
    r"\btexto\s+(completo|exacto|literal|original)\b",
    r"\bdame\s+el\s+texto\b",
    r"\bmuestra\s+el\s+(contenido|texto)\s+completo\b",
    r"\bcap[ií]tulo\s+\d+\s+completo\b",
    r"\bsecci[oó]n\s+completa\b",
    r"\btodo\s+el\s+(cap[ií]tulo|reading|material)\b",
    r"\bp[aá]ginas?\s+\d+(\s*-\s*\d+)?\b",
    r"\bcita\s+textual(mente)?\b",
    r"\bextracto\s+completo\b",
    r"\bp[aá]rrafo\s+exacto\b",
    r"\b(pdf|documento|material)\s+(completo|original)\b",
    r"\b(transcript|verbatim|word\s+for\s+word)\b",
    r"\b(full|entire|complete)\s+(text|chapter|reading|section)\b",
    r"\bpages?\s+\d+(\s*-\s*\d+)?\b",
];

const STRUCTURE_PATTERNS: &[&str] = &[
    r"\boutline\s+complet[oe]\b",
    r"\b[ií]ndice\s+completo\b",
    r"\btabla\s+de\s+contenidos?\s+completa\b",
    r"\bestructura\s+del\s+(libro|material|curriculum)\b",
    r"\b(full|complete|entire)\s+(outline|table\s+of\s+contents|index)\b",
    r"\bstructure\s+of\s+the\s+(book|material|curriculum)\b",
];

pub const VERBATIM_REFUSAL: &str = "Out of respect for the publisher's copyright I cannot provide \
literal copies, transcriptions or reproductions of the original material.\n\n\
I can explain financial concepts in my own words, solve specific calculations, \
clarify formulas and methodologies, or compare valuation models. \
Please rephrase the question around the concept or calculation you want to understand.";

pub const STRUCTURE_REFUSAL: &str = "Out of respect for the publisher's copyright I cannot provide \
the complete structure, index or outline of the material.\n\n\
Ask about a specific topic instead (for example \"Explain WACC\" or \"How does duration work?\"), \
or request a concrete calculation.";

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
}

lazy_static! {
    static ref VERBATIM: Vec<Regex> = compile(VERBATIM_PATTERNS);
    static ref STRUCTURE: Vec<Regex> = compile(STRUCTURE_PATTERNS);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Verbatim,
    Structure,
}

impl Refusal {
    pub fn message(&self) -> &'static str {
        match self {
            Refusal::Verbatim => VERBATIM_REFUSAL,
            Refusal::Structure => STRUCTURE_REFUSAL,
        }
    }
}

/// `Some` when the query must not reach the search backend
pub fn check_query(query: &str) -> Option<Refusal> {
    let verdict = if VERBATIM.iter().any(|re| re.is_match(query)) {
        Some(Refusal::Verbatim)
    } else if STRUCTURE.iter().any(|re| re.is_match(query)) {
        Some(Refusal::Structure)
    } else {
        None
    };

    if let Some(refusal) = verdict {
        warn!(?refusal, "Guardrail refused retrieval query");
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(VERBATIM.len(), VERBATIM_PATTERNS.len());
        assert_eq!(STRUCTURE.len(), STRUCTURE_PATTERNS.len());
    }

    #[test]
    fn test_verbatim_requests_refused() {
        assert_eq!(check_query("Transcribe el capítulo 3 completo"), Some(Refusal::Verbatim));
        assert_eq!(check_query("dame el texto de la página 45"), Some(Refusal::Verbatim));
        assert_eq!(check_query("Give me the full text of reading 20"), Some(Refusal::Verbatim));
    }

    #[test]
    fn test_structure_requests_refused() {
        assert_eq!(check_query("Quiero el índice completo del nivel II"), Some(Refusal::Structure));
        assert_eq!(check_query("show me the complete table of contents"), Some(Refusal::Structure));
    }

    #[test]
    fn test_conceptual_questions_pass() {
        assert_eq!(check_query("¿Qué es el WACC?"), None);
        assert_eq!(check_query("Explain modified duration"), None);
    }
}
