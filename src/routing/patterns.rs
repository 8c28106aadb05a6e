//! Routing pattern tables
//!
//! Tables are plain serde data so they can be overridden from a YAML file.
//! They are compiled exactly once into [`CompiledPatterns`] and shared behind
//! an `Arc` by every classifier instance.

use crate::error::OrchestrationError;
use crate::models::WorkerId;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Patterns grouped by language
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguagePatterns {
    #[serde(default)]
    pub spanish: Vec<String>,
    #[serde(default)]
    pub english: Vec<String>,
}

impl LanguagePatterns {
    fn new(spanish: &[&str], english: &[&str]) -> Self {
        Self {
            spanish: spanish.iter().map(|s| s.to_string()).collect(),
            english: english.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &String> {
        self.spanish.iter().chain(self.english.iter())
    }
}

/// Keyword rule mapping a query to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRule {
    pub worker: WorkerId,
    #[serde(default)]
    pub priority: i32,
    pub keywords: LanguagePatterns,
    #[serde(default = "default_required_params")]
    pub required_params: usize,
}

fn default_required_params() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPatterns {
    #[serde(default)]
    pub calc_intent_patterns: LanguagePatterns,
    #[serde(default)]
    pub rag_intent_patterns: LanguagePatterns,
    #[serde(default)]
    pub worker_rules: Vec<WorkerRule>,
}

impl RoutingPatterns {
    pub fn from_yaml_str(raw: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Load from `path` when given, falling back to the built-in tables on
    /// any read or parse failure.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path)
            .map_err(OrchestrationError::from)
            .and_then(|raw| Self::from_yaml_str(&raw))
        {
            Ok(patterns) => {
                info!(path = %path.display(), rules = patterns.worker_rules.len(), "Routing patterns loaded");
                patterns
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load routing patterns, using defaults");
                Self::default()
            }
        }
    }

    pub fn compile(&self) -> CompiledPatterns {
        let calc_intent = compile_all("calc intent", self.calc_intent_patterns.iter());
        let rag_intent = compile_all("rag intent", self.rag_intent_patterns.iter());

        let mut rules: Vec<CompiledRule> = self
            .worker_rules
            .iter()
            .filter_map(|rule| {
                let keywords = compile_all(rule.worker.as_str(), rule.keywords.iter());
                if keywords.is_empty() {
                    warn!(worker = %rule.worker, "Dropping worker rule without usable keywords");
                    return None;
                }
                Some(CompiledRule {
                    worker: rule.worker,
                    priority: rule.priority,
                    required_params: rule.required_params,
                    keywords,
                })
            })
            .collect();

        // Stable: equal priorities keep declaration order
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        info!(
            calc = calc_intent.len(),
            rag = rag_intent.len(),
            rules = rules.len(),
            "Routing patterns compiled"
        );

        CompiledPatterns {
            calc_intent,
            rag_intent,
            rules,
        }
    }
}

fn compile_all<'a>(group: &str, patterns: impl Iterator<Item = &'a String>) -> Vec<Regex> {
    patterns
        .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(group, pattern = %p, error = %e, "Skipping invalid routing pattern");
                None
            }
        })
        .collect()
}

fn rule(worker: WorkerId, priority: i32, spanish: &[&str], english: &[&str], required_params: usize) -> WorkerRule {
    WorkerRule {
        worker,
        priority,
        keywords: LanguagePatterns::new(spanish, english),
        required_params,
    }
}

impl Default for RoutingPatterns {
    fn default() -> Self {
        use WorkerId::*;

        Self {
            calc_intent_patterns: LanguagePatterns::new(
                &[
                    r"\bcalcula(?:r)?\b",
                    r"\bobt[eé]n(?:er)?\b",
                    r"\bdetermin(?:a|ar)\b",
                    r"\bcomput(?:a|ar)\b",
                ],
                &[r"\bcalculate\b", r"\bcompute\b", r"\bdetermine\b"],
            ),
            rag_intent_patterns: LanguagePatterns::new(
                &[
                    r"\bqu[eé] (?:es|son)\b",
                    r"\bdefin(?:e|ici[oó]n)\b",
                    r"\bexpl[ií]ca(?:me)?\b",
                    r"\bconcepto\b",
                    r"\bseg[uú]n el cfa\b",
                ],
                &[
                    r"\bwhat (?:is|are)\b",
                    r"\bdefine\b",
                    r"\bdefinition\b",
                    r"\bexplain\b",
                    r"\bconcept\b",
                    r"\bmeaning of\b",
                ],
            ),
            worker_rules: vec![
                // corporate finance
                rule(CorporateFinance, 10, &[r"\bvan\b", "valor actual neto", r"\bnpv\b"], &[r"\bnpv\b", "net present value"], 3),
                rule(CorporateFinance, 9, &[r"\bwacc\b", "costo.*capital"], &[r"\bwacc\b", "weighted average cost"], 5),
                rule(CorporateFinance, 9, &[r"\btir\b", "tasa.*interna"], &[r"\birr\b", "internal rate"], 2),
                rule(CorporateFinance, 8, &["payback", "recuperaci[oó]n"], &["payback period"], 2),
                // portfolio
                rule(Portfolio, 10, &[r"\bcapm\b"], &[r"\bcapm\b", "capital asset pricing"], 3),
                rule(Portfolio, 9, &["sharpe"], &["sharpe ratio"], 3),
                rule(Portfolio, 9, &["treynor"], &["treynor ratio"], 3),
                rule(Portfolio, 9, &["jensen"], &["jensen alpha"], 4),
                // fixed income
                rule(FixedIncome, 10, &["valor.*bono", "precio.*bono"], &["bond.*value", "bond.*price"], 5),
                rule(FixedIncome, 9, &["duration.*macaulay"], &["macaulay duration"], 5),
                rule(FixedIncome, 8, &["convexidad"], &["convexity"], 5),
                rule(FixedIncome, 8, &["current.*yield", "rendimiento corriente"], &["current yield"], 2),
                // equity
                rule(Equity, 10, &["gordon", r"\bddm\b", "dividend.*discount"], &["gordon growth", r"\bddm\b"], 3),
                // derivatives
                rule(Derivatives, 10, &["opci[oó]n.*call", "call.*option"], &["call option"], 5),
                rule(Derivatives, 10, &["opci[oó]n.*put", "put.*option"], &["put option"], 5),
                rule(Derivatives, 9, &["black.?scholes", "paridad"], &["black.?scholes", "put call parity"], 5),
                // usage guide
                rule(Help, 5, &[r"\bayuda\b", r"\bqu[eé] puedes hacer\b"], &[r"\bhelp\b", r"\bwhat can you do\b"], 0),
            ],
        }
    }
}

/// Compiled worker rule
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub worker: WorkerId,
    pub priority: i32,
    pub required_params: usize,
    pub keywords: Vec<Regex>,
}

impl CompiledRule {
    pub fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|re| re.is_match(text))
    }
}

/// Read-only compiled tables
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub calc_intent: Vec<Regex>,
    pub rag_intent: Vec<Regex>,
    /// Sorted by priority, highest first
    pub rules: Vec<CompiledRule>,
}

impl CompiledPatterns {
    pub fn has_calc_intent(&self, text: &str) -> bool {
        self.calc_intent.iter().any(|re| re.is_match(text))
    }

    pub fn has_rag_intent(&self, text: &str) -> bool {
        self.rag_intent.iter().any(|re| re.is_match(text))
    }

    pub fn match_rule(&self, text: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| rule.matches(text))
    }
}

impl Default for CompiledPatterns {
    fn default() -> Self {
        RoutingPatterns::default().compile()
    }
}
