//! Financial query dispatch core
//!
//! Routes each user message to one specialist worker, watches the outcome of
//! every worker round and stops retrying once a session keeps failing.
//!
//! DISPATCH LOOP:
//! INPUT → ROUTE (fast | fallback) → EXECUTE WORKER → CLASSIFY OUTCOME → BREAKER → ROUTE? → REPLY

pub mod api;
pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod finance;
pub mod llm;
pub mod models;
pub mod outcome;
pub mod routing;
pub mod search;
pub mod state;
pub mod workers;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use models::*;
pub use dispatch::{Dispatcher, FinishReason, TurnReport};
