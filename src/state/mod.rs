//! Conversation state and checkpoint persistence
//!
//! A session's whole state is one checkpoint, written after every dispatch
//! round. Stores are last-writer-wins per session id.

use crate::breaker::BreakerCounters;
use crate::models::{Message, MessageRole, RouteTarget, WorkerId};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub mod postgres;
pub use postgres::PostgresCheckpointStore;

/// Persisted per-session state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub session_id: Uuid,
    messages: Vec<Message>,
    pub target: Option<RouteTarget>,
    pub breaker: BreakerCounters,
    pub last_dispatched: Option<WorkerId>,
    /// Set when a user message arrives, cleared by the first dispatch after it
    pub fresh_user_input: bool,
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            messages: Vec::new(),
            target: None,
            breaker: BreakerCounters::default(),
            last_dispatched: None,
            fresh_user_input: false,
            turn_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append-only. The message gets the next sequence index.
    pub fn append(&mut self, mut message: Message) -> &Message {
        message.sequence = self.messages.len() as u64;
        if message.role == MessageRole::User {
            self.fresh_user_input = true;
        }
        self.updated_at = Utc::now();
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Key-value checkpoint store keyed by session id
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, session_id: Uuid) -> Result<Option<ConversationState>>;
    async fn put(&self, state: &ConversationState) -> Result<()>;
    /// Returns whether a checkpoint existed
    async fn delete(&self, session_id: Uuid) -> Result<bool>;
}

/// In-memory checkpoint store for development and tests
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    sessions: Arc<RwLock<HashMap<Uuid, ConversationState>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<ConversationState>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id).cloned())
    }

    async fn put(&self, state: &ConversationState) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(state.session_id, state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(&session_id).is_some())
    }
}

/// Postgres when a database url is configured and usable, in-memory otherwise
pub fn build_checkpoint_store(database_url: Option<&str>) -> Arc<dyn CheckpointStore> {
    if let Some(url) = database_url {
        match PostgresCheckpointStore::connect_lazy(url) {
            Ok(store) => {
                info!("Checkpoint backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres checkpoint backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Checkpoint backend: in-memory");
    Arc::new(InMemoryCheckpointStore::new())
}
