//! Seams to the collaborators that sit in front of the retrieval core.
//!
//! Session orchestration lives outside this crate. It supplies a
//! [`HistoryReader`] for recent conversation turns and an [`InputGate`]
//! that screens raw user text. [`SessionRetriever`] runs the gate first and
//! only reaches the knowledge base for accepted input.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::query::QueryEngine;

/// Source of recent conversation history.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    /// The last `limit` messages of `participant` in `session_id`, rendered
    /// as one context string. An unknown session yields an empty string.
    async fn recent_messages(&self, session_id: &str, participant: &str, limit: usize)
    -> Result<String>;
}

/// Verdict of an [`InputGate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// The input may proceed.
    Allow,
    /// The input is refused; the reason is opaque to the core.
    Reject {
        /// Why the gate refused the input.
        reason: String,
    },
}

/// A stateless screen applied to raw user text before any retrieval.
pub trait InputGate: Send + Sync {
    /// Decide whether `text` may reach the knowledge base.
    fn check(&self, text: &str) -> GateDecision;
}

/// What a session turn gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionContext {
    /// The gate refused the input; nothing was retrieved.
    Rejected {
        /// The gate's reason.
        reason: String,
    },
    /// History and knowledge context for the turn.
    Ready {
        /// Recent conversation history.
        history: String,
        /// Formatted knowledge context.
        knowledge: String,
    },
}

/// Gate → history + knowledge, for one conversational turn.
pub struct SessionRetriever {
    engine: QueryEngine,
    gate: Arc<dyn InputGate>,
    history: Arc<dyn HistoryReader>,
    history_limit: usize,
}

impl SessionRetriever {
    /// Default number of history messages fetched per turn.
    pub const DEFAULT_HISTORY_LIMIT: usize = 10;

    /// Compose the retriever.
    pub fn new(engine: QueryEngine, gate: Arc<dyn InputGate>, history: Arc<dyn HistoryReader>) -> Self {
        Self { engine, gate, history, history_limit: Self::DEFAULT_HISTORY_LIMIT }
    }

    /// Fetch `limit` history messages per turn.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Screen `text`, then gather history and knowledge concurrently.
    ///
    /// # Errors
    ///
    /// Returns the history reader's or query engine's error.
    pub async fn retrieve(
        &self,
        session_id: &str,
        participant: &str,
        text: &str,
    ) -> Result<SessionContext> {
        if let GateDecision::Reject { reason } = self.gate.check(text) {
            debug!(session.id = session_id, %reason, "input rejected by gate");
            return Ok(SessionContext::Rejected { reason });
        }

        let (history, knowledge) = futures::try_join!(
            self.history.recent_messages(session_id, participant, self.history_limit),
            self.engine.context(text),
        )?;
        Ok(SessionContext::Ready { history, knowledge })
    }
}
