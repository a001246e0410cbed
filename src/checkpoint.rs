//! Durable record of conversations already resolved in the current mission.

use std::collections::HashMap;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool, StoreError};
use crate::model::{ActionOutcome, ConversationId};

#[derive(Debug)]
pub struct CheckpointStore {
    pool: Pool,
    session: String,
    processed: HashMap<ConversationId, ActionOutcome>,
}

impl CheckpointStore {
    /// Load the processed set for `session`. Rows that cannot be decoded are
    /// skipped so one damaged entry never discards the rest.
    #[instrument(skip_all, fields(session = %session.as_ref()))]
    pub async fn load(pool: Pool, session: impl AsRef<str>) -> Result<Self, StoreError> {
        let session = session.as_ref().to_string();
        let rows = db::load_checkpoint(&pool, &session).await?;
        let mut processed = HashMap::with_capacity(rows.len());
        for (id, outcome) in rows {
            match ActionOutcome::parse(&outcome) {
                Some(outcome) => {
                    processed.insert(ConversationId(id), outcome);
                }
                None => warn!(id, outcome, "ignoring unreadable checkpoint entry"),
            }
        }
        info!(processed = processed.len(), "loaded checkpoint");
        Ok(Self {
            pool,
            session,
            processed,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_processed(&self, id: ConversationId) -> bool {
        self.processed.contains_key(&id)
    }

    pub fn outcome(&self, id: ConversationId) -> Option<ActionOutcome> {
        self.processed.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConversationId> + '_ {
        self.processed.keys().copied()
    }

    /// Persist first, then remember. A failed write leaves the in-memory set
    /// unchanged and is surfaced to the caller.
    pub async fn mark_processed(
        &mut self,
        id: ConversationId,
        outcome: ActionOutcome,
    ) -> Result<(), StoreError> {
        db::upsert_checkpoint(&self.pool, &self.session, id.0, outcome.as_str()).await?;
        self.processed.insert(id, outcome);
        Ok(())
    }

    /// Forget everything; the next mission starts from scratch.
    pub async fn clear(&mut self) -> Result<u64, StoreError> {
        let removed = db::delete_checkpoint(&self.pool, &self.session).await?;
        self.processed.clear();
        info!(removed, "checkpoint cleared");
        Ok(removed)
    }

    /// Forget only conversations that ended in `RetriesExhausted` or `Fatal`.
    pub async fn clear_failures(&mut self) -> Result<u64, StoreError> {
        let removed = db::delete_checkpoint_outcomes(
            &self.pool,
            &self.session,
            &[
                ActionOutcome::RetriesExhausted.as_str(),
                ActionOutcome::Fatal.as_str(),
            ],
        )
        .await?;
        self.processed.retain(|_, outcome| !outcome.is_failure());
        info!(removed, "failed checkpoint entries cleared");
        Ok(removed)
    }
}
