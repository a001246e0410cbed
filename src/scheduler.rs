//! Batching and sequential dispatch of pending conversations.

use std::time::Duration;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::classify::Classified;
use crate::engine::{CancelFlag, MissionError};
use crate::executor::ActionExecutor;
use crate::model::ActionOutcome;
use crate::pause::Pause;
use crate::report::ReportBuilder;
use crate::whitelist::Whitelist;

pub const MIN_BATCH: usize = 5;
pub const MAX_BATCH: usize = 20;

/// Requested size clamped to the bound, or `pending / 20 + 1` when unset.
pub fn batch_size_for(pending: usize, requested: Option<usize>) -> usize {
    requested
        .unwrap_or(pending / 20 + 1)
        .clamp(MIN_BATCH, MAX_BATCH)
}

/// Split `items` into consecutive batches of roughly `size` items, keeping
/// order. Batches are balanced so none falls below [`MIN_BATCH`] unless
/// fewer than `MIN_BATCH` items exist in total.
pub fn plan_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let size = size.clamp(MIN_BATCH, MAX_BATCH);
    let mut count = total.div_ceil(size);
    while count > 1 && total / count < MIN_BATCH {
        count -= 1;
    }

    let base = total / count;
    let extra = total % count;
    let mut batches = Vec::with_capacity(count);
    let mut iter = items.into_iter();
    for index in 0..count {
        let len = base + usize::from(index < extra);
        batches.push(iter.by_ref().take(len).collect());
    }
    batches
}

/// Conversations that still need a destructive action, in enumeration order.
///
/// A conversation kept by an earlier whitelist that no longer matches is
/// pending again.
pub fn pending<'a>(
    dialogs: &'a [Classified],
    checkpoint: &CheckpointStore,
    whitelist: &Whitelist,
) -> Vec<&'a Classified> {
    dialogs
        .iter()
        .filter(|d| whitelist.matches(d).is_none())
        .filter(|d| match checkpoint.outcome(d.conversation.id) {
            None => true,
            Some(ActionOutcome::SkippedWhitelisted) => {
                warn!(
                    id = d.conversation.id.0,
                    name = %d.conversation.display_name,
                    "no longer whitelisted; scheduling cleanup"
                );
                true
            }
            Some(_) => false,
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub batches: usize,
    pub dispatched: usize,
    pub cancelled: bool,
}

/// Everything a pass writes to while it runs.
pub struct PassContext<'p, 'r> {
    pub pass: u32,
    pub executor: &'p mut ActionExecutor<'r>,
    pub checkpoint: &'p mut CheckpointStore,
    pub report: &'p mut ReportBuilder,
    pub cancel: &'p CancelFlag,
}

#[derive(Debug, Clone)]
pub struct BatchScheduler {
    batch_size: Option<usize>,
    warmup: Duration,
    batch_pause: Duration,
    warmed_up: bool,
}

impl BatchScheduler {
    pub fn new(batch_size: Option<usize>, warmup: Duration, batch_pause: Duration) -> Self {
        Self {
            batch_size,
            warmup,
            batch_pause,
            warmed_up: false,
        }
    }

    pub fn plan<'a>(&self, pending: Vec<&'a Classified>) -> Vec<Vec<&'a Classified>> {
        let size = batch_size_for(pending.len(), self.batch_size);
        plan_batches(pending, size)
    }

    /// Process batches one after another, one conversation at a time. The
    /// checkpoint is written before the next conversation is dispatched.
    pub async fn run(
        &mut self,
        batches: Vec<Vec<&Classified>>,
        pause: &dyn Pause,
        ctx: PassContext<'_, '_>,
    ) -> Result<PassSummary, MissionError> {
        let mut summary = PassSummary::default();
        if batches.is_empty() {
            return Ok(summary);
        }

        if !self.warmed_up {
            info!(secs = self.warmup.as_secs_f32(), "warming up before first batch");
            pause.pause(self.warmup).await;
            self.warmed_up = true;
        }

        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 {
                pause.pause(self.batch_pause).await;
            }
            info!(pass = ctx.pass, batch = index + 1, of = total, size = batch.len(), "processing batch");
            summary.batches += 1;

            for dialog in batch {
                if ctx.cancel.is_cancelled() {
                    info!(pass = ctx.pass, dispatched = summary.dispatched, "cancellation requested");
                    summary.cancelled = true;
                    return Ok(summary);
                }
                let conversation = &dialog.conversation;
                let execution = ctx
                    .executor
                    .execute(conversation)
                    .await
                    .map_err(|unauthorized| MissionError::Authentication(unauthorized.0))?;
                ctx.checkpoint
                    .mark_processed(conversation.id, execution.outcome)
                    .await?;
                ctx.report.record(ctx.pass, conversation, &execution);
                summary.dispatched += 1;
            }
        }
        Ok(summary)
    }
}
