//! Mission driver: enumerate, classify, clean in batches, verify.

use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::classify::{classify, Classified};
use crate::config::Cleanup;
use crate::db::StoreError;
use crate::executor::{ActionExecutor, RetryPolicy};
use crate::model::ActionOutcome;
use crate::pause::Pause;
use crate::remote::{MessagingService, RemoteError, RemoteResult};
use crate::report::{self, MissionStatus, ReportBuilder, RunReport};
use crate::scheduler::{self, BatchScheduler, PassContext, PassSummary};
use crate::whitelist::{PreferenceStore, Whitelist, SERVICE_NOTIFICATIONS_ID};

/// Failures that end the mission. Per-conversation failures never get here.
#[derive(Debug, Error)]
pub enum MissionError {
    #[error("remote session rejected: {0}")]
    Authentication(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("remote {operation} failed: {source}")]
    Remote {
        operation: &'static str,
        #[source]
        source: RemoteError,
    },
    #[error("failed to write run log: {0}")]
    Report(#[from] std::io::Error),
}

/// Cooperative cancellation, polled between conversations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub warmup: Duration,
    pub batch_pause: Duration,
    pub action_gap: Duration,
    pub batch_size: Option<usize>,
    pub retry: RetryPolicy,
    pub verification_passes: u32,
    pub verification_settle: Duration,
    /// Pause `enumeration_pause` after every `enumeration_page` records.
    pub enumeration_page: usize,
    pub enumeration_pause: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Cleanup::default())
    }
}

impl From<&Cleanup> for EngineSettings {
    fn from(cfg: &Cleanup) -> Self {
        Self {
            warmup: Duration::from_secs(cfg.warmup_secs),
            batch_pause: Duration::from_secs(cfg.batch_pause_secs),
            action_gap: Duration::from_millis(cfg.action_gap_ms),
            batch_size: cfg.batch_size,
            retry: RetryPolicy {
                max_quota_attempts: cfg.max_quota_attempts,
                max_wait: Duration::from_secs(cfg.max_quota_wait_secs),
                transient_attempts: cfg.transient_attempts,
                transient_backoff: Duration::from_secs(cfg.transient_backoff_secs),
            },
            verification_passes: cfg.verification_passes,
            verification_settle: Duration::from_secs(cfg.verification_settle_secs),
            enumeration_page: 20,
            enumeration_pause: Duration::from_millis(500),
        }
    }
}

impl EngineSettings {
    /// Same limits, no waiting. For tests and replays against fakes.
    pub fn without_delays() -> Self {
        Self {
            warmup: Duration::ZERO,
            batch_pause: Duration::ZERO,
            action_gap: Duration::ZERO,
            verification_settle: Duration::ZERO,
            enumeration_pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// State the mission reads and writes besides the remote service.
pub struct MissionContext<'m> {
    pub checkpoint: &'m mut CheckpointStore,
    pub preferences: &'m mut PreferenceStore,
    pub pause: &'m dyn Pause,
    pub settings: EngineSettings,
    pub cancel: CancelFlag,
    /// Directory for the run log; `None` skips writing it.
    pub log_dir: Option<PathBuf>,
}

struct Engine<'a> {
    remote: &'a dyn MessagingService,
    pause: &'a dyn Pause,
    checkpoint: &'a mut CheckpointStore,
    settings: &'a EngineSettings,
    cancel: &'a CancelFlag,
    whitelist: Whitelist,
    scheduler: BatchScheduler,
    executor: ActionExecutor<'a>,
    report: ReportBuilder,
}

impl<'a> Engine<'a> {
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, MissionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let policy = &self.settings.retry;
        let mut attempts = 0u32;
        let mut transient = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(RemoteError::Unauthorized(msg)) => return Err(MissionError::Authentication(msg)),
                Err(source @ RemoteError::QuotaExceeded { wait }) => {
                    if attempts >= policy.max_quota_attempts {
                        return Err(MissionError::Remote { operation, source });
                    }
                    let wait = policy.quota_wait(wait);
                    warn!(operation, attempts, wait_secs = wait.as_secs(), "rate limited; waiting");
                    self.pause.pause(wait).await;
                }
                Err(source @ RemoteError::Transient(_)) => {
                    transient += 1;
                    if transient >= policy.transient_attempts {
                        return Err(MissionError::Remote { operation, source });
                    }
                    let delay = policy.transient_delay(transient - 1);
                    warn!(operation, attempts, error = %source, "transient failure; retrying");
                    self.pause.pause(delay).await;
                }
                Err(source) => return Err(MissionError::Remote { operation, source }),
            }
        }
    }

    /// One complete listing, deduplicated by id, in remote order.
    async fn collect(&self) -> RemoteResult<Vec<Classified>> {
        let mut seen = HashSet::new();
        let mut dialogs = Vec::new();
        let mut stream = self.remote.conversations();
        while let Some(raw) = stream.next().await {
            let raw = raw?;
            if !seen.insert(raw.id) {
                continue;
            }
            dialogs.push(classify(&raw));
            if self.settings.enumeration_page > 0 && dialogs.len() % self.settings.enumeration_page == 0 {
                self.pause.pause(self.settings.enumeration_pause).await;
            }
        }
        Ok(dialogs)
    }

    #[instrument(skip_all)]
    async fn enumerate(&self) -> Result<Vec<Classified>, MissionError> {
        let dialogs = self.with_retry("enumeration", move || self.collect()).await?;
        info!(count = dialogs.len(), "conversations enumerated");
        Ok(dialogs)
    }

    /// Record newly seen whitelisted conversations, then dispatch the pass's
    /// workload. The initial pass skips everything already checkpointed;
    /// verification passes resubmit every non-whitelisted survivor.
    async fn process(&mut self, pass: u32, dialogs: &[Classified]) -> Result<PassSummary, MissionError> {
        for dialog in dialogs {
            let conversation = &dialog.conversation;
            if self.checkpoint.is_processed(conversation.id) {
                continue;
            }
            if let Some(matched) = self.whitelist.matches(dialog) {
                self.checkpoint
                    .mark_processed(conversation.id, ActionOutcome::SkippedWhitelisted)
                    .await?;
                self.report.record_whitelisted(pass, conversation, matched);
                info!(id = conversation.id.0, name = %conversation.display_name, ?matched, "whitelisted; keeping");
            }
        }

        let pending = if pass == 0 {
            scheduler::pending(dialogs, self.checkpoint, &self.whitelist)
        } else {
            self.survivors(dialogs)
        };
        if pending.is_empty() {
            return Ok(PassSummary::default());
        }
        let retried = pending
            .iter()
            .filter(|d| self.checkpoint.is_processed(d.conversation.id))
            .count();
        info!(pass, pending = pending.len(), retried, "starting destructive cleanup");
        let batches = self.scheduler.plan(pending);
        self.scheduler
            .run(
                batches,
                self.pause,
                PassContext {
                    pass,
                    executor: &mut self.executor,
                    checkpoint: &mut *self.checkpoint,
                    report: &mut self.report,
                    cancel: self.cancel,
                },
            )
            .await
    }

    fn survivors<'d>(&self, dialogs: &'d [Classified]) -> Vec<&'d Classified> {
        dialogs
            .iter()
            .filter(|d| self.whitelist.matches(d).is_none())
            .collect()
    }

    async fn run(&mut self) -> Result<(MissionStatus, u32), MissionError> {
        let dialogs = self.enumerate().await?;
        self.report.record_scan(&dialogs, &self.whitelist);
        let resumed = dialogs
            .iter()
            .filter(|d| match self.checkpoint.outcome(d.conversation.id) {
                Some(ActionOutcome::SkippedWhitelisted) => self.whitelist.matches(d).is_some(),
                Some(_) => true,
                None => false,
            })
            .count();
        if resumed > 0 {
            info!(resumed, "skipping conversations resolved by a previous run");
        }
        self.report.record_resumed(resumed);

        if self.process(0, &dialogs).await?.cancelled {
            return Ok((MissionStatus::Cancelled, 0));
        }

        let max_passes = self.settings.verification_passes;
        for pass in 1..=max_passes {
            if self.cancel.is_cancelled() {
                return Ok((MissionStatus::Cancelled, pass - 1));
            }
            let dialogs = self.enumerate().await?;
            let survivors = self.survivors(&dialogs);
            if survivors.is_empty() {
                info!(pass, "verification pass clean");
                return Ok((MissionStatus::Clean, pass));
            }
            warn!(pass, remaining = survivors.len(), "verification pass found survivors");
            for dialog in survivors.into_iter().take(5) {
                info!(id = dialog.conversation.id.0, name = %dialog.conversation.display_name, "still present");
            }
            if self.process(pass, &dialogs).await?.cancelled {
                return Ok((MissionStatus::Cancelled, pass));
            }
            self.pause.pause(self.settings.verification_settle).await;
        }

        if self.cancel.is_cancelled() {
            return Ok((MissionStatus::Cancelled, max_passes));
        }
        let dialogs = self.enumerate().await?;
        let remaining = self.survivors(&dialogs).len();
        let status = if remaining == 0 {
            MissionStatus::Clean
        } else {
            warn!(remaining, passes = max_passes, "verification passes exhausted");
            MissionStatus::IncompleteWithRemainder { remaining }
        };
        Ok((status, max_passes))
    }
}

/// Run one cleanup mission.
///
/// `keep` is merged into the stored whitelist for this and future missions.
/// Returns the run report for clean, incomplete and cancelled missions
/// alike; only authentication, storage and unrecoverable enumeration
/// failures are errors.
#[instrument(skip_all, fields(session = %ctx.checkpoint.session()))]
pub async fn run_mission(
    remote: &dyn MessagingService,
    keep: &[String],
    ctx: MissionContext<'_>,
) -> Result<RunReport, MissionError> {
    let MissionContext {
        checkpoint,
        preferences,
        pause,
        settings,
        cancel,
        log_dir,
    } = ctx;

    let added = preferences.merge(keep);
    if added > 0 {
        info!(added, total = preferences.entries().len(), "whitelist extended");
    }
    let session = checkpoint.session().to_string();
    let mut whitelist = preferences.whitelist();

    let executor = ActionExecutor::new(remote, pause, settings.retry.clone(), settings.action_gap);
    let scheduler = BatchScheduler::new(settings.batch_size, settings.warmup, settings.batch_pause);
    let mut engine = Engine {
        remote,
        pause,
        checkpoint,
        settings: &settings,
        cancel: &cancel,
        whitelist: Whitelist::default(),
        scheduler,
        executor,
        report: ReportBuilder::new(&session),
    };

    let account = engine.with_retry("account lookup", move || remote.account_id()).await?;
    whitelist.protect_system(account);
    whitelist.protect_system(SERVICE_NOTIFICATIONS_ID);
    info!(account = account.0, entries = whitelist.len(), "whitelist ready");
    engine.whitelist = whitelist;

    let (status, passes) = engine.run().await?;
    let mut run = engine.report.finish(status, passes);

    preferences.save().await?;
    if let Some(dir) = log_dir {
        run.log_path = Some(report::write_log(&run, &dir)?);
    }

    info!(
        status = ?run.status,
        passes = run.verification_passes,
        dispatched = run.actions_dispatched(),
        errors = run.errors(),
        "mission finished"
    );
    Ok(run)
}
