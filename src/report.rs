//! Run summary and the durable per-run log record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::classify::Classified;
use crate::executor::Execution;
use crate::model::{Action, ActionOutcome, Conversation, ConversationId, ConversationKind};
use crate::whitelist::{Whitelist, WhitelistMatch};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MissionStatus {
    /// No non-whitelisted conversation remains.
    Clean,
    /// Verification passes ran out with survivors left.
    IncompleteWithRemainder { remaining: usize },
    /// Stopped by the cancellation flag between conversations.
    Cancelled,
}

impl MissionStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, MissionStatus::Clean)
    }
}

/// One line of the run log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub pass: u32,
    pub conversation_id: ConversationId,
    pub name: String,
    pub kind: ConversationKind,
    /// `None` when nothing was sent to the remote (whitelisted).
    pub action: Option<Action>,
    pub outcome: ActionOutcome,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What the first enumeration saw.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanSummary {
    pub total: usize,
    pub by_kind: BTreeMap<ConversationKind, u64>,
    pub whitelisted_by_kind: BTreeMap<ConversationKind, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub session: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: MissionStatus,
    pub verification_passes: u32,
    pub scan: ScanSummary,
    pub outcomes: BTreeMap<ActionOutcome, u64>,
    pub outcomes_by_kind: BTreeMap<ConversationKind, BTreeMap<ActionOutcome, u64>>,
    /// Conversations skipped because a prior run already resolved them.
    pub resumed: u64,
    pub user_whitelisted: u64,
    pub system_protected: u64,
    pub entries: Vec<LogEntry>,
    #[serde(skip)]
    pub log_path: Option<PathBuf>,
}

impl RunReport {
    pub fn count(&self, kind: ConversationKind, outcome: ActionOutcome) -> u64 {
        self.outcomes_by_kind
            .get(&kind)
            .and_then(|by_outcome| by_outcome.get(&outcome))
            .copied()
            .unwrap_or(0)
    }

    pub fn outcome_total(&self, outcome: ActionOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Destructive calls that actually went out to the remote.
    pub fn actions_dispatched(&self) -> usize {
        self.entries.iter().filter(|e| e.action.is_some()).count()
    }

    pub fn errors(&self) -> u64 {
        self.outcome_total(ActionOutcome::RetriesExhausted) + self.outcome_total(ActionOutcome::Fatal)
    }

    pub fn channels_left(&self) -> u64 {
        self.count(ConversationKind::Channel, ActionOutcome::Success)
    }

    pub fn groups_left(&self) -> u64 {
        self.count(ConversationKind::Group, ActionOutcome::Success)
    }

    pub fn bots_blocked(&self) -> u64 {
        self.count(ConversationKind::Bot, ActionOutcome::Success)
    }

    pub fn private_chats_deleted(&self) -> u64 {
        self.count(ConversationKind::PrivateChat, ActionOutcome::Success)
            + self.count(ConversationKind::DeletedAccountChat, ActionOutcome::Success)
    }

    pub fn remaining(&self) -> usize {
        match self.status {
            MissionStatus::IncompleteWithRemainder { remaining } => remaining,
            _ => 0,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            MissionStatus::Clean => "clean".to_string(),
            MissionStatus::IncompleteWithRemainder { remaining } => {
                format!("incomplete, {remaining} remaining")
            }
            MissionStatus::Cancelled => "cancelled".to_string(),
        };
        writeln!(f, "Mission {} ({status})", self.session)?;
        writeln!(f, "  Chats found:           {}", self.scan.total)?;
        writeln!(f, "  Channels left:         {}", self.channels_left())?;
        writeln!(f, "  Groups left:           {}", self.groups_left())?;
        writeln!(f, "  Bots blocked/deleted:  {}", self.bots_blocked())?;
        writeln!(f, "  Private chats deleted: {}", self.private_chats_deleted())?;
        writeln!(f, "  Already absent:        {}", self.outcome_total(ActionOutcome::SkippedAlreadyAbsent))?;
        writeln!(f, "  Whitelist preserved:   {}", self.user_whitelisted)?;
        writeln!(f, "  System protected:      {}", self.system_protected)?;
        writeln!(f, "  Resumed (skipped):     {}", self.resumed)?;
        writeln!(f, "  Errors:                {}", self.errors())?;
        write!(f, "  Verification passes:   {}", self.verification_passes)
    }
}

/// Accumulates outcomes while the mission runs.
#[derive(Debug)]
pub struct ReportBuilder {
    session: String,
    started_at: DateTime<Utc>,
    scan: ScanSummary,
    outcomes: BTreeMap<ActionOutcome, u64>,
    outcomes_by_kind: BTreeMap<ConversationKind, BTreeMap<ActionOutcome, u64>>,
    resumed: u64,
    user_whitelisted: u64,
    system_protected: u64,
    entries: Vec<LogEntry>,
}

impl ReportBuilder {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            started_at: Utc::now(),
            scan: ScanSummary::default(),
            outcomes: BTreeMap::new(),
            outcomes_by_kind: BTreeMap::new(),
            resumed: 0,
            user_whitelisted: 0,
            system_protected: 0,
            entries: Vec::new(),
        }
    }

    pub fn record_scan(&mut self, dialogs: &[Classified], whitelist: &Whitelist) {
        let mut scan = ScanSummary {
            total: dialogs.len(),
            ..Default::default()
        };
        for dialog in dialogs {
            let kind = dialog.conversation.kind;
            *scan.by_kind.entry(kind).or_default() += 1;
            if whitelist.matches(dialog).is_some() {
                *scan.whitelisted_by_kind.entry(kind).or_default() += 1;
            }
        }
        info!(
            total = scan.total,
            whitelisted = scan.whitelisted_by_kind.values().sum::<u64>(),
            "scan complete"
        );
        self.scan = scan;
    }

    fn push(&mut self, entry: LogEntry) {
        *self.outcomes.entry(entry.outcome).or_default() += 1;
        *self
            .outcomes_by_kind
            .entry(entry.kind)
            .or_default()
            .entry(entry.outcome)
            .or_default() += 1;
        self.entries.push(entry);
    }

    pub fn record(&mut self, pass: u32, conversation: &Conversation, execution: &Execution) {
        self.push(LogEntry {
            timestamp: Utc::now(),
            pass,
            conversation_id: conversation.id,
            name: conversation.display_name.clone(),
            kind: conversation.kind,
            action: Some(execution.action),
            outcome: execution.outcome,
            attempts: execution.attempts,
            detail: execution.detail.clone(),
        });
    }

    pub fn record_whitelisted(&mut self, pass: u32, conversation: &Conversation, matched: WhitelistMatch) {
        let detail = match matched {
            WhitelistMatch::System => {
                self.system_protected += 1;
                Some("system".to_string())
            }
            WhitelistMatch::User => {
                self.user_whitelisted += 1;
                None
            }
        };
        self.push(LogEntry {
            timestamp: Utc::now(),
            pass,
            conversation_id: conversation.id,
            name: conversation.display_name.clone(),
            kind: conversation.kind,
            action: None,
            outcome: ActionOutcome::SkippedWhitelisted,
            attempts: 0,
            detail,
        });
    }

    pub fn record_resumed(&mut self, count: usize) {
        self.resumed += count as u64;
    }

    pub fn finish(self, status: MissionStatus, verification_passes: u32) -> RunReport {
        RunReport {
            session: self.session,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            verification_passes,
            scan: self.scan,
            outcomes: self.outcomes,
            outcomes_by_kind: self.outcomes_by_kind,
            resumed: self.resumed,
            user_whitelisted: self.user_whitelisted,
            system_protected: self.system_protected,
            entries: self.entries,
            log_path: None,
        }
    }
}

/// `cleanup_<session>_<YYYYmmdd_HHMMSS>_<8 hex>.json`
pub fn log_file_name(session: &str, at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "cleanup_{}_{}_{}.json",
        sanitize(session),
        at.format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

fn sanitize(session: &str) -> String {
    session
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Write the report atomically under `dir` and return the final path.
pub fn write_log(report: &RunReport, dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(&report.session, report.finished_at));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, report)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|err| err.error)?;
    info!(path = %path.display(), "run log written");
    Ok(path)
}
