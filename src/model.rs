use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a conversation as reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ConversationId {
    fn from(value: i64) -> Self {
        ConversationId(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Channel,
    Group,
    Bot,
    PrivateChat,
    DeletedAccountChat,
}

impl ConversationKind {
    pub const ALL: [ConversationKind; 5] = [
        ConversationKind::Channel,
        ConversationKind::Group,
        ConversationKind::Bot,
        ConversationKind::PrivateChat,
        ConversationKind::DeletedAccountChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Channel => "channel",
            ConversationKind::Group => "group",
            ConversationKind::Bot => "bot",
            ConversationKind::PrivateChat => "private_chat",
            ConversationKind::DeletedAccountChat => "deleted_account_chat",
        }
    }

    /// The destructive action that detaches the account from this kind.
    pub fn action(&self) -> Action {
        match self {
            ConversationKind::Channel | ConversationKind::Group => Action::Leave,
            ConversationKind::Bot => Action::BlockAndDelete,
            ConversationKind::PrivateChat | ConversationKind::DeletedAccountChat => Action::Delete,
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Leave,
    BlockAndDelete,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Leave => "leave",
            Action::BlockAndDelete => "block_and_delete",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    SkippedWhitelisted,
    SkippedAlreadyAbsent,
    RetriesExhausted,
    Fatal,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Success => "success",
            ActionOutcome::SkippedWhitelisted => "skipped_whitelisted",
            ActionOutcome::SkippedAlreadyAbsent => "skipped_already_absent",
            ActionOutcome::RetriesExhausted => "retries_exhausted",
            ActionOutcome::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ActionOutcome::Success),
            "skipped_whitelisted" => Some(ActionOutcome::SkippedWhitelisted),
            "skipped_already_absent" => Some(ActionOutcome::SkippedAlreadyAbsent),
            "retries_exhausted" => Some(ActionOutcome::RetriesExhausted),
            "fatal" => Some(ActionOutcome::Fatal),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ActionOutcome::RetriesExhausted | ActionOutcome::Fatal)
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified conversation. Produced once by the classifier; everything
/// downstream dispatches on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub display_name: String,
    pub username: Option<String>,
    pub link: Option<String>,
}
