//! Remote messaging service seam.
//!
//! The engine never talks to the network directly; it consumes the
//! [`MessagingService`] capability set. [`http::GatewayClient`] is the
//! production implementation, tests plug in scripted fakes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::ConversationId;

pub mod http;
pub mod model;

/// Conversation record as the remote service reports it, before classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawConversation {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Broadcast channel.
    #[serde(default)]
    pub is_channel: bool,
    /// Basic group or supergroup.
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_bot: bool,
    /// User account removed by the service.
    #[serde(default)]
    pub is_deleted: bool,
}

/// Successful answer to a destructive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionAck {
    Done,
    /// The conversation was already left, blocked or deleted.
    AlreadyAbsent,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("quota exceeded, retry after {}s", wait.as_secs())]
    QuotaExceeded { wait: Duration },
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote rejected the request: {0}")]
    Permanent(String),
    #[error("remote session is not authorized: {0}")]
    Unauthorized(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Id of the logged-in account (its Saved Messages conversation).
    async fn account_id(&self) -> RemoteResult<ConversationId>;

    /// Every conversation the account participates in. Finite; each call
    /// starts a fresh enumeration.
    fn conversations(&self) -> BoxStream<'_, RemoteResult<RawConversation>>;

    async fn leave(&self, id: ConversationId) -> RemoteResult<ActionAck>;

    async fn block_and_delete(&self, id: ConversationId) -> RemoteResult<ActionAck>;

    async fn delete(&self, id: ConversationId) -> RemoteResult<ActionAck>;
}
