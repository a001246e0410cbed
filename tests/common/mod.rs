#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tg_purge::checkpoint::CheckpointStore;
use tg_purge::db::{self, Pool};
use tg_purge::engine::{self, CancelFlag, EngineSettings, MissionContext, MissionError};
use tg_purge::model::{Action, ConversationId};
use tg_purge::pause::RecordedPause;
use tg_purge::remote::{ActionAck, MessagingService, RawConversation, RemoteError, RemoteResult};
use tg_purge::report::RunReport;
use tg_purge::whitelist::PreferenceStore;

pub const ACCOUNT_ID: i64 = 42;
pub const SESSION: &str = "test_session";

pub async fn setup_pool() -> Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn channel(id: i64, title: &str) -> RawConversation {
    RawConversation {
        id,
        title: Some(title.into()),
        is_channel: true,
        ..Default::default()
    }
}

pub fn group(id: i64, title: &str) -> RawConversation {
    RawConversation {
        id,
        title: Some(title.into()),
        is_group: true,
        ..Default::default()
    }
}

pub fn bot(id: i64, username: &str) -> RawConversation {
    RawConversation {
        id,
        first_name: Some(username.into()),
        username: Some(username.into()),
        is_bot: true,
        ..Default::default()
    }
}

pub fn private(id: i64, name: &str) -> RawConversation {
    RawConversation {
        id,
        first_name: Some(name.into()),
        ..Default::default()
    }
}

pub fn deleted_account(id: i64, name: &str) -> RawConversation {
    RawConversation {
        is_deleted: true,
        ..private(id, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub id: i64,
    pub action: Action,
}

#[derive(Default)]
struct State {
    present: Vec<RawConversation>,
    /// Listings served instead of `present`, oldest first.
    listings: VecDeque<Vec<RawConversation>>,
    enumeration_failures: VecDeque<RemoteError>,
    responses: HashMap<i64, VecDeque<RemoteResult<ActionAck>>>,
    account: Option<RemoteResult<i64>>,
    calls: Vec<Call>,
    enumerations: usize,
    cancel_after: Option<(usize, CancelFlag)>,
}

/// In-memory remote. Successful actions remove the conversation from the
/// account; scripted responses are consumed per conversation in order.
#[derive(Clone, Default)]
pub struct ScriptedRemote {
    state: Arc<Mutex<State>>,
}

impl ScriptedRemote {
    pub fn new(conversations: Vec<RawConversation>) -> Self {
        let remote = Self::default();
        remote.state.lock().unwrap().present = conversations;
        remote
    }

    pub fn respond(&self, id: i64, responses: Vec<RemoteResult<ActionAck>>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .responses
            .entry(id)
            .or_default()
            .extend(responses);
        self
    }

    /// Serve `listing` for the next enumeration instead of the live state.
    pub fn queue_listing(&self, listing: Vec<RawConversation>) -> &Self {
        self.state.lock().unwrap().listings.push_back(listing);
        self
    }

    pub fn fail_enumeration(&self, error: RemoteError) -> &Self {
        self.state.lock().unwrap().enumeration_failures.push_back(error);
        self
    }

    pub fn fail_account(&self, error: RemoteError) -> &Self {
        self.state.lock().unwrap().account = Some(Err(error));
        self
    }

    /// Raise `flag` once `calls` destructive calls went out.
    pub fn cancel_after(&self, calls: usize, flag: CancelFlag) -> &Self {
        self.state.lock().unwrap().cancel_after = Some((calls, flag));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn called_ids(&self) -> Vec<i64> {
        self.calls().into_iter().map(|c| c.id).collect()
    }

    pub fn enumerations(&self) -> usize {
        self.state.lock().unwrap().enumerations
    }

    pub fn present_ids(&self) -> Vec<i64> {
        self.state.lock().unwrap().present.iter().map(|c| c.id).collect()
    }

    fn act(&self, id: ConversationId, action: Action) -> RemoteResult<ActionAck> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call { id: id.0, action });
        if let Some((after, flag)) = &state.cancel_after {
            if state.calls.len() >= *after {
                flag.cancel();
            }
        }

        let scripted = state.responses.get_mut(&id.0).and_then(VecDeque::pop_front);
        let exists = state.present.iter().any(|c| c.id == id.0);
        let result = scripted.unwrap_or(if exists {
            Ok(ActionAck::Done)
        } else {
            Ok(ActionAck::AlreadyAbsent)
        });
        if result.is_ok() {
            state.present.retain(|c| c.id != id.0);
        }
        result
    }
}

#[async_trait]
impl MessagingService for ScriptedRemote {
    async fn account_id(&self) -> RemoteResult<ConversationId> {
        match self.state.lock().unwrap().account.clone() {
            Some(result) => result.map(ConversationId),
            None => Ok(ConversationId(ACCOUNT_ID)),
        }
    }

    fn conversations(&self) -> BoxStream<'_, RemoteResult<RawConversation>> {
        let mut state = self.state.lock().unwrap();
        state.enumerations += 1;
        if let Some(error) = state.enumeration_failures.pop_front() {
            return stream::iter(vec![Err(error)]).boxed();
        }
        let listing = state
            .listings
            .pop_front()
            .unwrap_or_else(|| state.present.clone());
        stream::iter(listing.into_iter().map(Ok)).boxed()
    }

    async fn leave(&self, id: ConversationId) -> RemoteResult<ActionAck> {
        self.act(id, Action::Leave)
    }

    async fn block_and_delete(&self, id: ConversationId) -> RemoteResult<ActionAck> {
        self.act(id, Action::BlockAndDelete)
    }

    async fn delete(&self, id: ConversationId) -> RemoteResult<ActionAck> {
        self.act(id, Action::Delete)
    }
}

/// Everything one mission needs apart from the remote.
pub struct Harness {
    pub pool: Pool,
    pub pause: RecordedPause,
    pub settings: EngineSettings,
    pub cancel: CancelFlag,
    pub log_dir: Option<PathBuf>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_pool(setup_pool().await)
    }

    pub fn with_pool(pool: Pool) -> Self {
        Self {
            pool,
            pause: RecordedPause::new(),
            settings: EngineSettings::without_delays(),
            cancel: CancelFlag::new(),
            log_dir: None,
        }
    }

    pub async fn checkpoint(&self) -> CheckpointStore {
        CheckpointStore::load(self.pool.clone(), SESSION).await.unwrap()
    }

    /// Run a mission with stores freshly loaded from the pool.
    pub async fn run(
        &self,
        remote: &ScriptedRemote,
        keep: &[&str],
    ) -> Result<RunReport, MissionError> {
        let mut checkpoint = self.checkpoint().await;
        let mut preferences = PreferenceStore::load(self.pool.clone(), SESSION).await.unwrap();
        let keep: Vec<String> = keep.iter().map(|s| s.to_string()).collect();
        engine::run_mission(
            remote,
            &keep,
            MissionContext {
                checkpoint: &mut checkpoint,
                preferences: &mut preferences,
                pause: &self.pause,
                settings: self.settings.clone(),
                cancel: self.cancel.clone(),
                log_dir: self.log_dir.clone(),
            },
        )
        .await
    }
}
