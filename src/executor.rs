//! Performs one destructive action with bounded retry.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::{Action, ActionOutcome, Conversation};
use crate::pause::Pause;
use crate::remote::{ActionAck, MessagingService, RemoteError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed while the remote keeps signalling quota.
    pub max_quota_attempts: u32,
    /// Upper bound for any single back-off sleep.
    pub max_wait: Duration,
    /// Total attempts allowed for transient failures.
    pub transient_attempts: u32,
    /// Base of the exponential transient back-off.
    pub transient_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_quota_attempts: 10,
            max_wait: Duration::from_secs(300),
            transient_attempts: 3,
            transient_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn quota_wait(&self, suggested: Duration) -> Duration {
        suggested.min(self.max_wait)
    }

    /// `transient_backoff * 2^failures`, capped at `max_wait`.
    pub fn transient_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.transient_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }
}

/// Gap inserted before each destructive call. Widens after a quota signal,
/// narrows again while calls succeed.
#[derive(Debug, Clone)]
pub struct Pacer {
    base_gap: Duration,
    multiplier: f64,
}

const PACER_BACKOFF: f64 = 2.2;
const PACER_COOLDOWN: f64 = 0.85;
const PACER_MAX_MULTIPLIER: f64 = 10.0;

impl Pacer {
    pub fn new(base_gap: Duration) -> Self {
        Self {
            base_gap,
            multiplier: 1.0,
        }
    }

    pub fn gap(&self) -> Duration {
        self.base_gap.mul_f64(self.multiplier)
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn backoff(&mut self) {
        self.multiplier = (self.multiplier * PACER_BACKOFF).min(PACER_MAX_MULTIPLIER);
    }

    pub fn cooldown(&mut self) {
        self.multiplier = (self.multiplier * PACER_COOLDOWN).max(1.0);
    }
}

/// Result of running one conversation through the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub action: Action,
    pub outcome: ActionOutcome,
    pub attempts: u32,
    pub detail: Option<String>,
}

/// The remote session is unusable; the mission must stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unauthorized(pub String);

pub struct ActionExecutor<'a> {
    remote: &'a dyn MessagingService,
    pause: &'a dyn Pause,
    policy: RetryPolicy,
    pacer: Pacer,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(
        remote: &'a dyn MessagingService,
        pause: &'a dyn Pause,
        policy: RetryPolicy,
        action_gap: Duration,
    ) -> Self {
        Self {
            remote,
            pause,
            policy,
            pacer: Pacer::new(action_gap),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    async fn dispatch(&self, conversation: &Conversation, action: Action) -> Result<ActionAck, RemoteError> {
        match action {
            Action::Leave => self.remote.leave(conversation.id).await,
            Action::BlockAndDelete => self.remote.block_and_delete(conversation.id).await,
            Action::Delete => self.remote.delete(conversation.id).await,
        }
    }

    /// Run the kind-appropriate action until it resolves. Only an
    /// authorization failure escapes; everything else becomes an outcome.
    pub async fn execute(&mut self, conversation: &Conversation) -> Result<Execution, Unauthorized> {
        let action = conversation.kind.action();
        let id = conversation.id.0;
        let kind = conversation.kind.as_str();
        let mut attempts = 0u32;
        let mut transient_failures = 0u32;

        let finish = |outcome, attempts, detail| Execution {
            action,
            outcome,
            attempts,
            detail,
        };

        loop {
            attempts += 1;
            self.pause.pause(self.pacer.gap()).await;

            match self.dispatch(conversation, action).await {
                Ok(ActionAck::Done) => {
                    self.pacer.cooldown();
                    info!(id, kind, action = action.as_str(), attempts, name = %conversation.display_name, "conversation cleaned");
                    return Ok(finish(ActionOutcome::Success, attempts, None));
                }
                Ok(ActionAck::AlreadyAbsent) => {
                    debug!(id, kind, "conversation already absent");
                    return Ok(finish(ActionOutcome::SkippedAlreadyAbsent, attempts, None));
                }
                Err(RemoteError::QuotaExceeded { wait }) => {
                    self.pacer.backoff();
                    if attempts >= self.policy.max_quota_attempts {
                        warn!(id, kind, attempts, "quota retries exhausted");
                        return Ok(finish(
                            ActionOutcome::RetriesExhausted,
                            attempts,
                            Some(format!("quota exceeded after {attempts} attempts")),
                        ));
                    }
                    let wait = self.policy.quota_wait(wait);
                    warn!(id, kind, attempts, wait_secs = wait.as_secs(), "rate limited; backing off");
                    self.pause.pause(wait).await;
                }
                Err(RemoteError::Transient(msg)) => {
                    transient_failures += 1;
                    if transient_failures >= self.policy.transient_attempts {
                        warn!(id, kind, attempts, error = %msg, "transient failures exhausted");
                        return Ok(finish(ActionOutcome::Fatal, attempts, Some(msg)));
                    }
                    let delay = self.policy.transient_delay(transient_failures - 1);
                    warn!(id, kind, attempts, delay_secs = delay.as_secs(), error = %msg, "transient failure; retrying");
                    self.pause.pause(delay).await;
                }
                Err(RemoteError::Permanent(msg)) => {
                    warn!(id, kind, attempts, error = %msg, "action rejected");
                    return Ok(finish(ActionOutcome::Fatal, attempts, Some(msg)));
                }
                Err(RemoteError::Unauthorized(msg)) => return Err(Unauthorized(msg)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationId, ConversationKind};
    use crate::pause::RecordedPause;
    use crate::remote::{RawConversation, RemoteResult};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<RemoteResult<ActionAck>>>,
        calls: Mutex<Vec<(&'static str, i64)>>,
    }

    impl Scripted {
        fn with(responses: Vec<RemoteResult<ActionAck>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn answer(&self, call: &'static str, id: ConversationId) -> RemoteResult<ActionAck> {
            self.calls.lock().unwrap().push((call, id.0));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ActionAck::Done))
        }

        fn calls(&self) -> Vec<(&'static str, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingService for Scripted {
        async fn account_id(&self) -> RemoteResult<ConversationId> {
            Ok(ConversationId(1))
        }

        fn conversations(&self) -> BoxStream<'_, RemoteResult<RawConversation>> {
            stream::empty().boxed()
        }

        async fn leave(&self, id: ConversationId) -> RemoteResult<ActionAck> {
            self.answer("leave", id)
        }

        async fn block_and_delete(&self, id: ConversationId) -> RemoteResult<ActionAck> {
            self.answer("block_and_delete", id)
        }

        async fn delete(&self, id: ConversationId) -> RemoteResult<ActionAck> {
            self.answer("delete", id)
        }
    }

    fn conversation(kind: ConversationKind) -> Conversation {
        Conversation {
            id: ConversationId(50),
            kind,
            display_name: "B".into(),
            username: None,
            link: None,
        }
    }

    fn quota(secs: u64) -> RemoteResult<ActionAck> {
        Err(RemoteError::QuotaExceeded {
            wait: Duration::from_secs(secs),
        })
    }

    #[tokio::test]
    async fn picks_action_by_kind() {
        let remote = Scripted::default();
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);
        for kind in ConversationKind::ALL {
            exec.execute(&conversation(kind)).await.unwrap();
        }
        let calls: Vec<_> = remote.calls().into_iter().map(|(c, _)| c).collect();
        assert_eq!(
            calls,
            vec!["leave", "leave", "block_and_delete", "delete", "delete"]
        );
    }

    #[tokio::test]
    async fn quota_then_success_sleeps_suggested_wait() {
        let remote = Scripted::with(vec![quota(30), Ok(ActionAck::Done)]);
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);

        let res = exec.execute(&conversation(ConversationKind::Group)).await.unwrap();
        assert_eq!(res.outcome, ActionOutcome::Success);
        assert_eq!(res.attempts, 2);
        assert!(pause.requested().contains(&Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn quota_is_bounded_and_waits_are_capped() {
        let remote = Scripted::with((0..20).map(|_| quota(3600)).collect());
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);

        let res = exec.execute(&conversation(ConversationKind::Channel)).await.unwrap();
        assert_eq!(res.outcome, ActionOutcome::RetriesExhausted);
        assert_eq!(res.attempts, 10);
        assert_eq!(remote.calls().len(), 10);
        assert!(pause
            .requested()
            .iter()
            .all(|d| *d <= Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn already_absent_is_not_an_error() {
        let remote = Scripted::with(vec![Ok(ActionAck::AlreadyAbsent)]);
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);
        let res = exec.execute(&conversation(ConversationKind::Bot)).await.unwrap();
        assert_eq!(res.outcome, ActionOutcome::SkippedAlreadyAbsent);
        assert_eq!(res.detail, None);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_become_fatal() {
        let remote = Scripted::with(vec![
            Err(RemoteError::Transient("reset".into())),
            Err(RemoteError::Transient("reset".into())),
            Err(RemoteError::Transient("reset".into())),
        ]);
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);
        let res = exec.execute(&conversation(ConversationKind::PrivateChat)).await.unwrap();
        assert_eq!(res.outcome, ActionOutcome::Fatal);
        assert_eq!(res.attempts, 3);
        assert!(pause.requested().contains(&Duration::from_secs(30)));
        assert!(pause.requested().contains(&Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn permanent_failure_is_fatal_without_retry() {
        let remote = Scripted::with(vec![Err(RemoteError::Permanent("CHAT_ADMIN_REQUIRED".into()))]);
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);
        let res = exec.execute(&conversation(ConversationKind::Group)).await.unwrap();
        assert_eq!(res.outcome, ActionOutcome::Fatal);
        assert_eq!(res.attempts, 1);
        assert_eq!(res.detail.as_deref(), Some("CHAT_ADMIN_REQUIRED"));
    }

    #[tokio::test]
    async fn unauthorized_escapes() {
        let remote = Scripted::with(vec![Err(RemoteError::Unauthorized("AUTH_KEY_UNREGISTERED".into()))]);
        let pause = RecordedPause::new();
        let mut exec = ActionExecutor::new(&remote, &pause, RetryPolicy::default(), Duration::ZERO);
        let err = exec.execute(&conversation(ConversationKind::Group)).await.unwrap_err();
        assert_eq!(err, Unauthorized("AUTH_KEY_UNREGISTERED".into()));
    }

    #[test]
    fn pacer_widens_and_recovers() {
        let mut pacer = Pacer::new(Duration::from_millis(500));
        pacer.backoff();
        assert!(pacer.gap() > Duration::from_millis(1000));
        for _ in 0..10 {
            pacer.backoff();
        }
        assert_eq!(pacer.multiplier(), 10.0);
        for _ in 0..100 {
            pacer.cooldown();
        }
        assert_eq!(pacer.multiplier(), 1.0);
        assert_eq!(pacer.gap(), Duration::from_millis(500));
    }

    #[test]
    fn transient_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.transient_delay(0), Duration::from_secs(30));
        assert_eq!(policy.transient_delay(2), Duration::from_secs(120));
        assert_eq!(policy.transient_delay(20), Duration::from_secs(300));
        assert_eq!(policy.quota_wait(Duration::from_secs(900)), Duration::from_secs(300));
    }
}
