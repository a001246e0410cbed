//! JSON-over-HTTP adapter for a user-session gateway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::model::{AccountResponse, DialogPage, ErrorBody};
use super::{ActionAck, MessagingService, RawConversation, RemoteError, RemoteResult};
use crate::config;
use crate::model::{Action, ConversationId};

pub const PAGE_LIMIT: u32 = 100;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    pub fn new(mut base_url: Url, token: String, timeout: Duration) -> Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("tg-purge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(remote: &config::Remote) -> Result<Self> {
        let base_url = Url::parse(&remote.base_url).context("invalid remote.base_url")?;
        Self::new(
            base_url,
            remote.token.clone(),
            Duration::from_secs(remote.timeout_secs),
        )
    }

    fn endpoint(&self, path: &str) -> RemoteResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Permanent(format!("invalid endpoint {path}: {e}")))
    }

    pub fn build_action_request(
        &self,
        id: ConversationId,
        action: Action,
    ) -> RemoteResult<reqwest::Request> {
        let endpoint = self.endpoint(&format!("v1/dialogs/{id}/{}", action_segment(action)))?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .build()
            .map_err(|e| RemoteError::Permanent(format!("failed to build request: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> RemoteResult<T> {
        debug!(url = %url, "gateway GET");
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        if !res.status().is_success() {
            return Err(failure_from(res).await);
        }
        res.json::<T>().await.map_err(transport_error)
    }

    async fn fetch_page(&self, offset: u64) -> RemoteResult<DialogPage> {
        let mut url = self.endpoint("v1/dialogs")?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &PAGE_LIMIT.to_string());
        self.get_json(url).await
    }

    async fn act(&self, id: ConversationId, action: Action) -> RemoteResult<ActionAck> {
        let request = self.build_action_request(id, action)?;
        debug!(url = %request.url(), %action, "gateway POST");
        let res = self.http.execute(request).await.map_err(transport_error)?;
        let status = res.status();
        if status.is_success() {
            return Ok(ActionAck::Done);
        }
        let header = retry_after_header(&res);
        let body = res.text().await.unwrap_or_default();
        let mapped = map_action_status(status, header, &body);
        if let Err(err) = &mapped {
            warn!(%id, %action, status = status.as_u16(), error = %err, "gateway action failed");
        }
        mapped
    }
}

fn action_segment(action: Action) -> &'static str {
    match action {
        Action::Leave => "leave",
        Action::BlockAndDelete => "block_delete",
        Action::Delete => "delete",
    }
}

fn retry_after_header(res: &Response) -> Option<u64> {
    res.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn failure_from(res: Response) -> RemoteError {
    let status = res.status();
    let header = retry_after_header(&res);
    let body = res.text().await.unwrap_or_default();
    map_failure(status, header, &body)
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Permanent(format!("malformed gateway response: {err}"))
    } else {
        RemoteError::Transient(err.to_string())
    }
}

/// Outcome of a destructive call given a non-2xx answer.
pub fn map_action_status(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> RemoteResult<ActionAck> {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
        || parsed.error.as_deref() == Some("already_absent")
    {
        return Ok(ActionAck::AlreadyAbsent);
    }
    Err(map_failure(status, retry_after, body))
}

/// Error class of a non-2xx answer.
pub fn map_failure(status: StatusCode, retry_after: Option<u64>, body: &str) -> RemoteError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let detail = parsed
        .description
        .or(parsed.error)
        .unwrap_or_else(|| body.trim().to_string());
    let detail = format!("{} {}", status.as_u16(), detail).trim_end().to_string();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = parsed
            .retry_after
            .or(retry_after)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return RemoteError::QuotaExceeded { wait };
    }
    if status == StatusCode::UNAUTHORIZED {
        return RemoteError::Unauthorized(detail);
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return RemoteError::Transient(detail);
    }
    RemoteError::Permanent(detail)
}

#[async_trait]
impl MessagingService for GatewayClient {
    async fn account_id(&self) -> RemoteResult<ConversationId> {
        let url = self.endpoint("v1/account")?;
        let account: AccountResponse = self.get_json(url).await?;
        Ok(ConversationId(account.id))
    }

    fn conversations(&self) -> BoxStream<'_, RemoteResult<RawConversation>> {
        stream::try_unfold(Some(0u64), move |offset| async move {
            let Some(offset) = offset else {
                return Ok(None);
            };
            let page = self.fetch_page(offset).await?;
            debug!(offset, count = page.dialogs.len(), next = ?page.next_offset, "dialog page");
            let next = page
                .next_offset
                .filter(|next| *next > offset && !page.dialogs.is_empty());
            let items = stream::iter(page.dialogs.into_iter().map(Ok::<_, RemoteError>));
            Ok(Some((items, next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn leave(&self, id: ConversationId) -> RemoteResult<ActionAck> {
        self.act(id, Action::Leave).await
    }

    async fn block_and_delete(&self, id: ConversationId) -> RemoteResult<ActionAck> {
        self.act(id, Action::BlockAndDelete).await
    }

    async fn delete(&self, id: ConversationId) -> RemoteResult<ActionAck> {
        self.act(id, Action::Delete).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> GatewayClient {
        GatewayClient::new(Url::parse(base).unwrap(), "secret".into(), Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn action_request_targets_dialog_endpoint() {
        let c = client("http://gw.local/api");
        let req = c
            .build_action_request(ConversationId(-1001), Action::BlockAndDelete)
            .unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "http://gw.local/api/v1/dialogs/-1001/block_delete");
        let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert_eq!(auth, "Bearer secret");
    }

    #[test]
    fn debug_hides_token() {
        let c = client("http://gw.local/");
        let printed = format!("{c:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("gw.local"));
    }

    #[test]
    fn quota_wait_prefers_body_then_header() {
        let body = r#"{"error":"flood_wait","retry_after":42}"#;
        assert_eq!(
            map_failure(StatusCode::TOO_MANY_REQUESTS, Some(7), body),
            RemoteError::QuotaExceeded { wait: Duration::from_secs(42) }
        );
        assert_eq!(
            map_failure(StatusCode::TOO_MANY_REQUESTS, Some(7), ""),
            RemoteError::QuotaExceeded { wait: Duration::from_secs(7) }
        );
        assert_eq!(
            map_failure(StatusCode::TOO_MANY_REQUESTS, None, "slow down"),
            RemoteError::QuotaExceeded { wait: DEFAULT_RETRY_AFTER }
        );
    }

    #[test]
    fn status_classes() {
        assert!(matches!(
            map_failure(StatusCode::UNAUTHORIZED, None, ""),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            map_failure(StatusCode::BAD_GATEWAY, None, ""),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            map_failure(StatusCode::FORBIDDEN, None, r#"{"description":"CHAT_ADMIN_REQUIRED"}"#),
            RemoteError::Permanent(msg) if msg.contains("CHAT_ADMIN_REQUIRED")
        ));
    }

    #[test]
    fn absent_targets_are_not_errors() {
        assert_eq!(
            map_action_status(StatusCode::NOT_FOUND, None, ""),
            Ok(ActionAck::AlreadyAbsent)
        );
        assert_eq!(
            map_action_status(StatusCode::GONE, None, ""),
            Ok(ActionAck::AlreadyAbsent)
        );
        assert_eq!(
            map_action_status(StatusCode::BAD_REQUEST, None, r#"{"error":"already_absent"}"#),
            Ok(ActionAck::AlreadyAbsent)
        );
        assert!(map_action_status(StatusCode::BAD_REQUEST, None, "{}").is_err());
    }
}
