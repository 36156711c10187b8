// ABOUTME: Slack Web API transport implementing digest-core's WorkspaceApi over reqwest
// ABOUTME: One HTTP request per call; retries, caching and pagination live in the core gateway

pub mod wire;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digest_core::config::{GatewaySettings, WorkspaceCredential};
use digest_core::error::{ApiError, ApiResult, DigestError};
use digest_core::service::ApiConnector;
use digest_core::traits::{
    format_ts, Conversation, ConversationFilter, ConversationKind, Identity, Message, Page, User,
    WorkspaceApi,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use self::wire::{
    next_cursor, AuthTest, ConversationsList, MessageList, PostedMessage, SearchResponse, UsersList,
};

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// conversations.list page size (Slack's documented maximum is 1000, 200 is the recommended value)
const CONVERSATION_PAGE_SIZE: usize = 200;
const USER_PAGE_SIZE: usize = 200;

/// Slack Web API client bound to one user token.
#[derive(Clone)]
pub struct SlackWebApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

// Custom Debug impl to redact token
impl std::fmt::Debug for SlackWebApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackWebApi")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl SlackWebApi {
    pub fn new(token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("slack-digest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
        })
    }

    /// Point the client at another API root (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// POST a form-encoded Web API method and decode the `ok` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &[(&str, String)],
    ) -> ApiResult<T> {
        let url = format!("{}/{}", self.base_url, method);
        tracing::trace!(method, "Slack API request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .form(params)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        let retry_after = retry_after_from_headers(response.headers());
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(ApiError::rejected(
                format!("http_{}", status.as_u16()),
                format!("{} returned HTTP {}", method, status),
            ));
        }

        let body = response.bytes().await.map_err(|e| ApiError::timeout(e.to_string()))?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| ApiError::rejected("invalid_response", e.to_string()))?;

        if !value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            if error == "ratelimited" {
                return Err(ApiError::RateLimited { retry_after });
            }
            return Err(ApiError::rejected(error, describe_error(error, &value)));
        }

        serde_json::from_value(value)
            .map_err(|e| ApiError::rejected("invalid_response", e.to_string()))
    }
}

/// A request that never connected provably had no effect upstream.
fn send_error(err: reqwest::Error) -> ApiError {
    if err.is_connect() {
        ApiError::connect(err.to_string())
    } else {
        ApiError::timeout(err.to_string())
    }
}

/// Parse Retry-After as whole seconds.
fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs))
}

fn describe_error(error: &str, body: &Value) -> String {
    match error {
        "missing_scope" => {
            let needed = body.get("needed").and_then(Value::as_str).unwrap_or("unknown");
            format!("token is missing the '{}' scope", needed)
        }
        "not_in_channel" => "not a member of this conversation".to_string(),
        "channel_not_found" => "conversation not found or not visible to this token".to_string(),
        "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => {
            "token was rejected; check the workspace configuration".to_string()
        }
        other => other.replace('_', " "),
    }
}

fn conversation_types(filter: ConversationFilter) -> String {
    filter
        .kinds()
        .iter()
        .map(|kind| match kind {
            ConversationKind::Channel => "public_channel",
            ConversationKind::Group => "private_channel",
            ConversationKind::DirectMessage => "im",
            ConversationKind::MultiPersonDm => "mpim",
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn with_cursor(
    mut params: Vec<(&'static str, String)>,
    cursor: Option<&str>,
) -> Vec<(&'static str, String)> {
    if let Some(cursor) = cursor {
        params.push(("cursor", cursor.to_string()));
    }
    params
}

#[async_trait]
impl WorkspaceApi for SlackWebApi {
    async fn identity(&self) -> ApiResult<Identity> {
        let auth: AuthTest = self.call("auth.test", &[]).await?;
        Ok(Identity {
            user_id: auth.user_id,
            handle: auth.user,
        })
    }

    async fn list_conversations(
        &self,
        filter: ConversationFilter,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Conversation>> {
        let params = with_cursor(
            vec![
                ("types", conversation_types(filter)),
                ("exclude_archived", "true".to_string()),
                ("limit", CONVERSATION_PAGE_SIZE.to_string()),
            ],
            cursor,
        );
        let list: ConversationsList = self.call("conversations.list", &params).await?;
        let next = next_cursor(&list.response_metadata);
        let items = list
            .channels
            .into_iter()
            .map(|c| c.into_conversation())
            // types= already filters, but some workspaces report mpims as private channels
            .filter(|c| filter.matches(c.kind))
            .collect();
        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>> {
        let mut params = vec![
            ("channel", conversation_id.to_string()),
            ("limit", page_size.to_string()),
        ];
        if let Some(since) = since {
            params.push(("oldest", format_ts(since)));
        }
        let params = with_cursor(params, cursor);
        let list: MessageList = self.call("conversations.history", &params).await?;
        let next = next_cursor(&list.response_metadata);
        let items = list
            .messages
            .into_iter()
            .filter(|m| !m.is_system())
            .map(|m| m.into_message(conversation_id))
            .collect();
        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    async fn list_replies(
        &self,
        conversation_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>> {
        let params = with_cursor(
            vec![
                ("channel", conversation_id.to_string()),
                ("ts", thread_ts.to_string()),
                ("limit", page_size.to_string()),
            ],
            cursor,
        );
        let list: MessageList = self.call("conversations.replies", &params).await?;
        let next = next_cursor(&list.response_metadata);
        let items = list
            .messages
            .into_iter()
            .map(|m| m.into_message(conversation_id))
            .collect();
        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    /// search.messages pages by number; the cursor carries the page.
    async fn search(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>> {
        let page = cursor.and_then(|c| c.parse::<u32>().ok()).unwrap_or(1);
        let params = [
            ("query", query.to_string()),
            ("count", page_size.to_string()),
            ("page", page.to_string()),
            ("sort", "timestamp".to_string()),
            ("sort_dir", "desc".to_string()),
        ];
        let response: SearchResponse = self.call("search.messages", &params).await?;
        let next = response
            .messages
            .paging
            .as_ref()
            .and_then(|p| p.next_page())
            .map(|p| p.to_string());
        let items = response
            .messages
            .matches
            .into_iter()
            .filter(|m| m.channel.is_some())
            .map(|m| m.into_message())
            .collect();
        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> ApiResult<String> {
        let mut params = vec![
            ("channel", conversation_id.to_string()),
            ("text", text.to_string()),
        ];
        if let Some(thread_ts) = thread_ts {
            params.push(("thread_ts", thread_ts.to_string()));
        }
        let posted: PostedMessage = self.call("chat.postMessage", &params).await?;
        Ok(posted.ts)
    }

    async fn add_reaction(&self, conversation_id: &str, ts: &str, emoji: &str) -> ApiResult<()> {
        let params = [
            ("channel", conversation_id.to_string()),
            ("timestamp", ts.to_string()),
            ("name", emoji.to_string()),
        ];
        match self.call::<Value>("reactions.add", &params).await {
            Ok(_) => Ok(()),
            // The reaction is there either way
            Err(ApiError::Rejected { status, .. }) if status == "already_reacted" => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_users(&self, cursor: Option<&str>) -> ApiResult<Page<User>> {
        let params = with_cursor(vec![("limit", USER_PAGE_SIZE.to_string())], cursor);
        let list: UsersList = self.call("users.list", &params).await?;
        let next = next_cursor(&list.response_metadata);
        Ok(Page {
            items: list.members.into_iter().map(|u| u.into_user()).collect(),
            next_cursor: next,
        })
    }
}

/// Connects workspaces to the Slack Web API.
#[derive(Debug, Clone, Default)]
pub struct SlackConnector {
    base_url: Option<String>,
}

impl SlackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
        }
    }
}

impl ApiConnector for SlackConnector {
    fn connect(
        &self,
        credential: &WorkspaceCredential,
        settings: &GatewaySettings,
    ) -> digest_core::Result<Arc<dyn WorkspaceApi>> {
        let mut api = SlackWebApi::new(credential.token.clone(), settings.request_timeout)
            .map_err(|e| {
                DigestError::configuration(format!(
                    "HTTP client for '{}': {}",
                    credential.id, e
                ))
            })?;
        if let Some(base_url) = &self.base_url {
            api = api.with_base_url(base_url.clone());
        }
        tracing::debug!(
            workspace = %credential.id,
            base_url = %api.base_url,
            "Connected Slack Web API"
        );
        Ok(Arc::new(api))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_conversation_types_follow_filter() {
        assert_eq!(
            conversation_types(ConversationFilter::All),
            "public_channel,private_channel,im,mpim"
        );
        assert_eq!(conversation_types(ConversationFilter::DirectMessages), "im,mpim");
        assert_eq!(conversation_types(ConversationFilter::Groups), "private_channel,mpim");
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    #[test]
    fn test_describe_missing_scope() {
        let body =
            serde_json::json!({"ok": false, "error": "missing_scope", "needed": "im:history"});
        assert_eq!(
            describe_error("missing_scope", &body),
            "token is missing the 'im:history' scope"
        );
        assert_eq!(describe_error("is_archived", &body), "is archived");
    }

    #[test]
    fn test_debug_redacts_token() {
        let api = SlackWebApi::new("xoxp-secret", Duration::from_secs(5)).unwrap();
        assert!(!format!("{:?}", api).contains("xoxp-secret"));
    }
}
