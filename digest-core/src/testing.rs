// ABOUTME: Scripted in-memory workspace for tests - serves canned conversations and messages.
// ABOUTME: Can inject rate limits, permission errors, write timeouts and latency; counts calls.
//!
//! # Example
//!
//! ```no_run
//! use digest_core::testing::ScriptedWorkspace;
//! use digest_core::traits::{Conversation, ConversationKind, Message};
//! use digest_core::error::ApiError;
//!
//! let api = ScriptedWorkspace::new("U_ME", "me")
//!     .with_conversation(
//!         Conversation::new("C1", ConversationKind::Channel, "#general"),
//!         vec![Message::new("C1", "1700000000.000100", Some("U2"), "hello <@U_ME>")],
//!     )
//!     .rate_limit("conversations.history", 2, None)
//!     .fail_history("C2", ApiError::rejected("not_in_channel", "not a member"));
//! assert_eq!(api.calls("conversations.history"), 0);
//! ```

use crate::config::{GatewaySettings, WorkspaceCredential};
use crate::error::{ApiError, ApiResult, DigestError, Result};
use crate::service::ApiConnector;
use crate::traits::{
    format_ts, Conversation, ConversationFilter, Identity, Message, Page, User, WorkspaceApi,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const AUTH_TEST: &str = "auth.test";
pub const CONVERSATIONS_LIST: &str = "conversations.list";
pub const CONVERSATIONS_HISTORY: &str = "conversations.history";
pub const CONVERSATIONS_REPLIES: &str = "conversations.replies";
pub const SEARCH_MESSAGES: &str = "search.messages";
pub const CHAT_POST_MESSAGE: &str = "chat.postMessage";
pub const REACTIONS_ADD: &str = "reactions.add";
pub const USERS_LIST: &str = "users.list";

/// A message accepted by `post_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub conversation_id: String,
    pub text: String,
    pub thread_ts: Option<String>,
    pub ts: String,
}

/// A reaction accepted by `add_reaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedReaction {
    pub conversation_id: String,
    pub ts: String,
    pub emoji: String,
}

/// In-memory `WorkspaceApi` driven by a script built up front.
pub struct ScriptedWorkspace {
    identity: Identity,
    conversations: Vec<Conversation>,
    conversation_page_size: usize,
    history: HashMap<String, Vec<Message>>,
    threads: HashMap<(String, String), Vec<Message>>,
    search_results: Vec<Message>,
    users: Vec<User>,
    history_failures: HashMap<String, ApiError>,
    history_delays: HashMap<String, Duration>,
    rate_limits: Mutex<HashMap<&'static str, VecDeque<Option<Duration>>>>,
    listing_failure: Mutex<Option<ApiError>>,
    write_failure: Mutex<Option<ApiError>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    posted: Mutex<Vec<PostedMessage>>,
    reactions: Mutex<Vec<AddedReaction>>,
    next_ts: AtomicU64,
}

impl ScriptedWorkspace {
    /// Workspace acting as `user_id` / `handle` with nothing in it.
    pub fn new(user_id: &str, handle: &str) -> Self {
        Self {
            identity: Identity {
                user_id: user_id.to_string(),
                handle: handle.to_string(),
            },
            conversations: Vec::new(),
            conversation_page_size: 100,
            history: HashMap::new(),
            threads: HashMap::new(),
            search_results: Vec::new(),
            users: Vec::new(),
            history_failures: HashMap::new(),
            history_delays: HashMap::new(),
            rate_limits: Mutex::new(HashMap::new()),
            listing_failure: Mutex::new(None),
            write_failure: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
            posted: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            next_ts: AtomicU64::new(1_800_000_000),
        }
    }

    /// Add a conversation and its history (any order).
    pub fn with_conversation(mut self, conversation: Conversation, messages: Vec<Message>) -> Self {
        self.history.insert(conversation.id.clone(), messages);
        self.conversations.push(conversation);
        self
    }

    /// Replies of the thread rooted at `root_ts`, root message included.
    pub fn with_thread(
        mut self,
        conversation_id: &str,
        root_ts: &str,
        messages: Vec<Message>,
    ) -> Self {
        self.threads
            .insert((conversation_id.to_string(), root_ts.to_string()), messages);
        self
    }

    pub fn with_search_results(mut self, messages: Vec<Message>) -> Self {
        self.search_results = messages;
        self
    }

    pub fn with_user(mut self, id: &str, handle: &str, real_name: &str) -> Self {
        self.users.push(User {
            id: id.to_string(),
            handle: handle.to_string(),
            real_name: real_name.to_string(),
            is_bot: false,
        });
        self
    }

    /// Page size used for conversation listings, to exercise cursor walking.
    pub fn with_conversation_page_size(mut self, size: usize) -> Self {
        self.conversation_page_size = size.max(1);
        self
    }

    /// Every history read of `conversation_id` fails with `error`.
    pub fn fail_history(mut self, conversation_id: &str, error: ApiError) -> Self {
        self.history_failures.insert(conversation_id.to_string(), error);
        self
    }

    /// History reads of `conversation_id` take `delay` (virtual time under paused tests).
    pub fn with_history_delay(mut self, conversation_id: &str, delay: Duration) -> Self {
        self.history_delays.insert(conversation_id.to_string(), delay);
        self
    }

    /// The next `count` calls of `method` are rate limited.
    pub fn rate_limit(
        self,
        method: &'static str,
        count: usize,
        retry_after: Option<Duration>,
    ) -> Self {
        {
            let mut limits = self.rate_limits.lock().unwrap_or_else(|e| e.into_inner());
            let queue = limits.entry(method).or_default();
            queue.extend(std::iter::repeat(retry_after).take(count));
        }
        self
    }

    /// Writes (`post_message`, `add_reaction`) fail with `error`.
    pub fn fail_writes(self, error: ApiError) -> Self {
        self.set_write_failure(Some(error));
        self
    }

    pub fn set_write_failure(&self, error: Option<ApiError>) {
        *self.write_failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Conversation listings fail with `error` until cleared.
    pub fn set_listing_failure(&self, error: Option<ApiError>) {
        *self.listing_failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Number of calls made to `method`, including rate-limited ones.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn posted(&self) -> Vec<PostedMessage> {
        self.posted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reactions(&self) -> Vec<AddedReaction> {
        self.reactions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn enter(&self, method: &'static str) -> ApiResult<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(method)
            .or_insert(0) += 1;
        let mut limits = self.rate_limits.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(retry_after) = limits.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(ApiError::RateLimited { retry_after });
        }
        Ok(())
    }

    fn write_failure(&self) -> Option<ApiError> {
        self.write_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_ts(&self) -> String {
        let secs = self.next_ts.fetch_add(1, Ordering::SeqCst) as i64;
        let at = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
        format_ts(at)
    }
}

/// Slice `items` starting at the numeric `cursor` offset.
fn paginate<T: Clone>(items: &[T], cursor: Option<&str>, page_size: usize) -> ApiResult<Page<T>> {
    let start = match cursor {
        Some(c) => c
            .parse::<usize>()
            .map_err(|_| ApiError::rejected("invalid_cursor", format!("bad cursor {}", c)))?,
        None => 0,
    };
    let page_size = page_size.max(1);
    let end = (start + page_size).min(items.len());
    let slice = items.get(start..end).unwrap_or_default().to_vec();
    if end < items.len() {
        Ok(Page::more(slice, end.to_string()))
    } else {
        Ok(Page::last(slice))
    }
}

#[async_trait]
impl WorkspaceApi for ScriptedWorkspace {
    async fn identity(&self) -> ApiResult<Identity> {
        self.enter(AUTH_TEST)?;
        Ok(self.identity.clone())
    }

    async fn list_conversations(
        &self,
        filter: ConversationFilter,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Conversation>> {
        self.enter(CONVERSATIONS_LIST)?;
        if let Some(err) = self
            .listing_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        let matching: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| filter.matches(c.kind))
            .cloned()
            .collect();
        paginate(&matching, cursor, self.conversation_page_size)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>> {
        self.enter(CONVERSATIONS_HISTORY)?;
        if let Some(delay) = self.history_delays.get(conversation_id) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(err) = self.history_failures.get(conversation_id) {
            return Err(err.clone());
        }
        let Some(messages) = self.history.get(conversation_id) else {
            return Err(ApiError::rejected("channel_not_found", conversation_id));
        };
        let mut window: Vec<Message> = messages
            .iter()
            .filter(|m| since.map_or(true, |since| m.timestamp >= since))
            .cloned()
            .collect();
        window.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.ts.cmp(&a.ts)));
        paginate(&window, cursor, page_size)
    }

    async fn list_replies(
        &self,
        conversation_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>> {
        self.enter(CONVERSATIONS_REPLIES)?;
        let key = (conversation_id.to_string(), thread_ts.to_string());
        let Some(messages) = self.threads.get(&key) else {
            return Err(ApiError::rejected("thread_not_found", thread_ts));
        };
        paginate(messages, cursor, page_size)
    }

    async fn search(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>> {
        self.enter(SEARCH_MESSAGES)?;
        let needle = query.to_lowercase();
        let hits: Vec<Message> = self
            .search_results
            .iter()
            .filter(|m| m.text.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        paginate(&hits, cursor, page_size)
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> ApiResult<String> {
        self.enter(CHAT_POST_MESSAGE)?;
        if let Some(err) = self.write_failure() {
            return Err(err);
        }
        let ts = self.next_ts();
        self.posted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PostedMessage {
                conversation_id: conversation_id.to_string(),
                text: text.to_string(),
                thread_ts: thread_ts.map(str::to_string),
                ts: ts.clone(),
            });
        Ok(ts)
    }

    async fn add_reaction(&self, conversation_id: &str, ts: &str, emoji: &str) -> ApiResult<()> {
        self.enter(REACTIONS_ADD)?;
        if let Some(err) = self.write_failure() {
            return Err(err);
        }
        self.reactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AddedReaction {
                conversation_id: conversation_id.to_string(),
                ts: ts.to_string(),
                emoji: emoji.to_string(),
            });
        Ok(())
    }

    async fn list_users(&self, cursor: Option<&str>) -> ApiResult<Page<User>> {
        self.enter(USERS_LIST)?;
        paginate(&self.users, cursor, 100)
    }
}

/// Hands out pre-built workspaces keyed by workspace id.
#[derive(Default)]
pub struct StaticConnector {
    workspaces: HashMap<String, Arc<dyn WorkspaceApi>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, id: &str, api: Arc<dyn WorkspaceApi>) -> Self {
        self.workspaces.insert(id.to_string(), api);
        self
    }
}

impl ApiConnector for StaticConnector {
    fn connect(
        &self,
        credential: &WorkspaceCredential,
        _settings: &GatewaySettings,
    ) -> Result<Arc<dyn WorkspaceApi>> {
        self.workspaces
            .get(&credential.id)
            .cloned()
            .ok_or_else(|| {
                DigestError::configuration(format!(
                    "no scripted workspace for '{}'",
                    credential.id
                ))
            })
    }
}
