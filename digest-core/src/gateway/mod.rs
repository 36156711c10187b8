// ABOUTME: Per-credential upstream gateway: pagination, rate-limit retries and listing cache
// ABOUTME: Read calls stream lazily across pages; write calls surface ambiguous outcomes

pub mod cache;
pub mod retry;

use crate::config::{GatewaySettings, WorkspaceCredential};
use crate::error::{DigestError, Result};
use crate::metrics;
use crate::traits::{
    Conversation, ConversationFilter, Identity, Message, MessageRef, Page, User, WorkspaceApi,
};
use cache::{Lookup, TtlCache};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use retry::{CallKind, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Conversation listings keyed by (credential id, filter).
pub type ConversationCache = TtlCache<(String, ConversationFilter), Vec<Conversation>>;

/// Lazy, one-shot sequence of items produced page by page.
pub type PageStream<'a, T> = BoxStream<'a, Result<T>>;

const SEARCH_PAGE_SIZE: usize = 100;
const REPLIES_PAGE_SIZE: usize = 200;

/// Window and traversal bounds for a history read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Stop after this many messages (most recent first)
    pub limit: Option<usize>,
    /// Stop after this many upstream pages; `None` walks to exhaustion
    pub page_cap: Option<usize>,
    pub page_size: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            since: None,
            limit: None,
            page_cap: None,
            page_size: 200,
        }
    }
}

impl MessageQuery {
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page_cap(mut self, pages: usize) -> Self {
        self.page_cap = Some(pages);
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }
}

struct Cursor {
    next: Option<String>,
    pages: usize,
    exhausted: bool,
}

impl Cursor {
    fn start() -> Self {
        Self {
            next: None,
            pages: 0,
            exhausted: false,
        }
    }

    fn advance(&self, next: Option<String>) -> Self {
        let next = next.filter(|c| !c.is_empty());
        Self {
            exhausted: next.is_none(),
            next,
            pages: self.pages + 1,
        }
    }
}

/// Upstream client bound to one workspace credential.
pub struct Gateway {
    credential: WorkspaceCredential,
    api: Arc<dyn WorkspaceApi>,
    retry: RetryPolicy,
    conversations: Arc<ConversationCache>,
    users: TtlCache<(), Vec<User>>,
    refresh_lock: Mutex<()>,
    identity: OnceCell<Identity>,
}

impl Gateway {
    pub fn new(
        credential: WorkspaceCredential,
        api: Arc<dyn WorkspaceApi>,
        settings: &GatewaySettings,
        conversations: Arc<ConversationCache>,
    ) -> Self {
        Self {
            credential,
            api,
            retry: settings.retry.clone(),
            conversations,
            users: TtlCache::new(settings.cache_ttl),
            refresh_lock: Mutex::new(()),
            identity: OnceCell::new(),
        }
    }

    /// Gateway with a private conversation cache.
    pub fn standalone(
        credential: WorkspaceCredential,
        api: Arc<dyn WorkspaceApi>,
        settings: &GatewaySettings,
    ) -> Self {
        let cache = Arc::new(ConversationCache::new(settings.cache_ttl));
        Self::new(credential, api, settings, cache)
    }

    pub fn credential(&self) -> &WorkspaceCredential {
        &self.credential
    }

    pub fn workspace_id(&self) -> &str {
        &self.credential.id
    }

    /// The user this credential acts as. Fetched once per gateway.
    pub async fn me(&self) -> Result<&Identity> {
        self.identity
            .get_or_try_init(|| self.retry.run("auth.test", CallKind::Read, || self.api.identity()))
            .await
    }

    /// Every conversation matching `filter`, served from the cache while fresh.
    pub async fn list_conversations(
        &self,
        filter: ConversationFilter,
    ) -> Result<Arc<Vec<Conversation>>> {
        let key = (self.credential.id.clone(), filter);
        if let Lookup::Fresh(list) = self.conversations.lookup(&key) {
            metrics::record_cache_lookup("hit");
            return Ok(list);
        }

        // Concurrent misses wait here; the first one refreshes, the rest re-check
        let _guard = self.refresh_lock.lock().await;
        let lookup = self.conversations.lookup(&key);
        metrics::record_cache_lookup(lookup.outcome());
        let stale = match lookup {
            Lookup::Fresh(list) => return Ok(list),
            Lookup::Stale(list) => Some(list),
            Lookup::Missing => None,
        };

        match self.fetch_conversations(filter).await {
            Ok(list) => {
                tracing::debug!(
                    workspace = %self.credential.id,
                    filter = filter.as_str(),
                    count = list.len(),
                    cached_listings = self.conversations.len(),
                    "Refreshed conversation listing"
                );
                Ok(self.conversations.insert(key, list))
            }
            Err(err) => match stale {
                Some(list) => {
                    tracing::warn!(
                        workspace = %self.credential.id,
                        filter = filter.as_str(),
                        error = %err,
                        "Conversation refresh failed, serving stale listing"
                    );
                    Ok(list)
                }
                None => Err(err),
            },
        }
    }

    async fn fetch_conversations(&self, filter: ConversationFilter) -> Result<Vec<Conversation>> {
        let mut all = Vec::new();
        let mut cursor = Cursor::start();
        while !cursor.exhausted {
            let current = cursor.next.as_deref();
            let page = self
                .retry
                .run("conversations.list", CallKind::Read, || {
                    self.api.list_conversations(filter, current)
                })
                .await?;
            all.extend(page.items.into_iter().filter(|c| filter.matches(c.kind)));
            cursor = cursor.advance(page.next_cursor);
        }
        Ok(all)
    }

    /// Messages of one conversation, newest first, fetched lazily page by page.
    ///
    /// Pages are requested only as the stream is polled; dropping the stream
    /// stops the traversal.
    pub fn list_messages<'a>(
        &'a self,
        conversation_id: &'a str,
        query: MessageQuery,
    ) -> PageStream<'a, Message> {
        let messages = paged(query.page_cap, move |cursor: Option<String>| async move {
            self.retry
                .run("conversations.history", CallKind::Read, || {
                    self.api.list_messages(
                        conversation_id,
                        query.since,
                        cursor.as_deref(),
                        query.page_size,
                    )
                })
                .await
        });
        match query.limit {
            Some(limit) => messages.take(limit).boxed(),
            None => messages,
        }
    }

    /// Drain `list_messages` and return the window in ascending time order.
    pub async fn collect_chronological(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> =
            self.list_messages(conversation_id, query).try_collect().await?;
        sort_chronological(&mut messages);
        Ok(messages)
    }

    /// Root message and every reply, oldest first.
    pub async fn thread(&self, root: &MessageRef) -> Result<Vec<Message>> {
        let mut all = Vec::new();
        let mut cursor = Cursor::start();
        while !cursor.exhausted {
            let current = cursor.next.as_deref();
            let page = self
                .retry
                .run("conversations.replies", CallKind::Read, || {
                    self.api
                        .list_replies(&root.conversation_id, &root.ts, current, REPLIES_PAGE_SIZE)
                })
                .await?;
            all.extend(page.items);
            cursor = cursor.advance(page.next_cursor);
        }
        sort_chronological(&mut all);
        Ok(all)
    }

    /// Search hits in upstream relevance order, fetched lazily page by page.
    pub fn search_stream<'a>(
        &'a self,
        query: &'a str,
        page_size: usize,
    ) -> PageStream<'a, Message> {
        let page_size = page_size.clamp(1, SEARCH_PAGE_SIZE);
        paged(None, move |cursor: Option<String>| async move {
            self.retry
                .run("search.messages", CallKind::Read, || {
                    self.api.search(query, cursor.as_deref(), page_size)
                })
                .await
        })
    }

    /// Up to `limit` search hits in upstream relevance order.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Message>> {
        self.search_stream(query, limit).take(limit).try_collect().await
    }

    /// Member directory, cached for the listing TTL.
    pub async fn users(&self) -> Result<Arc<Vec<User>>> {
        let stale = match self.users.lookup(&()) {
            Lookup::Fresh(users) => return Ok(users),
            Lookup::Stale(users) => Some(users),
            Lookup::Missing => None,
        };

        let mut all = Vec::new();
        let mut cursor = Cursor::start();
        while !cursor.exhausted {
            let current = cursor.next.as_deref();
            let page = match self
                .retry
                .run("users.list", CallKind::Read, || self.api.list_users(current))
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    return match stale {
                        Some(users) => {
                            tracing::warn!(
                                workspace = %self.credential.id,
                                error = %err,
                                "User refresh failed, serving stale directory"
                            );
                            Ok(users)
                        }
                        None => Err(err),
                    };
                }
            };
            all.extend(page.items);
            cursor = cursor.advance(page.next_cursor);
        }
        Ok(self.users.insert((), all))
    }

    /// Post a new top-level message; returns its ts.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<String> {
        let text = require_text(text)?;
        let ts = self
            .retry
            .run("chat.postMessage", CallKind::Write, || {
                self.api.post_message(conversation_id, text, None)
            })
            .await?;
        tracing::info!(workspace = %self.credential.id, conversation_id, ts = %ts, "Message sent");
        Ok(ts)
    }

    /// Post into the thread rooted at `root`; returns the reply's ts.
    pub async fn reply(&self, root: &MessageRef, text: &str) -> Result<String> {
        let text = require_text(text)?;
        let ts = self
            .retry
            .run("chat.postMessage", CallKind::Write, || {
                self.api
                    .post_message(&root.conversation_id, text, Some(root.ts.as_str()))
            })
            .await?;
        tracing::info!(
            workspace = %self.credential.id,
            conversation_id = %root.conversation_id,
            thread_ts = %root.ts,
            ts = %ts,
            "Reply sent"
        );
        Ok(ts)
    }

    /// Add a reaction. Surrounding colons on the emoji name are ignored.
    pub async fn react(&self, message: &MessageRef, emoji: &str) -> Result<()> {
        let emoji = normalize_emoji(emoji);
        if emoji.is_empty() {
            return Err(DigestError::invalid_input("emoji name must not be empty"));
        }
        self.retry
            .run("reactions.add", CallKind::Write, || {
                self.api
                    .add_reaction(&message.conversation_id, &message.ts, emoji)
            })
            .await?;
        tracing::info!(
            workspace = %self.credential.id,
            conversation_id = %message.conversation_id,
            ts = %message.ts,
            emoji,
            "Reaction added"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("credential", &self.credential)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Walk a cursor-paginated listing lazily, stopping at `page_cap` pages.
fn paged<'a, T, F, Fut>(page_cap: Option<usize>, fetch: F) -> PageStream<'a, T>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>>> + Send + 'a,
{
    stream::try_unfold((Cursor::start(), fetch), move |(cursor, mut fetch)| async move {
        if cursor.exhausted || page_cap.is_some_and(|cap| cursor.pages >= cap) {
            return Ok::<_, DigestError>(None);
        }
        let page = fetch(cursor.next.clone()).await?;
        let next = cursor.advance(page.next_cursor);
        Ok(Some((page.items, (next, fetch))))
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, DigestError>)))
    .try_flatten()
    .boxed()
}

/// Ascending by timestamp, ts breaking ties.
pub fn sort_chronological(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.ts.cmp(&b.ts)));
}

pub fn normalize_emoji(emoji: &str) -> &str {
    emoji.trim().trim_matches(':')
}

fn require_text(text: &str) -> Result<&str> {
    if text.trim().is_empty() {
        return Err(DigestError::invalid_input("message text must not be empty"));
    }
    Ok(text)
}
