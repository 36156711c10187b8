// ABOUTME: Activity aggregator - fans out bounded gateway reads and merges them into digests
// ABOUTME: Per-conversation failures and deadline cut-offs become diagnostics, not errors

use crate::classify::{classify, HeuristicMatcher, MessageMatcher};
use crate::digest::{
    lookback_cutoff, AnnotatedMessage, Digest, DigestBuilder, Mode, SkippedConversation,
};
use crate::error::{ErrorKind, Result};
use crate::gateway::{Gateway, MessageQuery};
use crate::metrics;
use crate::traits::{
    parse_ts, Conversation, ConversationFilter, ConversationKind, Identity, Message, MessageRef,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

const UNREAD_MESSAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryRequest {
    pub mode: Mode,
    pub lookback_hours: u32,
    /// Overall budget; on expiry the digest is returned with what was fetched
    pub timeout: Option<Duration>,
}

impl SummaryRequest {
    pub fn new(mode: Mode, lookback_hours: u32) -> Self {
        Self {
            mode,
            lookback_hours,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadRequest {
    pub lookback_hours: u32,
    pub max_dms: usize,
    pub max_channels: usize,
    pub timeout: Option<Duration>,
}

impl Default for UnreadRequest {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            max_dms: 15,
            max_channels: 15,
            timeout: None,
        }
    }
}

/// Why a search returned fewer hits than requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReport {
    pub query: String,
    pub hits: Vec<AnnotatedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<SearchFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadConversation {
    pub conversation_id: String,
    pub conversation_name: String,
    pub kind: ConversationKind,
    pub unread_count: u32,
    /// Oldest first
    pub messages: Vec<AnnotatedMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadReport {
    pub generated_at: DateTime<Utc>,
    pub workspace_id: String,
    pub conversations: Vec<UnreadConversation>,
    pub diagnostics: Vec<SkippedConversation>,
}

/// Names and identity needed to annotate messages for one request.
struct Annotator<'a> {
    matcher: &'a dyn MessageMatcher,
    me: Identity,
    names: HashMap<String, String>,
}

impl Annotator<'_> {
    fn annotate(&self, conversation: &Conversation, message: Message) -> AnnotatedMessage {
        let categories = classify(self.matcher, &message, conversation.kind, &self.me);
        let author_name = message
            .author_id
            .as_ref()
            .and_then(|id| self.names.get(id))
            .cloned();
        AnnotatedMessage {
            conversation_name: self.conversation_name(conversation),
            conversation_kind: conversation.kind,
            author_name,
            categories,
            permalink: message.permalink(),
            message,
        }
    }

    /// DMs are labelled with the peer's display name when known.
    fn conversation_name(&self, conversation: &Conversation) -> String {
        if conversation.kind == ConversationKind::DirectMessage {
            if let Some(name) = conversation
                .peer_user_id
                .as_ref()
                .and_then(|peer| self.names.get(peer))
            {
                return format!("@{}", name);
            }
        }
        conversation.name.clone()
    }
}

/// Merges gateway reads into digests and annotated timelines.
pub struct Aggregator {
    matcher: Arc<dyn MessageMatcher>,
    max_in_flight: usize,
}

impl Aggregator {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            matcher: Arc::new(HeuristicMatcher),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Replace the classification rules.
    pub fn with_matcher(mut self, matcher: Arc<dyn MessageMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Build a categorized digest of recent activity.
    ///
    /// Identity and conversation-listing failures fail the request; every
    /// per-conversation failure becomes a diagnostic on the digest. The
    /// deadline covers listing too: expiring there yields an empty digest.
    pub async fn summarize(
        &self,
        gateway: &Arc<Gateway>,
        request: SummaryRequest,
    ) -> Result<Digest> {
        let started = Instant::now();
        let deadline = request.timeout.map(|t| started + t);
        let generated_at = Utc::now();
        let policy = request.mode.policy();
        let credential = gateway.credential();
        let mut builder = DigestBuilder::new(
            credential.id.clone(),
            credential.name.clone(),
            request.mode,
            request.lookback_hours,
            generated_at,
        )?;
        let cutoff = builder.cutoff();

        let Some(prepared) = within(deadline, self.prepare(gateway)).await else {
            tracing::warn!(
                workspace = %credential.id,
                "Request deadline passed while listing conversations"
            );
            builder.skip(listing_cut_off());
            return Ok(finish(builder, request.mode, started));
        };
        let (conversations, annotator) = prepared?;

        // Every DM is read; the quick-mode cap applies to channels only
        let (mut targets, mut channels): (Vec<Conversation>, Vec<Conversation>) = conversations
            .iter()
            .filter(|c| {
                c.kind.is_direct()
                    || policy.include_quiet_channels
                    || c.last_activity.map_or(true, |at| at >= cutoff)
            })
            .cloned()
            .partition(|c| c.kind.is_direct());
        targets.sort_by(recency_order);
        channels.sort_by(recency_order);
        if let Some(max) = policy.max_channels {
            channels.truncate(max);
        }
        targets.extend(channels);

        tracing::info!(
            workspace = %credential.id,
            mode = request.mode.as_str(),
            lookback_hours = request.lookback_hours,
            conversations = targets.len(),
            listed = conversations.len(),
            "Building digest"
        );

        let query = MessageQuery {
            since: Some(cutoff),
            limit: None,
            page_cap: policy.page_cap,
            page_size: policy.page_size,
        };
        let fetch_gateway = Arc::clone(gateway);
        let (fetched, skipped) = self
            .fetch_many(targets, deadline, move |conversation| {
                let gateway = Arc::clone(&fetch_gateway);
                async move { gateway.collect_chronological(&conversation.id, query).await }
            })
            .await;

        for (conversation, messages) in fetched {
            builder.scanned();
            for message in messages {
                builder.push(annotator.annotate(&conversation, message));
            }
        }
        for skip in skipped {
            builder.skip(skip);
        }
        Ok(finish(builder, request.mode, started))
    }

    /// The most recent `limit` messages of one conversation, oldest first.
    pub async fn read_channel(
        &self,
        gateway: &Gateway,
        conversation: &Conversation,
        limit: usize,
    ) -> Result<Vec<AnnotatedMessage>> {
        let me = gateway.me().await?.clone();
        let query = MessageQuery::default().limit(limit).page_size(limit.min(200));
        let messages = gateway.collect_chronological(&conversation.id, query).await?;
        let annotator = self.annotator(gateway, me).await;
        Ok(messages
            .into_iter()
            .map(|m| annotator.annotate(conversation, m))
            .collect())
    }

    /// Thread root and replies, oldest first.
    pub async fn read_thread(
        &self,
        gateway: &Gateway,
        conversation: &Conversation,
        root_ts: &str,
    ) -> Result<Vec<AnnotatedMessage>> {
        let me = gateway.me().await?.clone();
        let root = MessageRef::new(conversation.id.clone(), root_ts);
        let messages = gateway.thread(&root).await?;
        let annotator = self.annotator(gateway, me).await;
        Ok(messages
            .into_iter()
            .map(|m| annotator.annotate(conversation, m))
            .collect())
    }

    /// Workspace search. A failure after some hits were collected keeps the
    /// hits and records why the result is incomplete.
    pub async fn search(
        &self,
        gateway: &Gateway,
        query: &str,
        limit: usize,
    ) -> Result<SearchReport> {
        let me = gateway.me().await?.clone();
        let mut hits = Vec::new();
        let mut incomplete = None;
        {
            let mut stream = gateway.search_stream(query, limit).take(limit);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => hits.push(message),
                    Err(err) if hits.is_empty() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            workspace = %gateway.workspace_id(),
                            query,
                            collected = hits.len(),
                            error = %err,
                            "Search stopped early, returning partial results"
                        );
                        incomplete = Some(SearchFailure {
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        let known: HashMap<String, Conversation> =
            match gateway.list_conversations(ConversationFilter::All).await {
                Ok(list) => list.iter().map(|c| (c.id.clone(), c.clone())).collect(),
                Err(err) => {
                    tracing::debug!(
                        error = %err,
                        "Conversation listing unavailable for search labels"
                    );
                    HashMap::new()
                }
            };
        let annotator = self.annotator(gateway, me).await;
        let hits = hits
            .into_iter()
            .map(|message| {
                let conversation = known
                    .get(&message.conversation_id)
                    .cloned()
                    .unwrap_or_else(|| placeholder_conversation(&message.conversation_id));
                annotator.annotate(&conversation, message)
            })
            .collect();

        Ok(SearchReport {
            query: query.to_string(),
            hits,
            incomplete,
        })
    }

    /// Messages newer than each conversation's read marker (bounded by the
    /// lookback window), most recently active conversation first.
    pub async fn unread(
        &self,
        gateway: &Arc<Gateway>,
        request: UnreadRequest,
    ) -> Result<UnreadReport> {
        let deadline = request.timeout.map(|t| Instant::now() + t);
        let generated_at = Utc::now();
        let cutoff = lookback_cutoff(generated_at, request.lookback_hours)?;
        let Some(prepared) = within(deadline, self.prepare(gateway)).await else {
            tracing::warn!(
                workspace = %gateway.workspace_id(),
                "Request deadline passed while listing conversations"
            );
            return Ok(UnreadReport {
                generated_at,
                workspace_id: gateway.workspace_id().to_string(),
                conversations: Vec::new(),
                diagnostics: vec![listing_cut_off()],
            });
        };
        let (conversations, annotator) = prepared?;

        let mut candidates: Vec<&Conversation> = conversations
            .iter()
            .filter(|c| {
                let since = unread_since(c, cutoff);
                c.last_activity.map_or(true, |at| at > since)
            })
            .collect();
        candidates.sort_by(|a, b| recency_order(a, b));
        let (dms, channels): (Vec<&Conversation>, Vec<&Conversation>) =
            candidates.into_iter().partition(|c| c.kind.is_direct());
        let targets: Vec<Conversation> = dms
            .into_iter()
            .take(request.max_dms)
            .chain(channels.into_iter().take(request.max_channels))
            .cloned()
            .collect();

        let fetch_gateway = Arc::clone(gateway);
        let (fetched, diagnostics) = self
            .fetch_many(targets, deadline, move |conversation| {
                let gateway = Arc::clone(&fetch_gateway);
                let query = MessageQuery::default()
                    .since(unread_since(&conversation, cutoff))
                    .limit(UNREAD_MESSAGE_LIMIT)
                    .page_cap(1)
                    .page_size(UNREAD_MESSAGE_LIMIT);
                async move { gateway.collect_chronological(&conversation.id, query).await }
            })
            .await;

        let mut unread: Vec<UnreadConversation> = fetched
            .into_iter()
            .filter_map(|(conversation, messages)| {
                let since = unread_since(&conversation, cutoff);
                let messages: Vec<AnnotatedMessage> = messages
                    .into_iter()
                    .filter(|m| {
                        m.timestamp > since
                            || (m.timestamp == since && conversation.last_read.is_none())
                    })
                    .map(|m| annotator.annotate(&conversation, m))
                    .collect();
                if messages.is_empty() {
                    return None;
                }
                Some(UnreadConversation {
                    conversation_id: conversation.id.clone(),
                    conversation_name: annotator.conversation_name(&conversation),
                    kind: conversation.kind,
                    unread_count: conversation.unread_count.max(messages.len() as u32),
                    messages,
                })
            })
            .collect();
        unread.sort_by(|a, b| {
            let latest = |c: &UnreadConversation| c.messages.last().map(|m| m.message.timestamp);
            latest(b)
                .cmp(&latest(a))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });

        Ok(UnreadReport {
            generated_at,
            workspace_id: gateway.workspace_id().to_string(),
            conversations: unread,
            diagnostics,
        })
    }

    /// Identity, conversation listing and author names for one request.
    async fn prepare(&self, gateway: &Gateway) -> Result<(Arc<Vec<Conversation>>, Annotator<'_>)> {
        let me = gateway.me().await?.clone();
        let conversations = gateway.list_conversations(ConversationFilter::All).await?;
        let annotator = self.annotator(gateway, me).await;
        Ok((conversations, annotator))
    }

    async fn annotator(&self, gateway: &Gateway, me: Identity) -> Annotator<'_> {
        let names = match gateway.users().await {
            Ok(users) => users
                .iter()
                .map(|u| (u.id.clone(), u.display_name().to_string()))
                .collect(),
            Err(err) => {
                tracing::warn!(
                    workspace = %gateway.workspace_id(),
                    error = %err,
                    "User directory unavailable, showing raw author ids"
                );
                HashMap::new()
            }
        };
        Annotator {
            matcher: self.matcher.as_ref(),
            me,
            names,
        }
    }

    /// Run `fetch` for every conversation with at most `max_in_flight` in
    /// flight. Failures and deadline cut-offs come back as skips.
    async fn fetch_many<T, F, Fut>(
        &self,
        targets: Vec<Conversation>,
        deadline: Option<Instant>,
        fetch: F,
    ) -> (Vec<(Conversation, T)>, Vec<SkippedConversation>)
    where
        T: Send + 'static,
        F: Fn(Conversation) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();
        for (index, conversation) in targets.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let work = fetch(conversation.clone());
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, work.await)
            });
        }

        let mut results: Vec<Option<Result<T>>> = targets.iter().map(|_| None).collect();
        let mut deadline_hit = false;
        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            deadline_hit = true;
                            tasks.abort_all();
                            break;
                        }
                    }
                }
                None => tasks.join_next().await,
            };
            match next {
                Some(Ok((index, result))) => results[index] = Some(result),
                Some(Err(err)) => tracing::error!(error = %err, "Conversation fetch task failed"),
                None => break,
            }
        }
        if deadline_hit {
            // Keep anything that finished before the abort landed
            while let Some(joined) = tasks.join_next().await {
                if let Ok((index, result)) = joined {
                    results[index] = Some(result);
                }
            }
        }

        let mut fetched = Vec::new();
        let mut skipped = Vec::new();
        for (conversation, result) in targets.into_iter().zip(results) {
            let (kind, message) = match result {
                Some(Ok(value)) => {
                    fetched.push((conversation, value));
                    continue;
                }
                Some(Err(err)) => (err.kind(), err.to_string()),
                None if deadline_hit => (
                    ErrorKind::DeadlineExceeded,
                    "request deadline passed before this conversation was read".to_string(),
                ),
                None => (ErrorKind::Internal, "fetch task ended unexpectedly".to_string()),
            };
            tracing::warn!(
                conversation_id = %conversation.id,
                conversation = %conversation.name,
                kind = kind.as_str(),
                error = %message,
                "Skipping conversation"
            );
            metrics::record_skipped_conversation(kind.as_str());
            skipped.push(SkippedConversation {
                conversation_id: conversation.id,
                conversation_name: conversation.name,
                kind,
                message,
            });
        }
        (fetched, skipped)
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Run `work` unless `deadline` passes first.
async fn within<T>(deadline: Option<Instant>, work: impl Future<Output = T>) -> Option<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, work).await.ok(),
        None => Some(work.await),
    }
}

/// Diagnostic for a request whose deadline passed before any conversation
/// was listed.
fn listing_cut_off() -> SkippedConversation {
    SkippedConversation {
        conversation_id: "*".to_string(),
        conversation_name: "conversation listing".to_string(),
        kind: ErrorKind::DeadlineExceeded,
        message: "request deadline passed before conversations were listed".to_string(),
    }
}

fn finish(builder: DigestBuilder, mode: Mode, started: Instant) -> Digest {
    let digest = builder.build();
    metrics::record_digest(mode.as_str());
    tracing::info!(
        workspace = %digest.workspace_id,
        direct_messages = digest.counts.direct_messages,
        mentions = digest.counts.mentions,
        action_items = digest.counts.action_items,
        channel_activity = digest.counts.channel_activity,
        skipped = digest.diagnostics.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Digest built"
    );
    digest
}

/// Lower bound for unread messages: the read marker, or the lookback cutoff
/// when that is later or unknown.
fn unread_since(conversation: &Conversation, cutoff: DateTime<Utc>) -> DateTime<Utc> {
    conversation
        .last_read
        .as_deref()
        .and_then(parse_ts)
        .map_or(cutoff, |read| read.max(cutoff))
}

/// Most recently active first; unknown activity after known, then by id.
fn recency_order(a: &Conversation, b: &Conversation) -> Ordering {
    match (a.last_activity, b.last_activity) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Best guess at a conversation not present in the listing, from its id prefix.
pub fn placeholder_conversation(id: &str) -> Conversation {
    let kind = match id.chars().next() {
        Some('D') => ConversationKind::DirectMessage,
        Some('G') => ConversationKind::Group,
        _ => ConversationKind::Channel,
    };
    Conversation::new(id, kind, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_recency_order_puts_unknown_last() {
        let mut list = vec![
            Conversation::new("C3", ConversationKind::Channel, "#c"),
            Conversation::new("C1", ConversationKind::Channel, "#a").with_last_activity(at(100)),
            Conversation::new("C2", ConversationKind::Channel, "#b").with_last_activity(at(200)),
        ];
        list.sort_by(recency_order);
        let ids: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C2", "C1", "C3"]);
    }

    #[test]
    fn test_unread_since_prefers_later_bound() {
        let cutoff = at(1_000);
        let read_late = Conversation::new("C1", ConversationKind::Channel, "#a")
            .with_unread(2, Some("2000.000000".to_string()));
        let read_early = Conversation::new("C1", ConversationKind::Channel, "#a")
            .with_unread(2, Some("500.000000".to_string()));
        let never_read = Conversation::new("C1", ConversationKind::Channel, "#a");
        assert_eq!(unread_since(&read_late, cutoff), at(2_000));
        assert_eq!(unread_since(&read_early, cutoff), cutoff);
        assert_eq!(unread_since(&never_read, cutoff), cutoff);
    }

    #[test]
    fn test_placeholder_conversation_kind_from_prefix() {
        assert_eq!(
            placeholder_conversation("D123").kind,
            ConversationKind::DirectMessage
        );
        assert_eq!(placeholder_conversation("G123").kind, ConversationKind::Group);
        assert_eq!(placeholder_conversation("C123").kind, ConversationKind::Channel);
    }
}
