// ABOUTME: Tool-facing and batch-facing operations over the registry, gateways and aggregator
// ABOUTME: Resolves workspaces and conversation targets, adds reply context to outgoing messages

use crate::aggregator::{
    placeholder_conversation, Aggregator, SearchReport, SummaryRequest, UnreadReport, UnreadRequest,
};
use crate::config::{CredentialRegistry, GatewaySettings, WorkspaceCredential};
use crate::digest::{AnnotatedMessage, Digest, Mode};
use crate::error::{DigestError, Result};
use crate::format::{self, MarkdownOptions};
use crate::gateway::{ConversationCache, Gateway, MessageQuery};
use crate::traits::{
    Conversation, ConversationFilter, ConversationKind, MessageRef, User, WorkspaceApi,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Messages inspected when looking for the message a send replies to.
const REPLY_CONTEXT_WINDOW: usize = 100;

/// Creates the upstream transport for a credential.
pub trait ApiConnector: Send + Sync {
    fn connect(
        &self,
        credential: &WorkspaceCredential,
        settings: &GatewaySettings,
    ) -> Result<Arc<dyn WorkspaceApi>>;
}

/// A configured workspace as shown to clients (no secrets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub is_default: bool,
}

/// One conversation and a window of its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    pub workspace_id: String,
    pub conversation: Conversation,
    /// Oldest first
    pub messages: Vec<AnnotatedMessage>,
}

/// Where a posted message landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub workspace_id: String,
    pub conversation_id: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    /// Whether a quote of the replied-to message was prefixed
    pub with_context: bool,
}

/// Entry point for both front ends. One gateway per workspace, created lazily.
pub struct DigestService {
    registry: CredentialRegistry,
    connector: Arc<dyn ApiConnector>,
    cache: Arc<ConversationCache>,
    gateways: Mutex<HashMap<String, Arc<Gateway>>>,
    aggregator: Aggregator,
    summary_timeout: Option<Duration>,
}

impl DigestService {
    pub fn new(registry: CredentialRegistry, connector: Arc<dyn ApiConnector>) -> Self {
        let settings = registry.settings().clone();
        Self {
            cache: Arc::new(ConversationCache::new(settings.cache_ttl)),
            aggregator: Aggregator::new(settings.max_in_flight),
            gateways: Mutex::new(HashMap::new()),
            summary_timeout: None,
            registry,
            connector,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Overall budget for summary and unread requests.
    pub fn with_summary_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &CredentialRegistry {
        &self.registry
    }

    /// Gateway for `workspace` (or the default workspace).
    pub fn gateway(&self, workspace: Option<&str>) -> Result<Arc<Gateway>> {
        let credential = self.registry.resolve(workspace)?;
        let mut gateways = self.gateways.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gateway) = gateways.get(&credential.id) {
            return Ok(Arc::clone(gateway));
        }
        let api = self.connector.connect(credential, self.registry.settings())?;
        let gateway = Arc::new(Gateway::new(
            credential.clone(),
            api,
            self.registry.settings(),
            Arc::clone(&self.cache),
        ));
        tracing::debug!(workspace = %credential.id, "Created workspace gateway");
        gateways.insert(credential.id.clone(), Arc::clone(&gateway));
        Ok(gateway)
    }

    // ─── Read operations ────────────────────────────────────────────

    pub async fn summary(
        &self,
        workspace: Option<&str>,
        mode: Mode,
        lookback_hours: u32,
    ) -> Result<Digest> {
        let gateway = self.gateway(workspace)?;
        let mut request = SummaryRequest::new(mode, lookback_hours);
        request.timeout = self.summary_timeout;
        self.aggregator.summarize(&gateway, request).await
    }

    /// Conversations of one kind, DMs labelled with the peer's name.
    pub async fn channels(
        &self,
        workspace: Option<&str>,
        filter: ConversationFilter,
    ) -> Result<Vec<Conversation>> {
        let gateway = self.gateway(workspace)?;
        let conversations = gateway.list_conversations(filter).await?;
        let names = user_names(&gateway).await;
        let mut listed: Vec<Conversation> = conversations
            .iter()
            .map(|c| with_display_name(c.clone(), &names))
            .collect();
        listed.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        Ok(listed)
    }

    /// Latest `limit` messages of a conversation named by `#name`, `@person` or id.
    pub async fn channel(
        &self,
        workspace: Option<&str>,
        target: &str,
        limit: usize,
    ) -> Result<ConversationView> {
        let gateway = self.gateway(workspace)?;
        let conversation = self.resolve_target(&gateway, target).await?;
        let messages = self
            .aggregator
            .read_channel(&gateway, &conversation, limit)
            .await?;
        Ok(ConversationView {
            workspace_id: gateway.workspace_id().to_string(),
            conversation,
            messages,
        })
    }

    /// Latest messages of the DM with `person` (handle or real name, partial ok).
    pub async fn dm(
        &self,
        workspace: Option<&str>,
        person: &str,
        limit: usize,
    ) -> Result<ConversationView> {
        let gateway = self.gateway(workspace)?;
        let conversation = find_dm(&gateway, person).await?;
        let messages = self
            .aggregator
            .read_channel(&gateway, &conversation, limit)
            .await?;
        Ok(ConversationView {
            workspace_id: gateway.workspace_id().to_string(),
            conversation,
            messages,
        })
    }

    pub async fn thread(
        &self,
        workspace: Option<&str>,
        target: &str,
        thread_ts: &str,
    ) -> Result<ConversationView> {
        let gateway = self.gateway(workspace)?;
        let conversation = self.resolve_target(&gateway, target).await?;
        let messages = self
            .aggregator
            .read_thread(&gateway, &conversation, thread_ts)
            .await?;
        Ok(ConversationView {
            workspace_id: gateway.workspace_id().to_string(),
            conversation,
            messages,
        })
    }

    pub async fn search(
        &self,
        workspace: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<SearchReport> {
        if query.trim().is_empty() {
            return Err(DigestError::invalid_input("search query must not be empty"));
        }
        let gateway = self.gateway(workspace)?;
        self.aggregator.search(&gateway, query, limit).await
    }

    pub async fn unread(
        &self,
        workspace: Option<&str>,
        mut request: UnreadRequest,
    ) -> Result<UnreadReport> {
        let gateway = self.gateway(workspace)?;
        if request.timeout.is_none() {
            request.timeout = self.summary_timeout;
        }
        self.aggregator.unread(&gateway, request).await
    }

    /// Configured workspaces in priority order.
    pub fn workspaces(&self) -> Vec<WorkspaceInfo> {
        self.registry
            .list()
            .into_iter()
            .map(|c| WorkspaceInfo {
                id: c.id.clone(),
                name: c.name.clone(),
                priority: c.priority,
                is_default: self.registry.is_default(&c.id),
            })
            .collect()
    }

    // ─── Write operations ───────────────────────────────────────────

    /// Post to a conversation. With `reply_to`, a quote of that message is
    /// prefixed unless it is already the latest message.
    pub async fn send(
        &self,
        workspace: Option<&str>,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage> {
        let gateway = self.gateway(workspace)?;
        let conversation = self.resolve_target(&gateway, target).await?;
        let (text, with_context) = match reply_to {
            Some(ts) => channel_reply_context(&gateway, &conversation.id, ts, text).await,
            None => (text.to_string(), false),
        };
        let ts = gateway.send(&conversation.id, &text).await?;
        Ok(SentMessage {
            workspace_id: gateway.workspace_id().to_string(),
            conversation_id: conversation.id,
            ts,
            thread_ts: None,
            with_context,
        })
    }

    /// Post into a thread. With `reply_to`, a quote of that reply is prefixed
    /// unless it is already the latest message of the thread.
    pub async fn reply(
        &self,
        workspace: Option<&str>,
        target: &str,
        thread_ts: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage> {
        let gateway = self.gateway(workspace)?;
        let conversation = self.resolve_target(&gateway, target).await?;
        let root = MessageRef::new(conversation.id.clone(), thread_ts);
        let (text, with_context) = match reply_to {
            Some(ts) => thread_reply_context(&gateway, &root, ts, text).await,
            None => (text.to_string(), false),
        };
        let ts = gateway.reply(&root, &text).await?;
        Ok(SentMessage {
            workspace_id: gateway.workspace_id().to_string(),
            conversation_id: conversation.id,
            ts,
            thread_ts: Some(thread_ts.to_string()),
            with_context,
        })
    }

    pub async fn react(
        &self,
        workspace: Option<&str>,
        target: &str,
        ts: &str,
        emoji: &str,
    ) -> Result<()> {
        let gateway = self.gateway(workspace)?;
        let conversation = self.resolve_target(&gateway, target).await?;
        gateway
            .react(&MessageRef::new(conversation.id, ts), emoji)
            .await
    }

    // ─── Batch ──────────────────────────────────────────────────────

    /// Full-mode digest rendered as Markdown.
    pub async fn render_summary(
        &self,
        workspace: Option<&str>,
        lookback_hours: u32,
        action_items_only: bool,
    ) -> Result<String> {
        self.render_summary_with(workspace, Mode::Full, lookback_hours, action_items_only)
            .await
    }

    pub async fn render_summary_with(
        &self,
        workspace: Option<&str>,
        mode: Mode,
        lookback_hours: u32,
        action_items_only: bool,
    ) -> Result<String> {
        let digest = self.summary(workspace, mode, lookback_hours).await?;
        let options = MarkdownOptions::default();
        Ok(if action_items_only {
            format::action_items_markdown(&[&digest], &options)
        } else {
            format::to_markdown(&digest, &options)
        })
    }

    /// Every workspace in priority order, separated by horizontal rules.
    /// A workspace that fails entirely is reported inline.
    pub async fn render_all(
        &self,
        mode: Mode,
        lookback_hours: u32,
        action_items_only: bool,
    ) -> Result<String> {
        let ids: Vec<String> = self.registry.list().iter().map(|c| c.id.clone()).collect();
        if ids.is_empty() {
            // Surfaces the "no workspaces configured" guidance
            self.registry.resolve(None)?;
        }

        let mut digests = Vec::new();
        let mut failures = Vec::new();
        for id in &ids {
            match self.summary(Some(id), mode, lookback_hours).await {
                Ok(digest) => digests.push(digest),
                Err(err) => {
                    tracing::error!(workspace = %id, error = %err, "Workspace summary failed");
                    failures.push(format!("- **{}**: {}", id, err));
                }
            }
        }

        let options = MarkdownOptions::default();
        let mut out = if action_items_only {
            let refs: Vec<&Digest> = digests.iter().collect();
            format::action_items_markdown(&refs, &options)
        } else {
            digests
                .iter()
                .map(|d| format::to_markdown(d, &options))
                .collect::<Vec<_>>()
                .join("\n---\n\n")
        };
        if !failures.is_empty() {
            out.push_str("\n---\n\n## Failed Workspaces\n\n");
            out.push_str(&failures.join("\n"));
            out.push('\n');
        }
        Ok(out)
    }

    // ─── Target resolution ──────────────────────────────────────────

    /// `#name` / `name` for channels, `@person` for DMs, or a raw id.
    pub async fn resolve_target(&self, gateway: &Gateway, target: &str) -> Result<Conversation> {
        let target = target.trim();
        if target.is_empty() {
            return Err(DigestError::invalid_input("conversation must not be empty"));
        }

        if looks_like_conversation_id(target) {
            let known = match gateway.list_conversations(ConversationFilter::All).await {
                Ok(list) => list.iter().find(|c| c.id == target).cloned(),
                Err(err) => {
                    tracing::debug!(error = %err, "Listing unavailable, using raw conversation id");
                    None
                }
            };
            return Ok(known.unwrap_or_else(|| placeholder_conversation(target)));
        }

        if let Some(person) = target.strip_prefix('@') {
            return find_dm(gateway, person).await;
        }

        let name = target.trim_start_matches('#');
        let channels = gateway.list_conversations(ConversationFilter::Channels).await?;
        channels
            .iter()
            .find(|c| c.name.trim_start_matches('#').eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| DigestError::not_found(format!("channel #{}", name)))
    }
}

impl std::fmt::Debug for DigestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestService")
            .field("registry", &self.registry)
            .field("summary_timeout", &self.summary_timeout)
            .finish()
    }
}

/// Upstream ids start with C, D or G followed by uppercase letters and digits.
pub fn looks_like_conversation_id(target: &str) -> bool {
    let mut chars = target.chars();
    matches!(chars.next(), Some('C') | Some('D') | Some('G'))
        && target.len() >= 9
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

async fn user_names(gateway: &Gateway) -> HashMap<String, User> {
    match gateway.users().await {
        Ok(users) => users.iter().map(|u| (u.id.clone(), u.clone())).collect(),
        Err(err) => {
            tracing::warn!(
                workspace = %gateway.workspace_id(),
                error = %err,
                "User directory unavailable"
            );
            HashMap::new()
        }
    }
}

fn with_display_name(
    mut conversation: Conversation,
    users: &HashMap<String, User>,
) -> Conversation {
    if conversation.kind == ConversationKind::DirectMessage {
        if let Some(user) = conversation.peer_user_id.as_ref().and_then(|id| users.get(id)) {
            conversation.name = format!("@{}", user.display_name());
        }
    }
    conversation
}

/// Exact (case-insensitive) match on handle or name first, then partial.
async fn find_dm(gateway: &Gateway, person: &str) -> Result<Conversation> {
    let wanted = person.trim().trim_start_matches('@').to_lowercase();
    if wanted.is_empty() {
        return Err(DigestError::invalid_input("person must not be empty"));
    }
    let dms = gateway
        .list_conversations(ConversationFilter::DirectMessages)
        .await?;
    let users = user_names(gateway).await;

    let candidates: Vec<(Conversation, Vec<String>)> = dms
        .iter()
        .filter(|c| c.kind == ConversationKind::DirectMessage)
        .map(|c| {
            let mut labels = vec![c.name.trim_start_matches('@').to_lowercase()];
            if let Some(user) = c.peer_user_id.as_ref().and_then(|id| users.get(id)) {
                labels.push(user.handle.to_lowercase());
                labels.push(user.real_name.to_lowercase());
            }
            (with_display_name(c.clone(), &users), labels)
        })
        .collect();

    let exact = candidates
        .iter()
        .find(|(_, labels)| labels.iter().any(|l| *l == wanted));
    let partial = || {
        candidates
            .iter()
            .find(|(_, labels)| labels.iter().any(|l| !l.is_empty() && l.contains(&wanted)))
    };
    exact
        .or_else(partial)
        .map(|(conversation, _)| conversation.clone())
        .ok_or_else(|| DigestError::not_found(format!("direct message with {}", person.trim())))
}

async fn channel_reply_context(
    gateway: &Gateway,
    conversation_id: &str,
    reply_to: &str,
    text: &str,
) -> (String, bool) {
    let query = MessageQuery::default()
        .limit(REPLY_CONTEXT_WINDOW)
        .page_size(REPLY_CONTEXT_WINDOW);
    match gateway.collect_chronological(conversation_id, query).await {
        Ok(recent) => with_quote(&recent, reply_to, text),
        Err(err) => {
            tracing::warn!(
                conversation_id,
                error = %err,
                "Could not load reply context, sending without it"
            );
            (text.to_string(), false)
        }
    }
}

async fn thread_reply_context(
    gateway: &Gateway,
    root: &MessageRef,
    reply_to: &str,
    text: &str,
) -> (String, bool) {
    match gateway.thread(root).await {
        Ok(messages) => with_quote(&messages, reply_to, text),
        Err(err) => {
            tracing::warn!(
                conversation_id = %root.conversation_id,
                error = %err,
                "Could not load thread context, sending without it"
            );
            (text.to_string(), false)
        }
    }
}

/// `messages` oldest first. No quote when `reply_to` is the latest message or unknown.
fn with_quote(messages: &[crate::traits::Message], reply_to: &str, text: &str) -> (String, bool) {
    if messages.last().map(|m| m.ts.as_str()) == Some(reply_to) {
        return (text.to_string(), false);
    }
    match messages
        .iter()
        .find(|m| m.ts == reply_to)
        .and_then(|m| format::quote_for_reply(&m.text))
    {
        Some(quote) => (format!("{}\n{}", quote, text), true),
        None => (text.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Message;

    #[test]
    fn test_conversation_id_detection() {
        assert!(looks_like_conversation_id("C0123ABCD"));
        assert!(looks_like_conversation_id("D024BE91L"));
        assert!(!looks_like_conversation_id("General"));
        assert!(!looks_like_conversation_id("C1"));
        assert!(!looks_like_conversation_id("Cabcdefghij"));
    }

    #[test]
    fn test_with_quote_skips_latest_message() {
        let messages = vec![
            Message::new("C1", "1.000001", Some("U2"), "first thing"),
            Message::new("C1", "2.000001", Some("U2"), "latest thing"),
        ];
        assert_eq!(with_quote(&messages, "2.000001", "ok"), ("ok".to_string(), false));
        assert_eq!(
            with_quote(&messages, "1.000001", "ok"),
            ("> first thing\nok".to_string(), true)
        );
        assert_eq!(with_quote(&messages, "9.0", "ok"), ("ok".to_string(), false));
    }
}
