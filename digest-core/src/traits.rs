// ABOUTME: Workspace data model (conversations, messages, users) and the upstream capability trait
// ABOUTME: WorkspaceApi is the seam between the core and a concrete chat transport

use crate::error::ApiResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Conversations
// =============================================================================

/// Kind of message container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Public channel
    Channel,
    /// Private channel
    Group,
    /// 1:1 direct message
    DirectMessage,
    /// Multi-person direct message
    MultiPersonDm,
}

impl ConversationKind {
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::DirectMessage | Self::MultiPersonDm)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Channel => "Public Channels",
            Self::Group => "Private Channels",
            Self::DirectMessage => "Direct Messages",
            Self::MultiPersonDm => "Group DMs",
        }
    }
}

/// Which conversation kinds a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationFilter {
    #[default]
    All,
    /// Public and private channels
    Channels,
    /// 1:1 and multi-person DMs
    DirectMessages,
    /// Private channels and multi-person DMs
    Groups,
}

impl ConversationFilter {
    pub fn kinds(&self) -> &'static [ConversationKind] {
        use ConversationKind::*;
        match self {
            Self::All => &[Channel, Group, DirectMessage, MultiPersonDm],
            Self::Channels => &[Channel, Group],
            Self::DirectMessages => &[DirectMessage, MultiPersonDm],
            Self::Groups => &[Group, MultiPersonDm],
        }
    }

    pub fn matches(&self, kind: ConversationKind) -> bool {
        self.kinds().contains(&kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Channels => "channels",
            Self::DirectMessages => "dms",
            Self::Groups => "groups",
        }
    }
}

impl std::str::FromStr for ConversationFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "channels" | "channel" => Ok(Self::Channels),
            "dms" | "dm" | "direct" => Ok(Self::DirectMessages),
            "groups" | "group" => Ok(Self::Groups),
            other => Err(format!(
                "unknown conversation type '{}', expected all, channels, dms or groups",
                other
            )),
        }
    }
}

/// A message container as listed by the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// Display name (`#general`, `@user:U123`, `alice, bob`)
    pub name: String,
    /// Other participant of a 1:1 DM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    /// Read marker (message ts) of the requesting user, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: impl Into<String>, kind: ConversationKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            peer_user_id: None,
            last_activity: None,
            last_read: None,
            unread_count: 0,
        }
    }

    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = Some(at);
        self
    }

    pub fn with_peer(mut self, user_id: impl Into<String>) -> Self {
        self.peer_user_id = Some(user_id.into());
        self
    }

    pub fn with_unread(mut self, count: u32, last_read: Option<String>) -> Self {
        self.unread_count = count;
        self.last_read = last_read;
        self
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Address of a single message: conversation plus upstream timestamp id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub conversation_id: String,
    pub ts: String,
}

impl MessageRef {
    pub fn new(conversation_id: impl Into<String>, ts: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ts: ts.into(),
        }
    }
}

/// Aggregated reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
}

/// A fetched message. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    /// Upstream timestamp id, unique within the conversation
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root: Option<String>,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionSummary>,
}

impl Message {
    /// Build a message whose timestamp is derived from its ts id.
    pub fn new(
        conversation_id: impl Into<String>,
        ts: impl Into<String>,
        author_id: Option<&str>,
        text: impl Into<String>,
    ) -> Self {
        let ts = ts.into();
        let timestamp = parse_ts(&ts).unwrap_or_default();
        Self {
            conversation_id: conversation_id.into(),
            ts,
            author_id: author_id.map(str::to_string),
            timestamp,
            text: text.into(),
            thread_root: None,
            reply_count: 0,
            reactions: Vec::new(),
        }
    }

    pub fn in_thread(mut self, root_ts: impl Into<String>) -> Self {
        self.thread_root = Some(root_ts.into());
        self
    }

    pub fn reference(&self) -> MessageRef {
        MessageRef::new(self.conversation_id.clone(), self.ts.clone())
    }

    /// `slack://` deep link that opens this message in the desktop client.
    pub fn permalink(&self) -> String {
        format!(
            "slack://channel?id={}&message={}",
            self.conversation_id, self.ts
        )
    }
}

/// Parse an upstream `"1700000000.000100"` timestamp id into UTC.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match ts.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (ts, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().take(6).collect();
        format!("{:0<6}", digits).parse().ok()?
    };
    Utc.timestamp_opt(secs, micros * 1_000).single()
}

/// Render a UTC instant as an upstream timestamp id.
pub fn format_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

// =============================================================================
// Users
// =============================================================================

/// Identity of the user the credential acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    /// Short handle (`alice`), used for plain `@alice` mentions
    pub handle: String,
}

/// Directory entry for a workspace member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub handle: String,
    pub real_name: String,
    #[serde(default)]
    pub is_bot: bool,
}

impl User {
    pub fn display_name(&self) -> &str {
        if self.real_name.is_empty() {
            &self.handle
        } else {
            &self.real_name
        }
    }
}

// =============================================================================
// Upstream capability
// =============================================================================

/// One bounded page of an upstream listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation cursor; `None` when the listing is exhausted
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn more(items: Vec<T>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(cursor.into()),
        }
    }
}

/// Raw upstream capability bound to one workspace credential.
///
/// Implementations perform exactly one upstream request per call: no
/// retries, no caching and no pagination. The `Gateway` layers those on top.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// The user the credential acts as.
    async fn identity(&self) -> ApiResult<Identity>;

    /// One page of conversations the user is a member of.
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Conversation>>;

    /// One page of a conversation's history, newest message first.
    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>>;

    /// One page of a thread, root message first.
    async fn list_replies(
        &self,
        conversation_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>>;

    /// One page of workspace search results.
    async fn search(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> ApiResult<Page<Message>>;

    /// Post a message (optionally into a thread); returns the new message ts.
    async fn post_message(
        &self,
        conversation_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> ApiResult<String>;

    /// Add an emoji reaction to a message.
    async fn add_reaction(&self, conversation_id: &str, ts: &str, emoji: &str) -> ApiResult<()>;

    /// One page of the member directory.
    async fn list_users(&self, cursor: Option<&str>) -> ApiResult<Page<User>>;
}
