// ABOUTME: Serde shapes of the Slack Web API responses this transport reads
// ABOUTME: Converts wire records into digest-core conversations, messages and users

use digest_core::traits::{
    parse_ts, Conversation, ConversationKind, Message, ReactionSummary, User,
};
use serde::Deserialize;

/// Message subtypes that never carry user activity.
const IGNORED_SUBTYPES: &[&str] = &["channel_join", "channel_leave", "bot_message"];

#[derive(Debug, Default, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub next_cursor: String,
}

/// `response_metadata.next_cursor`, with Slack's empty string meaning "done".
pub fn next_cursor(metadata: &Option<ResponseMetadata>) -> Option<String> {
    metadata
        .as_ref()
        .map(|m| m.next_cursor.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

// ─── auth.test ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuthTest {
    pub user_id: String,
    #[serde(default)]
    pub user: String,
}

// ─── conversations.list ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConversationsList {
    #[serde(default)]
    pub channels: Vec<WireConversation>,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct WireConversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_mpim: bool,
    #[serde(default)]
    pub is_private: bool,
    /// Peer of a 1:1 DM
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub last_read: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub latest: Option<WireMessage>,
}

impl WireConversation {
    pub fn kind(&self) -> ConversationKind {
        if self.is_im {
            ConversationKind::DirectMessage
        } else if self.is_mpim {
            ConversationKind::MultiPersonDm
        } else if self.is_private {
            ConversationKind::Group
        } else {
            ConversationKind::Channel
        }
    }

    fn display_name(&self, kind: ConversationKind) -> String {
        let name = self.name.as_deref().unwrap_or("");
        match kind {
            ConversationKind::DirectMessage => match &self.user {
                Some(user) => format!("@user:{}", user),
                None => "@unknown".to_string(),
            },
            // mpdm-alice--bob--carol-1
            ConversationKind::MultiPersonDm => {
                let trimmed = name.trim_start_matches("mpdm-");
                let trimmed = trimmed
                    .rsplit_once('-')
                    .filter(|(_, suffix)| suffix.chars().all(|c| c.is_ascii_digit()))
                    .map(|(head, _)| head)
                    .unwrap_or(trimmed);
                if trimmed.is_empty() {
                    "Group DM".to_string()
                } else {
                    trimmed.replace("--", ", ")
                }
            }
            ConversationKind::Channel | ConversationKind::Group => {
                if name.is_empty() {
                    format!("#{}", self.id)
                } else {
                    format!("#{}", name)
                }
            }
        }
    }

    pub fn into_conversation(self) -> Conversation {
        let kind = self.kind();
        let mut conversation = Conversation::new(self.id.clone(), kind, self.display_name(kind));
        if let Some(peer) = self.user.clone().filter(|_| kind == ConversationKind::DirectMessage) {
            conversation = conversation.with_peer(peer);
        }
        if let Some(at) = self.latest.as_ref().and_then(|m| parse_ts(&m.ts)) {
            conversation = conversation.with_last_activity(at);
        }
        conversation.with_unread(
            self.unread_count.unwrap_or(0),
            self.last_read.filter(|ts| !ts.is_empty() && ts != "0000000000.000000"),
        )
    }
}

// ─── conversations.history / conversations.replies ──────────────

#[derive(Debug, Deserialize)]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub ts: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default)]
    pub reactions: Vec<WireReaction>,
}

#[derive(Debug, Deserialize)]
pub struct WireReaction {
    pub name: String,
    #[serde(default)]
    pub count: u32,
}

impl WireMessage {
    /// Joins, leaves and bot posts are noise in a digest.
    pub fn is_system(&self) -> bool {
        self.subtype
            .as_deref()
            .is_some_and(|s| IGNORED_SUBTYPES.contains(&s))
    }

    pub fn into_message(self, conversation_id: &str) -> Message {
        let mut message = Message::new(conversation_id, self.ts, self.user.as_deref(), self.text);
        // A thread root carries thread_ts equal to its own ts
        if let Some(root) = self.thread_ts.filter(|root| *root != message.ts) {
            message = message.in_thread(root);
        }
        message.reply_count = self.reply_count;
        message.reactions = self
            .reactions
            .into_iter()
            .map(|r| ReactionSummary {
                emoji: r.name,
                count: r.count,
            })
            .collect();
        message
    }
}

// ─── search.messages ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub messages: SearchMessages,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchMessages {
    #[serde(default)]
    pub matches: Vec<SearchMatch>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub pages: u32,
}

impl Paging {
    /// Next page number, if any.
    pub fn next_page(&self) -> Option<u32> {
        (self.page < self.pages).then_some(self.page + 1)
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchMatch {
    pub ts: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub channel: Option<SearchChannel>,
}

#[derive(Debug, Deserialize)]
pub struct SearchChannel {
    pub id: String,
}

impl SearchMatch {
    pub fn into_message(self) -> Message {
        let conversation_id = self.channel.map(|c| c.id).unwrap_or_default();
        Message::new(conversation_id, self.ts, self.user.as_deref(), self.text)
    }
}

// ─── chat.postMessage ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PostedMessage {
    pub ts: String,
}

// ─── users.list ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UsersList {
    #[serde(default)]
    pub members: Vec<WireUser>,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct WireUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub profile: Option<WireProfile>,
}

#[derive(Debug, Deserialize)]
pub struct WireProfile {
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl WireUser {
    pub fn into_user(self) -> User {
        let profile = self.profile.as_ref();
        let real_name = profile
            .and_then(|p| p.real_name.clone())
            .or(self.real_name)
            .or_else(|| profile.and_then(|p| p.display_name.clone()))
            .unwrap_or_default();
        User {
            id: self.id,
            handle: self.name,
            real_name,
            is_bot: self.is_bot,
        }
    }
}
