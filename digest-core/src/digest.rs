// ABOUTME: Digest model - categorized, ordered activity for one workspace and time window
// ABOUTME: DigestBuilder dedupes, drops out-of-window messages and sorts each category

use crate::classify::{Categories, Category};
use crate::error::{DigestError, ErrorKind, Result};
use crate::traits::{ConversationKind, Message};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Longest lookback window accepted, one year.
pub const MAX_LOOKBACK_HOURS: u32 = 24 * 365;

/// Start of the `lookback_hours` window ending at `now`.
pub fn lookback_cutoff(now: DateTime<Utc>, lookback_hours: u32) -> Result<DateTime<Utc>> {
    if lookback_hours == 0 || lookback_hours > MAX_LOOKBACK_HOURS {
        return Err(DigestError::invalid_input(format!(
            "lookback must be between 1 and {} hours, got {}",
            MAX_LOOKBACK_HOURS, lookback_hours
        )));
    }
    TimeDelta::try_hours(i64::from(lookback_hours))
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            DigestError::invalid_input(format!(
                "lookback of {} hours is out of range",
                lookback_hours
            ))
        })
}

/// Latency/completeness tradeoff for a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Quick,
    Full,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Full => "full",
        }
    }

    pub fn policy(&self) -> ModePolicy {
        match self {
            Self::Quick => ModePolicy {
                include_quiet_channels: false,
                max_channels: Some(20),
                page_cap: Some(1),
                page_size: 50,
            },
            Self::Full => ModePolicy {
                include_quiet_channels: true,
                max_channels: None,
                page_cap: None,
                page_size: 200,
            },
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown mode '{}', expected quick or full", other)),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traversal breadth for one mode. Classification is identical across modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePolicy {
    /// Fetch channels with no activity inside the lookback window
    pub include_quiet_channels: bool,
    /// Cap on channels read; DMs are never capped
    pub max_channels: Option<usize>,
    pub page_cap: Option<usize>,
    pub page_size: usize,
}

/// A message plus the context needed to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedMessage {
    pub message: Message,
    pub conversation_name: String,
    pub conversation_kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub categories: Categories,
    /// Deep link that opens the message in the Slack client
    #[serde(default)]
    pub permalink: String,
}

impl AnnotatedMessage {
    pub fn author_label(&self) -> &str {
        self.author_name
            .as_deref()
            .or(self.message.author_id.as_deref())
            .unwrap_or("unknown")
    }
}

/// A conversation left out of an otherwise successful aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedConversation {
    pub conversation_id: String,
    pub conversation_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Unique messages per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub direct_messages: usize,
    pub mentions: usize,
    pub action_items: usize,
    pub channel_activity: usize,
}

impl CategoryCounts {
    pub fn get(&self, category: Category) -> usize {
        match category {
            Category::DirectMessage => self.direct_messages,
            Category::Mention => self.mentions,
            Category::ActionItem => self.action_items,
            Category::ChannelActivity => self.channel_activity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    pub workspace_id: String,
    pub workspace_name: String,
    pub mode: Mode,
    pub lookback_hours: u32,
    pub direct_messages: Vec<AnnotatedMessage>,
    pub mentions: Vec<AnnotatedMessage>,
    pub action_items: Vec<AnnotatedMessage>,
    pub channel_activity: Vec<AnnotatedMessage>,
    pub counts: CategoryCounts,
    pub scanned_conversations: usize,
    pub diagnostics: Vec<SkippedConversation>,
}

impl Digest {
    pub fn section(&self, category: Category) -> &[AnnotatedMessage] {
        match category {
            Category::DirectMessage => &self.direct_messages,
            Category::Mention => &self.mentions,
            Category::ActionItem => &self.action_items,
            Category::ChannelActivity => &self.channel_activity,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Accumulates classified messages and produces an ordered Digest.
#[derive(Debug)]
pub struct DigestBuilder {
    generated_at: DateTime<Utc>,
    cutoff: DateTime<Utc>,
    workspace_id: String,
    workspace_name: String,
    mode: Mode,
    lookback_hours: u32,
    seen: HashSet<(String, String)>,
    messages: Vec<AnnotatedMessage>,
    scanned: usize,
    diagnostics: Vec<SkippedConversation>,
}

impl DigestBuilder {
    pub fn new(
        workspace_id: impl Into<String>,
        workspace_name: impl Into<String>,
        mode: Mode,
        lookback_hours: u32,
        generated_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            cutoff: lookback_cutoff(generated_at, lookback_hours)?,
            generated_at,
            workspace_id: workspace_id.into(),
            workspace_name: workspace_name.into(),
            mode,
            lookback_hours,
            seen: HashSet::new(),
            messages: Vec::new(),
            scanned: 0,
            diagnostics: Vec::new(),
        })
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    /// Add a classified message. Returns false when it was a duplicate or
    /// fell outside the lookback window.
    pub fn push(&mut self, annotated: AnnotatedMessage) -> bool {
        if annotated.message.timestamp < self.cutoff {
            return false;
        }
        let key = (
            annotated.message.conversation_id.clone(),
            annotated.message.ts.clone(),
        );
        if !self.seen.insert(key) {
            return false;
        }
        self.messages.push(annotated);
        true
    }

    pub fn scanned(&mut self) {
        self.scanned += 1;
    }

    pub fn skip(&mut self, skipped: SkippedConversation) {
        self.diagnostics.push(skipped);
    }

    pub fn build(self) -> Digest {
        let mut messages = self.messages;
        messages.sort_by(|a, b| digest_order(&a.message, &b.message));

        let pick = |category: Category| -> Vec<AnnotatedMessage> {
            messages
                .iter()
                .filter(|m| m.categories.contains(&category))
                .cloned()
                .collect()
        };
        let direct_messages = pick(Category::DirectMessage);
        let mentions = pick(Category::Mention);
        let action_items = pick(Category::ActionItem);
        let channel_activity = pick(Category::ChannelActivity);

        let counts = CategoryCounts {
            direct_messages: direct_messages.len(),
            mentions: mentions.len(),
            action_items: action_items.len(),
            channel_activity: channel_activity.len(),
        };

        let mut diagnostics = self.diagnostics;
        diagnostics.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));

        Digest {
            generated_at: self.generated_at,
            workspace_id: self.workspace_id,
            workspace_name: self.workspace_name,
            mode: self.mode,
            lookback_hours: self.lookback_hours,
            direct_messages,
            mentions,
            action_items,
            channel_activity,
            counts,
            scanned_conversations: self.scanned,
            diagnostics,
        }
    }
}

/// Most recent first; conversation id then ts break ties.
pub fn digest_order(a: &Message, b: &Message) -> std::cmp::Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        .then_with(|| a.ts.cmp(&b.ts))
}
