// ABOUTME: Digest rendering - structured records for tool clients, Markdown for batch output
// ABOUTME: Pure functions of a Digest; no upstream calls

use crate::classify::Category;
use crate::digest::{AnnotatedMessage, CategoryCounts, Digest, Mode, SkippedConversation};
use crate::traits::ConversationKind;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Structured record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub conversation_id: String,
    pub conversation: String,
    pub conversation_kind: ConversationKind,
    pub ts: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub author: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub reply_count: u32,
    pub categories: Vec<Category>,
    pub permalink: String,
}

impl From<&AnnotatedMessage> for MessageRecord {
    fn from(m: &AnnotatedMessage) -> Self {
        Self {
            conversation_id: m.message.conversation_id.clone(),
            conversation: m.conversation_name.clone(),
            conversation_kind: m.conversation_kind,
            ts: m.message.ts.clone(),
            timestamp: m.message.timestamp,
            author_id: m.message.author_id.clone(),
            author: m.author_label().to_string(),
            text: clean_text(&m.message.text, usize::MAX),
            thread_ts: m.message.thread_root.clone(),
            reply_count: m.message.reply_count,
            categories: m.categories.iter().copied().collect(),
            permalink: m.permalink.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionsRecord {
    pub direct_messages: Vec<MessageRecord>,
    pub mentions: Vec<MessageRecord>,
    pub action_items: Vec<MessageRecord>,
    pub channel_activity: Vec<MessageRecord>,
}

/// Stable, serializable shape of a Digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub generated_at: DateTime<Utc>,
    pub workspace: WorkspaceRecord,
    pub mode: Mode,
    pub lookback_hours: u32,
    pub counts: CategoryCounts,
    pub sections: SectionsRecord,
    pub scanned_conversations: usize,
    pub partial: bool,
    pub skipped: Vec<SkippedConversation>,
}

pub fn to_record(digest: &Digest) -> DigestRecord {
    let records = |items: &[AnnotatedMessage]| -> Vec<MessageRecord> {
        items.iter().map(MessageRecord::from).collect()
    };
    DigestRecord {
        generated_at: digest.generated_at,
        workspace: WorkspaceRecord {
            id: digest.workspace_id.clone(),
            name: digest.workspace_name.clone(),
        },
        mode: digest.mode,
        lookback_hours: digest.lookback_hours,
        counts: digest.counts,
        sections: SectionsRecord {
            direct_messages: records(&digest.direct_messages),
            mentions: records(&digest.mentions),
            action_items: records(&digest.action_items),
            channel_activity: records(&digest.channel_activity),
        },
        scanned_conversations: digest.scanned_conversations,
        partial: digest.is_partial(),
        skipped: digest.diagnostics.clone(),
    }
}

// =============================================================================
// Markdown
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownOptions {
    /// Entries shown per section before an "and N more" line
    pub max_per_section: Option<usize>,
    /// Characters of message text shown per entry
    pub text_width: usize,
}

impl Default for MarkdownOptions {
    fn default() -> Self {
        Self {
            max_per_section: Some(20),
            text_width: 100,
        }
    }
}

const NO_ACTIVITY: &str = "_No activity._";

/// Render a digest with sections in fixed order, each with a placeholder
/// when empty.
pub fn to_markdown(digest: &Digest, options: &MarkdownOptions) -> String {
    let mut out = format!("# Slack Digest - {}\n\n", digest.workspace_name);
    out.push_str(&format!(
        "_{} summary of the last {} hours, generated {}_\n\n",
        capitalize(digest.mode.as_str()),
        digest.lookback_hours,
        digest.generated_at.format("%B %d, %Y %H:%M UTC")
    ));
    let counts = &digest.counts;
    out.push_str(&format!(
        "**{}** direct messages, **{}** mentions, **{}** action items, \
         **{}** channel messages across {} conversations\n",
        counts.direct_messages,
        counts.mentions,
        counts.action_items,
        counts.channel_activity,
        digest.scanned_conversations
    ));

    for category in Category::ALL {
        out.push_str(&format!("\n## {}\n\n", category.title()));
        let items = digest.section(category);
        if items.is_empty() {
            out.push_str(NO_ACTIVITY);
            out.push('\n');
            continue;
        }
        let shown = options.max_per_section.unwrap_or(items.len()).min(items.len());
        for item in &items[..shown] {
            out.push_str(&entry_line(item, digest.generated_at, options.text_width));
        }
        if shown < items.len() {
            out.push_str(&format!("- _and {} more_\n", items.len() - shown));
        }
    }

    if !digest.diagnostics.is_empty() {
        out.push_str("\n## Skipped Conversations\n\n");
        for skipped in &digest.diagnostics {
            out.push_str(&format!(
                "- **{}** ({}): {}\n",
                skipped.conversation_name, skipped.kind, skipped.message
            ));
        }
    }
    out
}

fn entry_line(item: &AnnotatedMessage, now: DateTime<Utc>, text_width: usize) -> String {
    let mut line = format!(
        "- **{}** - {} ({}): \"{}\"",
        item.conversation_name,
        item.author_label(),
        relative_time(item.message.timestamp, now),
        clean_text(&item.message.text, text_width)
    );
    if !item.permalink.is_empty() {
        line.push_str(&format!(" ([open]({}))", item.permalink));
    }
    line.push('\n');
    line
}

/// Action items of one or more digests as Markdown tables.
pub fn action_items_markdown(digests: &[&Digest], options: &MarkdownOptions) -> String {
    let mut out = String::from("# Needs Your Attention\n");
    for digest in digests {
        out.push_str(&format!("\n## {}\n\n", digest.workspace_name));
        if digest.action_items.is_empty() {
            out.push_str("_No action items._\n");
            continue;
        }
        out.push_str("| From | Channel | Message | Time |\n");
        out.push_str("|------|---------|---------|------|\n");
        let items = &digest.action_items;
        let shown = options.max_per_section.unwrap_or(items.len()).min(items.len());
        for item in &items[..shown] {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                escape_cell(item.author_label()),
                escape_cell(&item.conversation_name),
                escape_cell(&clean_text(&item.message.text, options.text_width)),
                relative_time(item.message.timestamp, digest.generated_at)
            ));
        }
        if shown < items.len() {
            out.push_str(&format!("\n_and {} more_\n", items.len() - shown));
        }
    }
    out
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// "just now", "5m ago", "3h ago", "yesterday", "4d ago", then "Mar 02".
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - at).num_seconds();
    if seconds < 60 {
        return "just now".to_string();
    }
    if seconds < 3_600 {
        return format!("{}m ago", seconds / 60);
    }
    if seconds < 86_400 {
        return format!("{}h ago", seconds / 3_600);
    }
    match seconds / 86_400 {
        1 => "yesterday".to_string(),
        days if days < 7 => format!("{}d ago", days),
        _ => at.format("%b %d").to_string(),
    }
}

// =============================================================================
// Text cleanup
// =============================================================================

static USER_WITH_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<@\w+\|([^>]+)>").expect("Invalid regex pattern for labelled user")
});
static USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@\w+>").expect("Invalid regex pattern for user"));
static BROADCAST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!(\w+)(\|[^>]*)?>").expect("Invalid regex pattern for broadcast"));
static CHANNEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<#\w+\|([^>]*)>").expect("Invalid regex pattern for channel"));
static LINK_WITH_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<([^|>]+)\|([^>]+)>").expect("Invalid regex pattern for labelled link")
});
static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^>]+)>").expect("Invalid regex pattern for link"));

/// Convert Slack markup to plain text, collapse whitespace and cut to
/// `max_chars` characters with a trailing ellipsis.
pub fn clean_text(text: &str, max_chars: usize) -> String {
    let text = USER_WITH_LABEL.replace_all(text, "@$1");
    let text = USER.replace_all(&text, "@user");
    let text = BROADCAST.replace_all(&text, "@$1");
    let text = CHANNEL.replace_all(&text, "#$1");
    let text = LINK_WITH_LABEL.replace_all(&text, "$2");
    let text = LINK.replace_all(&text, "$1");
    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&text, max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str("...");
    cut
}

const QUOTE_CHARS: usize = 50;

/// Slack quote of the first ~50 characters of `original`, cut at a word
/// boundary, to prefix a reply that is not answering the latest message.
pub fn quote_for_reply(original: &str) -> Option<String> {
    let flat = clean_text(original, usize::MAX);
    if flat.is_empty() {
        return None;
    }
    if flat.chars().count() <= QUOTE_CHARS {
        return Some(format!("> {}", flat));
    }
    let head: String = flat.chars().take(QUOTE_CHARS).collect();
    let head = match head.rsplit_once(' ') {
        Some((words, _)) if !words.is_empty() => words.to_string(),
        _ => head,
    };
    Some(format!("> {}...", head.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_relative_time_buckets() {
        let now = at(1_700_000_000);
        assert_eq!(relative_time(at(1_700_000_000 - 30), now), "just now");
        assert_eq!(relative_time(at(1_700_000_000 - 300), now), "5m ago");
        assert_eq!(relative_time(at(1_700_000_000 - 7_200), now), "2h ago");
        assert_eq!(relative_time(at(1_700_000_000 - 90_000), now), "yesterday");
        assert_eq!(relative_time(at(1_700_000_000 - 3 * 86_400), now), "3d ago");
        assert_eq!(relative_time(at(1_700_000_000 - 30 * 86_400), now), "Oct 15");
    }

    #[test]
    fn test_clean_text_strips_markup() {
        let raw = "hey <@U123> and <@U456|bob>, see <#C1|general> \
                   <https://x.io|docs> <!here> &amp; more";
        assert_eq!(
            clean_text(raw, 200),
            "hey @user and @bob, see #general docs @here & more"
        );
    }

    #[test]
    fn test_clean_text_truncates_on_char_boundary() {
        assert_eq!(clean_text("héllo wörld again", 8), "héllo...");
        assert_eq!(clean_text("  a \n\n b ", 10), "a b");
    }

    #[test]
    fn test_quote_for_reply_cuts_at_word_boundary() {
        assert_eq!(quote_for_reply("short note").as_deref(), Some("> short note"));
        let long = "the quarterly planning document needs another review pass before friday";
        let quote = quote_for_reply(long).unwrap();
        assert_eq!(quote, "> the quarterly planning document needs another...");
        assert!(quote_for_reply("   ").is_none());
    }
}
