// ABOUTME: Per-message category assignment behind a swappable matcher trait
// ABOUTME: Default matcher is a best-effort regex heuristic; misses and false hits are expected

use crate::traits::{ConversationKind, Identity, Message};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Digest category. A message may carry several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DirectMessage,
    Mention,
    ActionItem,
    ChannelActivity,
}

impl Category {
    /// Rendering order of digest sections.
    pub const ALL: [Category; 4] = [
        Category::DirectMessage,
        Category::Mention,
        Category::ActionItem,
        Category::ChannelActivity,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Self::DirectMessage => "Direct Messages",
            Self::Mention => "Mentions",
            Self::ActionItem => "Action Items",
            Self::ChannelActivity => "Channel Activity",
        }
    }
}

pub type Categories = BTreeSet<Category>;

/// Text-level rules used by [`classify`].
pub trait MessageMatcher: Send + Sync {
    /// Does `text` address `me` directly or through a broadcast token?
    fn is_mention(&self, text: &str, me: &Identity) -> bool;

    /// Does `text` read like a request or question?
    fn is_action_item(&self, text: &str) -> bool;
}

/// Keyword and pattern heuristic.
///
/// Loose pattern matching: "can you review" is caught,
/// an indirect request phrased as a statement is not, and a rhetorical
/// question that mentions you is reported. Treat results as hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicMatcher;

static BROADCAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<!(here|channel)(\|[^>]*)?>|(^|[^\w<])@(here|channel)\b")
        .expect("Invalid regex pattern for broadcast mentions")
});

static LEADING_MENTIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*<[@!][^>]+>[,:]?\s*)+")
        .expect("Invalid regex pattern for leading mentions")
});

static REQUEST_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\?\s*$",
        r"^(can|could|would|will|do|does|did|is|are|have|has|should)\s",
        r"\b(please|pls)\b",
        r"\bneeds?\s+(you|your)\b",
        r"\b(review|check|look at|take a look)\b",
        r"\b(thoughts|opinion|input|feedback)\?",
        r"\bwhen (can|will|could)\b",
        r"\beta\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("Invalid regex pattern for request phrasing"))
    .collect()
});

impl MessageMatcher for HeuristicMatcher {
    fn is_mention(&self, text: &str, me: &Identity) -> bool {
        if mentions_user_id(text, &me.user_id) {
            return true;
        }
        if !me.handle.is_empty() && mentions_handle(text, &me.handle) {
            return true;
        }
        BROADCAST.is_match(text)
    }

    fn is_action_item(&self, text: &str) -> bool {
        let body = LEADING_MENTIONS.replace(text.trim(), "");
        let body = body.trim();
        REQUEST_PATTERNS.iter().any(|p| p.is_match(body))
    }
}

/// `<@U123>` or `<@U123|alice>`
fn mentions_user_id(text: &str, user_id: &str) -> bool {
    let token = format!("<@{}", user_id);
    text.match_indices(&token).any(|(at, _)| {
        matches!(text[at + token.len()..].chars().next(), Some('>') | Some('|'))
    })
}

/// Plain `@alice`, not part of a longer handle or an email address.
fn mentions_handle(text: &str, handle: &str) -> bool {
    let lower = text.to_lowercase();
    let token = format!("@{}", handle.to_lowercase());
    lower.match_indices(&token).any(|(at, _)| {
        let before = lower[..at].chars().next_back();
        let mut after = lower[at + token.len()..].chars();
        let boundary_before = before.map_or(true, |c| !c.is_alphanumeric());
        let boundary_after = match after.next() {
            None => true,
            // trailing punctuation, unless it continues the handle (`@alice.b`)
            Some('.') | Some('-') | Some('_') => {
                after.next().map_or(true, |c| !c.is_alphanumeric())
            }
            Some(c) => !c.is_alphanumeric(),
        };
        boundary_before && boundary_after
    })
}

/// Assign every applicable category to `message`.
///
/// Pure in its inputs, so reclassifying yields the same set. Messages written
/// by `me` are never mentions or action items.
pub fn classify(
    matcher: &dyn MessageMatcher,
    message: &Message,
    kind: ConversationKind,
    me: &Identity,
) -> Categories {
    let mut categories = Categories::new();
    if kind.is_direct() {
        categories.insert(Category::DirectMessage);
    } else {
        categories.insert(Category::ChannelActivity);
    }

    let own = message.author_id.as_deref() == Some(me.user_id.as_str());
    if own {
        return categories;
    }

    let mentioned = matcher.is_mention(&message.text, me);
    if mentioned {
        categories.insert(Category::Mention);
    }
    if (mentioned || kind.is_direct()) && matcher.is_action_item(&message.text) {
        categories.insert(Category::ActionItem);
    }
    categories
}
