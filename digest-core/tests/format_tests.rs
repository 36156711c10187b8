// ABOUTME: Tests for digest rendering - Markdown structure parsed back with pulldown-cmark
// ABOUTME: Checks section order, empty placeholders, caps, action-item tables and structured records

use chrono::{DateTime, Duration, Utc};
use digest_core::classify::{Categories, Category};
use digest_core::digest::{AnnotatedMessage, Digest, DigestBuilder, Mode, SkippedConversation};
use digest_core::error::ErrorKind;
use digest_core::format::{action_items_markdown, to_markdown, to_record, MarkdownOptions};
use digest_core::traits::{format_ts, ConversationKind, Message};
use pulldown_cmark::{html, Event, Options, Parser, Tag, TagEnd};

fn now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_086_400, 0).unwrap()
}

fn annotated(
    conv: &str,
    name: &str,
    kind: ConversationKind,
    minutes_ago: i64,
    text: &str,
    categories: &[Category],
) -> AnnotatedMessage {
    let ts = format_ts(now() - Duration::minutes(minutes_ago));
    let message = Message::new(conv, ts, Some("U2"), text);
    AnnotatedMessage {
        permalink: message.permalink(),
        message,
        conversation_name: name.to_string(),
        conversation_kind: kind,
        author_name: Some("Bob".to_string()),
        categories: categories.iter().copied().collect::<Categories>(),
    }
}

fn sample_digest() -> Digest {
    let mut builder = DigestBuilder::new("work", "Work", Mode::Quick, 24, now()).unwrap();
    builder.push(annotated(
        "D1",
        "@Bob",
        ConversationKind::DirectMessage,
        5,
        "can you look at <https://example.com|the doc>?",
        &[Category::DirectMessage, Category::ActionItem],
    ));
    builder.push(annotated(
        "C1",
        "#eng",
        ConversationKind::Channel,
        90,
        "deploy | rollback plan ready",
        &[Category::ChannelActivity],
    ));
    builder.scanned();
    builder.scanned();
    builder.skip(SkippedConversation {
        conversation_id: "C9".to_string(),
        conversation_name: "#secret".to_string(),
        kind: ErrorKind::Upstream,
        message: "upstream error (not_in_channel): not a member".to_string(),
    });
    builder.build()
}

fn headings(markdown: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { .. }) => current = Some(String::new()),
            Event::Text(text) => {
                if let Some(heading) = current.as_mut() {
                    heading.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(heading) = current.take() {
                    out.push(heading);
                }
            }
            _ => {}
        }
    }
    out
}

#[test]
fn test_sections_render_in_fixed_order() {
    let markdown = to_markdown(&sample_digest(), &MarkdownOptions::default());
    assert_eq!(
        headings(&markdown),
        vec![
            "Slack Digest - Work",
            "Direct Messages",
            "Mentions",
            "Action Items",
            "Channel Activity",
            "Skipped Conversations",
        ]
    );
}

#[test]
fn test_empty_section_has_placeholder() {
    let markdown = to_markdown(&sample_digest(), &MarkdownOptions::default());
    let mentions = markdown.split("## Mentions").nth(1).unwrap();
    let body = mentions.split("## ").next().unwrap();
    assert!(body.contains("_No activity._"));
}

#[test]
fn test_entries_show_cleaned_text_and_relative_time() {
    let markdown = to_markdown(&sample_digest(), &MarkdownOptions::default());
    assert!(markdown.contains("- **@Bob** - Bob (5m ago): \"can you look at the doc?\""));
    assert!(markdown.contains("- **#eng** - Bob (1h ago):"));
    assert!(markdown.contains("- **#secret** (upstream): upstream error (not_in_channel)"));
}

#[test]
fn test_entries_link_to_the_message() {
    let digest = sample_digest();
    let markdown = to_markdown(&digest, &MarkdownOptions::default());
    let dm = &digest.direct_messages[0];
    assert!(markdown.contains(&format!(
        "\"can you look at the doc?\" ([open](slack://channel?id=D1&message={}))",
        dm.message.ts
    )));

    let record = to_record(&digest);
    assert_eq!(record.sections.direct_messages[0].permalink, dm.message.permalink());
}

#[test]
fn test_section_cap_adds_more_line() {
    let mut builder = DigestBuilder::new("work", "Work", Mode::Full, 24, now()).unwrap();
    for i in 0..5 {
        builder.push(annotated(
            "C1",
            "#eng",
            ConversationKind::Channel,
            i + 1,
            "update",
            &[Category::ChannelActivity],
        ));
    }
    let options = MarkdownOptions {
        max_per_section: Some(2),
        ..MarkdownOptions::default()
    };
    let markdown = to_markdown(&builder.build(), &options);
    assert_eq!(markdown.matches("- **#eng**").count(), 2);
    assert!(markdown.contains("- _and 3 more_"));
}

#[test]
fn test_action_items_render_as_table() {
    let digest = sample_digest();
    let markdown = action_items_markdown(&[&digest], &MarkdownOptions::default());
    let mut rendered = String::new();
    html::push_html(&mut rendered, Parser::new_ext(&markdown, Options::ENABLE_TABLES));

    assert!(markdown.starts_with("# Needs Your Attention"));
    assert!(rendered.contains("<table>"));
    assert!(rendered.contains("<td>@Bob</td>"));
    assert!(rendered.contains("<td>Bob</td>"));
}

#[test]
fn test_pipes_in_action_items_stay_in_one_cell() {
    let mut builder = DigestBuilder::new("work", "Work", Mode::Quick, 24, now()).unwrap();
    builder.push(annotated(
        "C1",
        "#eng",
        ConversationKind::Channel,
        3,
        "<@U_ME> pick a | b?",
        &[Category::Mention, Category::ActionItem, Category::ChannelActivity],
    ));
    let digest = builder.build();
    let markdown = action_items_markdown(&[&digest], &MarkdownOptions::default());
    let mut rendered = String::new();
    html::push_html(&mut rendered, Parser::new_ext(&markdown, Options::ENABLE_TABLES));
    assert!(rendered.contains("<td>@user pick a | b?</td>"));
}

#[test]
fn test_workspace_without_action_items() {
    let digest = DigestBuilder::new("home", "Home", Mode::Quick, 24, now()).unwrap().build();
    let markdown = action_items_markdown(&[&digest], &MarkdownOptions::default());
    assert_eq!(headings(&markdown), vec!["Needs Your Attention", "Home"]);
    assert!(markdown.contains("_No action items._"));
}

#[test]
fn test_record_is_complete_and_serializable() {
    let record = to_record(&sample_digest());
    assert_eq!(record.workspace.id, "work");
    assert!(record.partial);
    assert_eq!(record.counts.action_items, 1);
    assert_eq!(record.sections.direct_messages[0].text, "can you look at the doc?");

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["mode"], "quick");
    assert_eq!(json["skipped"][0]["kind"], "upstream");
    assert_eq!(json["sections"]["direct_messages"][0]["categories"][0], "direct_message");
}
