// ABOUTME: Tests for the service facade over two scripted workspaces
// ABOUTME: Covers default workspace selection, target resolution, reply context and batch rendering

use chrono::{Duration as ChronoDuration, Utc};
use digest_core::aggregator::UnreadRequest;
use digest_core::config::{CredentialRegistry, FileConfig};
use digest_core::digest::Mode;
use digest_core::error::{DigestError, ErrorKind};
use digest_core::service::DigestService;
use digest_core::testing::*;
use digest_core::traits::{format_ts, Conversation, ConversationFilter, ConversationKind, Message};
use std::sync::Arc;

const CONFIG: &str = r#"
default_workspace = "work"

[workspaces.work]
name = "Work"
token = "xoxp-work"
priority = 1

[workspaces.home]
name = "Home"
token = "xoxp-home"
priority = 2
"#;

fn ago(minutes: i64) -> String {
    format_ts(Utc::now() - ChronoDuration::minutes(minutes))
}

fn registry() -> CredentialRegistry {
    let file = FileConfig::from_toml_str(CONFIG).unwrap();
    CredentialRegistry::from_sources(Some(file), Vec::<(String, String)>::new()).unwrap()
}

struct Fixture {
    service: DigestService,
    work: Arc<ScriptedWorkspace>,
    home: Arc<ScriptedWorkspace>,
    latest_ts: String,
    older_ts: String,
    thread_root: String,
}

fn fixture() -> Fixture {
    let older_ts = ago(30);
    let latest_ts = ago(10);
    let thread_root = ago(60);
    let work = Arc::new(
        ScriptedWorkspace::new("U_ME", "alice")
            .with_user("U2", "bob", "Bob Builder")
            .with_user("U3", "carol", "Carol Danvers")
            .with_conversation(
                Conversation::new("C0ENG0001", ConversationKind::Channel, "#eng"),
                vec![
                    Message::new("C0ENG0001", &latest_ts, Some("U2"), "latest news"),
                    Message::new(
                        "C0ENG0001",
                        &older_ts,
                        Some("U3"),
                        "could someone double check the migration plan before we run it tonight",
                    ),
                ],
            )
            .with_conversation(
                Conversation::new("D0BOB0001", ConversationKind::DirectMessage, "D0BOB0001")
                    .with_peer("U2"),
                vec![Message::new("D0BOB0001", &ago(5), Some("U2"), "got a minute?")],
            )
            .with_conversation(
                Conversation::new("D0CAR0001", ConversationKind::DirectMessage, "D0CAR0001")
                    .with_peer("U3"),
                vec![Message::new("D0CAR0001", &ago(7), Some("U3"), "lunch?")],
            )
            .with_thread(
                "C0ENG0001",
                &thread_root,
                vec![
                    Message::new("C0ENG0001", &thread_root, Some("U2"), "rollout thread"),
                    Message::new("C0ENG0001", &ago(50), Some("U3"), "first step done")
                        .in_thread(thread_root.clone()),
                    Message::new("C0ENG0001", &ago(40), Some("U2"), "second step done")
                        .in_thread(thread_root.clone()),
                ],
            ),
    );
    let home = Arc::new(ScriptedWorkspace::new("U_HOME", "al").with_conversation(
        Conversation::new("C0FAM0001", ConversationKind::Channel, "#family"),
        vec![Message::new("C0FAM0001", &ago(20), Some("U9"), "<!channel> dinner at 7?")],
    ));
    let connector = StaticConnector::new()
        .with_workspace("work", work.clone())
        .with_workspace("home", home.clone());
    Fixture {
        service: DigestService::new(registry(), Arc::new(connector)),
        work,
        home,
        latest_ts,
        older_ts,
        thread_root,
    }
}

#[tokio::test(start_paused = true)]
async fn test_summary_without_workspace_uses_default() {
    let f = fixture();
    let digest = f.service.summary(None, Mode::Quick, 24).await.unwrap();
    assert_eq!(digest.workspace_id, "work");
    assert_eq!(digest.counts.direct_messages, 2);
    assert_eq!(f.home.calls(AUTH_TEST), 0);

    let home = f.service.summary(Some("Home"), Mode::Quick, 24).await.unwrap();
    assert_eq!(home.workspace_name, "Home");
    assert_eq!(home.counts.mentions, 1);
    assert_eq!(home.counts.action_items, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_workspace_is_configuration_error() {
    let f = fixture();
    let err = f
        .service
        .summary(Some("play"), Mode::Quick, 24)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("work"));
}

#[tokio::test(start_paused = true)]
async fn test_gateways_are_reused_per_workspace() {
    let f = fixture();
    f.service.summary(None, Mode::Quick, 24).await.unwrap();
    f.service.summary(Some("work"), Mode::Full, 24).await.unwrap();
    assert_eq!(f.work.calls(AUTH_TEST), 1);
    assert_eq!(f.work.calls(CONVERSATIONS_LIST), 1);
}

#[tokio::test(start_paused = true)]
async fn test_workspaces_listed_in_priority_order() {
    let f = fixture();
    let listed = f.service.workspaces();
    let ids: Vec<_> = listed.iter().map(|w| w.id.as_str()).collect();
    assert_eq!(ids, vec!["work", "home"]);
    assert!(listed[0].is_default);
    assert!(!listed[1].is_default);
}

#[tokio::test(start_paused = true)]
async fn test_channel_targets_resolve_by_name_and_id() {
    let f = fixture();
    for target in ["#eng", "eng", "ENG", "C0ENG0001"] {
        let view = f.service.channel(None, target, 20).await.unwrap();
        assert_eq!(view.conversation.id, "C0ENG0001", "target {}", target);
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[1].message.text, "latest news");
    }

    let err = f.service.channel(None, "#nope", 20).await.unwrap_err();
    assert!(matches!(err, DigestError::NotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_dm_lookup_prefers_exact_then_partial() {
    let f = fixture();
    let by_handle = f.service.dm(None, "@bob", 10).await.unwrap();
    assert_eq!(by_handle.conversation.id, "D0BOB0001");
    assert_eq!(by_handle.conversation.name, "@Bob Builder");

    let by_partial_name = f.service.dm(None, "danvers", 10).await.unwrap();
    assert_eq!(by_partial_name.conversation.id, "D0CAR0001");
    assert_eq!(by_partial_name.messages[0].message.text, "lunch?");

    let via_channel = f.service.channel(None, "@Carol", 10).await.unwrap();
    assert_eq!(via_channel.conversation.id, "D0CAR0001");

    let err = f.service.dm(None, "zed", 10).await.unwrap_err();
    assert!(matches!(err, DigestError::NotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_channels_listing_labels_dms() {
    let f = fixture();
    let dms = f
        .service
        .channels(None, ConversationFilter::DirectMessages)
        .await
        .unwrap();
    let names: Vec<_> = dms.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["@Bob Builder", "@Carol Danvers"]);
}

#[tokio::test(start_paused = true)]
async fn test_thread_view() {
    let f = fixture();
    let view = f
        .service
        .thread(None, "#eng", &f.thread_root)
        .await
        .unwrap();
    let texts: Vec<_> = view.messages.iter().map(|m| m.message.text.as_str()).collect();
    assert_eq!(texts, vec!["rollout thread", "first step done", "second step done"]);
}

#[tokio::test(start_paused = true)]
async fn test_send_quotes_older_message() {
    let f = fixture();
    let sent = f
        .service
        .send(None, "#eng", "done, looks good", Some(&f.older_ts))
        .await
        .unwrap();
    assert!(sent.with_context);
    assert_eq!(sent.conversation_id, "C0ENG0001");

    let posted = f.work.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(
        posted[0].text,
        "> could someone double check the migration plan...\ndone, looks good"
    );
    assert_eq!(posted[0].thread_ts, None);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_latest_message_has_no_quote() {
    let f = fixture();
    let sent = f
        .service
        .send(None, "C0ENG0001", "thanks", Some(&f.latest_ts))
        .await
        .unwrap();
    assert!(!sent.with_context);
    assert_eq!(f.work.posted()[0].text, "thanks");
}

#[tokio::test(start_paused = true)]
async fn test_reply_quotes_earlier_thread_message() {
    let f = fixture();
    let first_reply = f.service.thread(None, "#eng", &f.thread_root).await.unwrap().messages[1]
        .message
        .ts
        .clone();

    let sent = f
        .service
        .reply(None, "#eng", &f.thread_root, "nice", Some(&first_reply))
        .await
        .unwrap();
    assert!(sent.with_context);
    assert_eq!(sent.thread_ts.as_deref(), Some(f.thread_root.as_str()));
    let posted = f.work.posted();
    assert_eq!(posted[0].text, "> first step done\nnice");
    assert_eq!(posted[0].thread_ts.as_deref(), Some(f.thread_root.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_ambiguous_write_is_reported() {
    let f = fixture();
    f.work
        .set_write_failure(Some(digest_core::error::ApiError::timeout("timed out")));
    let err = f.service.send(None, "#eng", "hello", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteAmbiguous);
    assert!(err.to_string().contains("check the conversation"));
}

#[tokio::test(start_paused = true)]
async fn test_react_strips_colons() {
    let f = fixture();
    f.service
        .react(Some("work"), "#eng", &f.latest_ts, ":tada:")
        .await
        .unwrap();
    let reactions = f.work.reactions();
    assert_eq!(reactions[0].emoji, "tada");
    assert_eq!(reactions[0].ts, f.latest_ts);
}

#[tokio::test(start_paused = true)]
async fn test_empty_search_query_is_rejected() {
    let f = fixture();
    let err = f.service.search(None, "  ", 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn test_unread_through_service() {
    let f = fixture();
    let report = f
        .service
        .unread(None, UnreadRequest::default())
        .await
        .unwrap();
    assert_eq!(report.workspace_id, "work");
    assert_eq!(report.conversations[0].conversation_id, "D0BOB0001");
}

#[tokio::test(start_paused = true)]
async fn test_render_summary_markdown() {
    let f = fixture();
    let markdown = f.service.render_summary(Some("home"), 24, false).await.unwrap();
    assert!(markdown.starts_with("# Slack Digest - Home"));
    assert!(markdown.contains("## Mentions"));
    assert!(markdown.contains("@channel dinner at 7?"));

    let actions = f.service.render_summary(None, 24, true).await.unwrap();
    assert!(actions.starts_with("# Needs Your Attention"));
    assert!(actions.contains("## Work"));
}

#[tokio::test(start_paused = true)]
async fn test_render_all_joins_workspaces_in_priority_order() {
    let f = fixture();
    let markdown = f.service.render_all(Mode::Full, 24, false).await.unwrap();
    let work = markdown.find("# Slack Digest - Work").unwrap();
    let home = markdown.find("# Slack Digest - Home").unwrap();
    assert!(work < home);
    assert!(markdown.contains("\n---\n"));
}
