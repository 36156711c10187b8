// ABOUTME: Tests for the batch summary front end
// ABOUTME: Renders scripted workspaces to Markdown and writes files into temporary directories

use chrono::{Duration as ChronoDuration, Utc};
use digest_core::config::{CredentialRegistry, FileConfig};
use digest_core::digest::Mode;
use digest_core::error::ApiError;
use digest_core::service::DigestService;
use digest_core::testing::*;
use digest_core::traits::{format_ts, Conversation, ConversationKind, Message};
use slack_digest::batch::{self, BatchOptions};
use std::sync::Arc;

fn ago(minutes: i64) -> String {
    format_ts(Utc::now() - ChronoDuration::minutes(minutes))
}

fn service(home_listing_fails: bool) -> DigestService {
    let work = Arc::new(
        ScriptedWorkspace::new("U_ME", "alice")
            .with_user("U2", "bob", "Bob Builder")
            .with_conversation(
                Conversation::new("C0ENG0001", ConversationKind::Channel, "#eng"),
                vec![Message::new(
                    "C0ENG0001",
                    &ago(15),
                    Some("U2"),
                    "<@U_ME> can you approve the release?",
                )],
            ),
    );
    let home = Arc::new(ScriptedWorkspace::new("U_HOME", "al").with_conversation(
        Conversation::new("C0FAM0001", ConversationKind::Channel, "#family"),
        vec![Message::new("C0FAM0001", &ago(20), Some("U9"), "photos are up")],
    ));
    if home_listing_fails {
        home.set_listing_failure(Some(ApiError::rejected("invalid_auth", "token revoked")));
    }
    let file = FileConfig::from_toml_str(
        r#"
[workspaces.work]
name = "Work"
token = "xoxp-work"
priority = 1

[workspaces.home]
name = "Home"
token = "xoxp-home"
priority = 2
"#,
    )
    .unwrap();
    let registry =
        CredentialRegistry::from_sources(Some(file), Vec::<(String, String)>::new()).unwrap();
    let connector = StaticConnector::new()
        .with_workspace("work", work.clone())
        .with_workspace("home", home.clone());
    DigestService::new(registry, Arc::new(connector))
}

#[tokio::test(start_paused = true)]
async fn test_single_workspace_defaults_to_lowest_priority() {
    let service = service(false);
    let markdown = batch::render(&service, &BatchOptions::default()).await.unwrap();
    assert!(markdown.starts_with("# Slack Digest - Work"));
    assert!(!markdown.contains("Home"));
}

#[tokio::test(start_paused = true)]
async fn test_all_workspaces_action_items_table() {
    let service = service(false);
    let options = BatchOptions {
        all_workspaces: true,
        action_items_only: true,
        mode: Mode::Quick,
        ..BatchOptions::default()
    };
    let markdown = batch::render(&service, &options).await.unwrap();
    assert!(markdown.starts_with("# Needs Your Attention"));
    assert!(markdown.contains("## Work"));
    assert!(markdown.contains("## Home"));
    assert!(markdown.contains("can you approve the release?"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_workspace_is_reported_inline() {
    let service = service(true);
    let options = BatchOptions {
        all_workspaces: true,
        ..BatchOptions::default()
    };
    let markdown = batch::render(&service, &options).await.unwrap();
    assert!(markdown.contains("# Slack Digest - Work"));
    assert!(markdown.contains("## Failed Workspaces"));
    assert!(markdown.contains("- **home**: upstream error (invalid_auth)"));
}

#[tokio::test(start_paused = true)]
async fn test_zero_hours_is_rejected() {
    let service = service(false);
    let options = BatchOptions {
        lookback_hours: 0,
        ..BatchOptions::default()
    };
    let err = batch::render(&service, &options).await.unwrap_err();
    assert!(err.to_string().contains("--hours"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_workspace_error_keeps_core_message() {
    let service = service(false);
    let options = BatchOptions {
        workspace: Some("play".to_string()),
        ..BatchOptions::default()
    };
    let err = batch::render(&service, &options).await.unwrap_err();
    assert!(format!("{:#}", err).contains("unknown workspace 'play'"));
}

#[test]
fn test_write_output_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports").join("monday").join("slack.md");
    batch::write_output("# Slack Digest - Work\n", Some(&path)).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "# Slack Digest - Work\n"
    );
}
