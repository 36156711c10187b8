// ABOUTME: Main entry point for slack-digest
// ABOUTME: Initializes logging and configuration, then runs the stdio tool server or a batch summary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use digest_core::config::CredentialRegistry;
use digest_core::digest::Mode;
use digest_core::service::DigestService;
use slack_digest::batch::{self, BatchOptions};
use slack_digest::mcp::McpServer;
use slack_digest::platform::SlackConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "slack-digest", version, about = "Slack activity digests across workspaces")]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Overall budget in seconds for summary and unread requests
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve MCP tools over stdin/stdout
    Serve,
    /// Render a Markdown summary
    Summary {
        /// Workspace id (defaults to the default workspace)
        #[arg(short, long, conflicts_with = "all_workspaces")]
        workspace: Option<String>,
        /// Summarize every configured workspace in priority order
        #[arg(long)]
        all_workspaces: bool,
        /// Hours to look back
        #[arg(long, default_value_t = 24)]
        hours: u32,
        /// quick or full
        #[arg(long, default_value = "full")]
        mode: Mode,
        /// Only the messages that need a response, as a table
        #[arg(long)]
        action_items_only: bool,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List configured workspaces
    Workspaces,
}

fn init_logging(json: bool) {
    // stdout carries the tool protocol and batch output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    dotenvy::dotenv().ok();
    let registry = CredentialRegistry::load().context("Failed to load workspace configuration")?;
    tracing::info!(
        workspaces = registry.len(),
        default = registry.default_id().unwrap_or("none"),
        "Configuration loaded"
    );

    let mut service = DigestService::new(registry, Arc::new(SlackConnector::new()));
    if let Some(secs) = cli.timeout_secs {
        service = service.with_summary_timeout(Duration::from_secs(secs));
    }

    match cli.command {
        Command::Serve => {
            tracing::info!("Starting MCP server on stdio");
            let server = McpServer::new(Arc::new(service));
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            server.serve(stdin, tokio::io::stdout()).await?;
        }
        Command::Summary {
            workspace,
            all_workspaces,
            hours,
            mode,
            action_items_only,
            output,
        } => {
            let options = BatchOptions {
                workspace,
                all_workspaces,
                lookback_hours: hours,
                mode,
                action_items_only,
                output,
            };
            batch::run(&service, &options).await?;
        }
        Command::Workspaces => {
            let workspaces = service.workspaces();
            if workspaces.is_empty() {
                println!("No workspaces configured.");
            }
            for ws in workspaces {
                let marker = if ws.is_default { " (default)" } else { "" };
                println!("{}\t{}\tpriority {}{}", ws.id, ws.name, ws.priority, marker);
            }
        }
    }

    Ok(())
}
