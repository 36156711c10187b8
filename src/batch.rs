// ABOUTME: Batch front end - renders one or every workspace digest as Markdown
// ABOUTME: Writes to a file (creating parent directories) or to stdout

use anyhow::{Context, Result};
use digest_core::digest::Mode;
use digest_core::service::DigestService;
use std::io::Write;
use std::path::{Path, PathBuf};

/// What the `summary` command renders and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub workspace: Option<String>,
    pub all_workspaces: bool,
    pub lookback_hours: u32,
    pub mode: Mode,
    pub action_items_only: bool,
    pub output: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workspace: None,
            all_workspaces: false,
            lookback_hours: 24,
            mode: Mode::Full,
            action_items_only: false,
            output: None,
        }
    }
}

pub async fn render(service: &DigestService, options: &BatchOptions) -> Result<String> {
    if options.lookback_hours == 0 {
        anyhow::bail!("--hours must be at least 1");
    }
    let markdown = if options.all_workspaces {
        service
            .render_all(options.mode, options.lookback_hours, options.action_items_only)
            .await
            .context("Failed to summarize workspaces")?
    } else {
        service
            .render_summary_with(
                options.workspace.as_deref(),
                options.mode,
                options.lookback_hours,
                options.action_items_only,
            )
            .await
            .context("Failed to summarize workspace")?
    };
    Ok(markdown)
}

pub fn write_output(markdown: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, markdown)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = markdown.len(), "Summary written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(markdown.as_bytes())
                .context("Failed to write summary to stdout")?;
            if !markdown.ends_with('\n') {
                stdout.write_all(b"\n").context("Failed to write summary to stdout")?;
            }
            stdout.flush().context("Failed to flush stdout")?;
        }
    }
    Ok(())
}

/// Render and write in one step.
pub async fn run(service: &DigestService, options: &BatchOptions) -> Result<()> {
    let markdown = render(service, options).await?;
    write_output(&markdown, options.output.as_deref())
}
