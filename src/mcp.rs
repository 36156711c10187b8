// ABOUTME: MCP (Model Context Protocol) tool server for slack-digest over stdio
// ABOUTME: Line-delimited JSON-RPC; each tool maps to one DigestService operation

use anyhow::{Context, Result};
use chrono::Utc;
use digest_core::aggregator::{SearchReport, UnreadReport, UnreadRequest};
use digest_core::digest::{AnnotatedMessage, Mode};
use digest_core::format::{self, clean_text, relative_time, MarkdownOptions};
use digest_core::service::{ConversationView, DigestService, WorkspaceInfo};
use digest_core::traits::{Conversation, ConversationFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const PROTOCOL_VERSION: &str = "2025-06-18";
const DEFAULT_LIMIT: u64 = 20;
const UNREAD_PREVIEW: usize = 3;

/// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response structure
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

/// Tool definition for MCP
#[derive(Debug, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Successful tool output: human-readable text plus the same data as JSON.
struct ToolOutput {
    text: String,
    structured: Value,
}

type ToolResult = std::result::Result<ToolOutput, String>;

fn workspace_property() -> Value {
    json!({
        "type": "string",
        "description": "Workspace id (optional, defaults to the default workspace)"
    })
}

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolDefinition {
    let mut properties = properties;
    if let Some(map) = properties.as_object_mut() {
        map.insert("workspace".to_string(), workspace_property());
    }
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required
        }),
    }
}

/// Get list of available tools
pub fn get_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "slack_workspaces".to_string(),
            description: "List all configured Slack workspaces".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        tool(
            "slack_summary",
            "Summarize Slack activity (DMs, mentions, action items, channels). 'quick' scans recently active conversations, 'full' scans every conversation.",
            json!({
                "mode": {
                    "type": "string",
                    "enum": ["quick", "full"],
                    "description": "'quick' (default) or 'full'",
                    "default": "quick"
                },
                "hours": {
                    "type": "number",
                    "description": "Hours to look back (default: 24)",
                    "default": 24
                }
            }),
            &[],
        ),
        tool(
            "slack_unread",
            "Get unread messages from DMs and channels",
            json!({
                "hours": {
                    "type": "number",
                    "description": "Hours to look back (default: 24)",
                    "default": 24
                },
                "max_dms": {
                    "type": "number",
                    "description": "Max DM conversations to check (default: 15)",
                    "default": 15
                },
                "max_channels": {
                    "type": "number",
                    "description": "Max channels to check (default: 15)",
                    "default": 15
                }
            }),
            &[],
        ),
        tool(
            "slack_channel",
            "Read recent messages from a channel",
            json!({
                "channel": {
                    "type": "string",
                    "description": "Channel name (#general), person (@alice) or conversation ID"
                },
                "limit": {
                    "type": "number",
                    "description": "Number of messages to fetch (default: 20)",
                    "default": 20
                }
            }),
            &["channel"],
        ),
        tool(
            "slack_dm",
            "Read recent messages from the DM conversation with a person",
            json!({
                "person": {
                    "type": "string",
                    "description": "Person's handle or name, partial names allowed ('jen', '@jennifer', 'Jen Rexford')"
                },
                "limit": {
                    "type": "number",
                    "description": "Number of messages to fetch (default: 20)",
                    "default": 20
                }
            }),
            &["person"],
        ),
        tool(
            "slack_thread",
            "Read the messages of a thread",
            json!({
                "channel": {
                    "type": "string",
                    "description": "Channel name or ID"
                },
                "thread_ts": {
                    "type": "string",
                    "description": "Timestamp of the thread's parent message"
                }
            }),
            &["channel", "thread_ts"],
        ),
        tool(
            "slack_search",
            "Search messages across the workspace",
            json!({
                "query": {
                    "type": "string",
                    "description": "Search query (supports Slack search syntax)"
                },
                "count": {
                    "type": "number",
                    "description": "Number of results (default: 20)",
                    "default": 20
                }
            }),
            &["query"],
        ),
        tool(
            "slack_channels",
            "List conversations you're a member of",
            json!({
                "type": {
                    "type": "string",
                    "enum": ["all", "channels", "dms", "groups"],
                    "description": "Filter by type (default: 'channels')",
                    "default": "channels"
                }
            }),
            &[],
        ),
        tool(
            "slack_send",
            "Send a message to a channel or DM. When answering a message that is not the most recent, pass reply_to_ts to quote it.",
            json!({
                "channel": {
                    "type": "string",
                    "description": "Channel name (#channel), person (@username) or conversation ID"
                },
                "text": {
                    "type": "string",
                    "description": "Message text"
                },
                "reply_to_ts": {
                    "type": "string",
                    "description": "Timestamp of the message being answered"
                }
            }),
            &["channel", "text"],
        ),
        tool(
            "slack_reply",
            "Reply in a thread. When answering a reply that is not the most recent in the thread, pass reply_to_ts to quote it.",
            json!({
                "channel": {
                    "type": "string",
                    "description": "Channel name or ID"
                },
                "thread_ts": {
                    "type": "string",
                    "description": "Timestamp of the thread's parent message"
                },
                "text": {
                    "type": "string",
                    "description": "Reply text"
                },
                "reply_to_ts": {
                    "type": "string",
                    "description": "Timestamp of the reply being answered"
                }
            }),
            &["channel", "thread_ts", "text"],
        ),
        tool(
            "slack_react",
            "Add an emoji reaction to a message",
            json!({
                "channel": {
                    "type": "string",
                    "description": "Channel name or ID"
                },
                "timestamp": {
                    "type": "string",
                    "description": "Message timestamp"
                },
                "emoji": {
                    "type": "string",
                    "description": "Emoji name ('thumbsup', 'eyes', ':white_check_mark:')"
                }
            }),
            &["channel", "timestamp", "emoji"],
        ),
    ]
}

/// Dispatches JSON-RPC requests to the digest service.
pub struct McpServer {
    service: Arc<DigestService>,
}

impl McpServer {
    pub fn new(service: Arc<DigestService>) -> Self {
        Self { service }
    }

    /// Serve line-delimited JSON-RPC until the reader closes.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.context("Failed to read request")? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                let mut encoded =
                    serde_json::to_string(&response).context("Failed to encode response")?;
                encoded.push('\n');
                writer
                    .write_all(encoded.as_bytes())
                    .await
                    .context("Failed to write response")?;
                writer.flush().await.context("Failed to flush response")?;
            }
        }
        tracing::info!("MCP client closed the connection");
        Ok(())
    }

    /// Handle one raw line. Notifications produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable MCP request");
                Some(JsonRpcResponse::error(
                    Some(Value::Null),
                    -32700,
                    format!("Parse error: {}", e),
                ))
            }
        }
    }

    /// Handle MCP JSON-RPC requests
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!(method = %request.method, "MCP request received");

        if request.id.is_none() {
            handle_notification(&request);
            return None;
        }

        let response = match request.method.as_str() {
            "initialize" => handle_initialize(&request),
            "ping" => JsonRpcResponse::result(request.id.clone(), json!({})),
            "tools/list" => handle_tools_list(&request),
            "tools/call" => self.handle_tools_call(&request).await,
            _ => JsonRpcResponse::error(
                request.id.clone(),
                -32601,
                format!("Method not found: {}", request.method),
            ),
        };
        Some(response)
    }

    /// Handle tools/call request
    async fn handle_tools_call(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let params = &request.params;
        let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        tracing::info!(tool = %tool_name, "MCP tool call");

        let result = self.call_tool(tool_name, &arguments).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            "slack_digest_tool_calls_total",
            "tool" => tool_name.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        match result {
            Ok(output) => JsonRpcResponse::result(
                request.id.clone(),
                json!({
                    "content": [{
                        "type": "text",
                        "text": output.text
                    }],
                    "structuredContent": output.structured
                }),
            ),
            Err(error) => {
                tracing::warn!(tool = %tool_name, error = %error, "MCP tool call failed");
                JsonRpcResponse::result(
                    request.id.clone(),
                    json!({
                        "content": [{
                            "type": "text",
                            "text": error
                        }],
                        "isError": true
                    }),
                )
            }
        }
    }

    async fn call_tool(&self, name: &str, args: &Value) -> ToolResult {
        let workspace = optional_str(args, "workspace");
        match name {
            "slack_workspaces" => Ok(workspaces_output(&self.service.workspaces())),
            "slack_summary" => self.summary(workspace, args).await,
            "slack_unread" => self.unread(workspace, args).await,
            "slack_channel" => {
                let channel = required_str(args, "channel")?;
                let limit = positive_number(args, "limit", DEFAULT_LIMIT)? as usize;
                let view = self
                    .service
                    .channel(workspace, channel, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(view_output(&format!("Recent messages in {}:", view.conversation.name), &view))
            }
            "slack_dm" => {
                let person = required_str(args, "person")?;
                let limit = positive_number(args, "limit", DEFAULT_LIMIT)? as usize;
                let view = self
                    .service
                    .dm(workspace, person, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(view_output(&format!("DM conversation with {}:", view.conversation.name), &view))
            }
            "slack_thread" => {
                let channel = required_str(args, "channel")?;
                let thread_ts = required_str(args, "thread_ts")?;
                let view = self
                    .service
                    .thread(workspace, channel, thread_ts)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(view_output(&format!("Thread in {}:", view.conversation.name), &view))
            }
            "slack_search" => {
                let query = required_str(args, "query")?;
                let count = positive_number(args, "count", DEFAULT_LIMIT)? as usize;
                let report = self
                    .service
                    .search(workspace, query, count)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(search_output(&report))
            }
            "slack_channels" => {
                let filter = match optional_str(args, "type") {
                    Some(kind) => kind.parse::<ConversationFilter>()?,
                    None => ConversationFilter::Channels,
                };
                let conversations = self
                    .service
                    .channels(workspace, filter)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(channels_output(&conversations))
            }
            "slack_send" => {
                let channel = required_str(args, "channel")?;
                let text = required_str(args, "text")?;
                let reply_to = optional_str(args, "reply_to_ts");
                let sent = self
                    .service
                    .send(workspace, channel, text, reply_to)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut text = format!("Message sent to {} (ts: {})", channel, sent.ts);
                if sent.with_context {
                    text.push_str(", quoting the message it answers");
                }
                Ok(ToolOutput {
                    text,
                    structured: to_json(&sent),
                })
            }
            "slack_reply" => {
                let channel = required_str(args, "channel")?;
                let thread_ts = required_str(args, "thread_ts")?;
                let text = required_str(args, "text")?;
                let reply_to = optional_str(args, "reply_to_ts");
                let sent = self
                    .service
                    .reply(workspace, channel, thread_ts, text, reply_to)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolOutput {
                    text: format!("Reply sent (ts: {})", sent.ts),
                    structured: to_json(&sent),
                })
            }
            "slack_react" => {
                let channel = required_str(args, "channel")?;
                let timestamp = required_str(args, "timestamp")?;
                let emoji = required_str(args, "emoji")?;
                self.service
                    .react(workspace, channel, timestamp, emoji)
                    .await
                    .map_err(|e| e.to_string())?;
                let emoji = emoji.trim().trim_matches(':');
                Ok(ToolOutput {
                    text: format!("Added :{}: reaction", emoji),
                    structured: json!({
                        "channel": channel,
                        "timestamp": timestamp,
                        "emoji": emoji
                    }),
                })
            }
            _ => Err(format!("Unknown tool: {}", name)),
        }
    }

    async fn summary(&self, workspace: Option<&str>, args: &Value) -> ToolResult {
        let mode = match optional_str(args, "mode") {
            Some(mode) => mode.parse::<Mode>()?,
            None => Mode::Quick,
        };
        let hours = positive_number(args, "hours", 24)? as u32;
        let digest = self
            .service
            .summary(workspace, mode, hours)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolOutput {
            text: format::to_markdown(&digest, &MarkdownOptions::default()),
            structured: to_json(&format::to_record(&digest)),
        })
    }

    async fn unread(&self, workspace: Option<&str>, args: &Value) -> ToolResult {
        let defaults = UnreadRequest::default();
        let request = UnreadRequest {
            lookback_hours: positive_number(args, "hours", defaults.lookback_hours as u64)? as u32,
            max_dms: number(args, "max_dms", defaults.max_dms as u64)? as usize,
            max_channels: number(args, "max_channels", defaults.max_channels as u64)? as usize,
            timeout: None,
        };
        let report = self
            .service
            .unread(workspace, request)
            .await
            .map_err(|e| e.to_string())?;
        Ok(unread_output(&report))
    }
}

/// Notifications (no id) are acknowledged in the log only.
fn handle_notification(request: &JsonRpcRequest) {
    match request.method.as_str() {
        "notifications/initialized" => tracing::info!("MCP initialized notification received"),
        other => tracing::debug!(method = %other, "Ignoring MCP notification"),
    }
}

/// Handle MCP initialize request
fn handle_initialize(request: &JsonRpcRequest) -> JsonRpcResponse {
    tracing::info!("MCP initialize request received");
    JsonRpcResponse::result(
        request.id.clone(),
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": "slack-digest",
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

/// Handle tools/list request
fn handle_tools_list(request: &JsonRpcRequest) -> JsonRpcResponse {
    JsonRpcResponse::result(
        request.id.clone(),
        json!({
            "tools": get_tools()
        }),
    )
}

// ─── Argument helpers ───────────────────────────────────────────

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    optional_str(args, key).ok_or_else(|| format!("Missing required parameter: {}", key))
}

/// Non-negative integer argument; JSON clients often send floats.
fn number(args: &Value, key: &str, default: u64) -> std::result::Result<u64, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .or_else(|| {
                value
                    .as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.round() as u64)
            })
            .ok_or_else(|| format!("Parameter {} must be a non-negative number", key)),
    }
}

fn positive_number(args: &Value, key: &str, default: u64) -> std::result::Result<u64, String> {
    match number(args, key, default)? {
        0 => Err(format!("Parameter {} must be at least 1", key)),
        n => Ok(n.min(u32::MAX as u64)),
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ─── Text renderings ────────────────────────────────────────────

fn workspaces_output(workspaces: &[WorkspaceInfo]) -> ToolOutput {
    let mut lines = vec!["Configured Slack workspaces:".to_string(), String::new()];
    for ws in workspaces {
        let marker = if ws.is_default { " (default)" } else { "" };
        lines.push(format!("- **{}**: {}{}", ws.id, ws.name, marker));
    }
    ToolOutput {
        text: lines.join("\n"),
        structured: json!({ "workspaces": workspaces }),
    }
}

fn message_line(message: &AnnotatedMessage, now: chrono::DateTime<Utc>) -> String {
    let thread_info = if message.message.reply_count > 0 {
        format!(" (thread: {} replies)", message.message.reply_count)
    } else {
        String::new()
    };
    format!(
        "[{}] **{}**{}: {}\n  _ts: {}_ [open]({})",
        relative_time(message.message.timestamp, now),
        message.author_label(),
        thread_info,
        clean_text(&message.message.text, 2_000),
        message.message.ts,
        message.permalink
    )
}

fn view_output(title: &str, view: &ConversationView) -> ToolOutput {
    let text = if view.messages.is_empty() {
        format!("No messages in {}.", view.conversation.name)
    } else {
        let now = Utc::now();
        let mut lines = vec![title.to_string(), String::new()];
        for message in &view.messages {
            lines.push(message_line(message, now));
        }
        lines.join("\n")
    };
    ToolOutput {
        text,
        structured: to_json(view),
    }
}

fn search_output(report: &SearchReport) -> ToolOutput {
    let mut text = if report.hits.is_empty() {
        format!("No results for: {}", report.query)
    } else {
        let now = Utc::now();
        let mut lines = vec![format!("Search results for '{}':", report.query), String::new()];
        for hit in &report.hits {
            lines.push(format!(
                "**{}** - {} ({})\n  {}\n  _ts: {}_ [open]({})",
                hit.conversation_name,
                hit.author_label(),
                relative_time(hit.message.timestamp, now),
                clean_text(&hit.message.text, 80),
                hit.message.ts,
                hit.permalink
            ));
        }
        lines.join("\n")
    };
    if let Some(incomplete) = &report.incomplete {
        text.push_str(&format!(
            "\n\n_Results incomplete ({}): {}_",
            incomplete.kind, incomplete.message
        ));
    }
    ToolOutput {
        text,
        structured: to_json(report),
    }
}

fn channels_output(conversations: &[Conversation]) -> ToolOutput {
    let text = if conversations.is_empty() {
        "No channels found.".to_string()
    } else {
        let mut lines = vec![format!("Channels ({}):", conversations.len())];
        // Listing arrives sorted by kind, then name
        for group in conversations.chunk_by(|a, b| a.kind == b.kind) {
            lines.push(String::new());
            lines.push(format!("### {} ({})", group[0].kind.label(), group.len()));
            lines.push(String::new());
            for conv in group {
                lines.push(format!("- {} (id: `{}`)", conv.name, conv.id));
            }
        }
        lines.join("\n")
    };
    ToolOutput {
        text,
        structured: json!({ "conversations": conversations }),
    }
}

fn unread_output(report: &UnreadReport) -> ToolOutput {
    let text = if report.conversations.is_empty() {
        "No unread messages.".to_string()
    } else {
        let now = Utc::now();
        let mut lines = vec!["Unread messages:".to_string()];
        for conv in &report.conversations {
            lines.push(String::new());
            lines.push(format!(
                "**{}** ({} messages)",
                conv.conversation_name,
                conv.messages.len()
            ));
            // Newest first in the preview
            for message in conv.messages.iter().rev().take(UNREAD_PREVIEW) {
                lines.push(format!(
                    "  - [{}] {}: \"{}\"",
                    message.author_label(),
                    relative_time(message.message.timestamp, now),
                    clean_text(&message.message.text, 60)
                ));
            }
            if conv.messages.len() > UNREAD_PREVIEW {
                lines.push(format!(
                    "  - ... and {} more",
                    conv.messages.len() - UNREAD_PREVIEW
                ));
            }
        }
        lines.join("\n")
    };
    ToolOutput {
        text,
        structured: to_json(report),
    }
}
