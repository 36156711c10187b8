// ABOUTME: Library root for slack-digest front ends
// ABOUTME: Exposes the Slack transport, the stdio tool server and the batch renderer

pub mod batch;
pub mod mcp;
pub mod platform;
