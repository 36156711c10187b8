// ABOUTME: Platform transports for slack-digest
// ABOUTME: Re-exports the Slack Web API implementation of the core's WorkspaceApi

pub mod slack;

pub use slack::{SlackConnector, SlackWebApi};
