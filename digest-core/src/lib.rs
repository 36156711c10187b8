// ABOUTME: Multi-workspace Slack activity aggregation - registry, gateway, aggregator, formatter
// ABOUTME: Transport-agnostic core shared by the tool server and the batch digest command

pub mod aggregator;
pub mod classify;
pub mod config;
pub mod digest;
pub mod error;
pub mod format;
pub mod gateway;
pub mod metrics;
pub mod paths;
pub mod service;
pub mod testing;
pub mod traits;

pub use aggregator::{Aggregator, SearchReport, SummaryRequest, UnreadReport, UnreadRequest};
pub use classify::{Category, HeuristicMatcher, MessageMatcher};
pub use config::{CredentialRegistry, GatewaySettings, WorkspaceCredential};
pub use digest::{AnnotatedMessage, Digest, Mode, SkippedConversation};
pub use error::{ApiError, DigestError, ErrorKind, Result};
pub use gateway::{Gateway, MessageQuery};
pub use service::{ApiConnector, ConversationView, DigestService, SentMessage, WorkspaceInfo};

// Re-export the upstream seam and its data types
pub use traits::{
    Conversation, ConversationFilter, ConversationKind, Identity, Message, MessageRef, Page, User,
    WorkspaceApi,
};
