// ABOUTME: Credential registry loaded from a TOML file merged with environment variables
// ABOUTME: Applies the deterministic default-workspace rule and gateway tuning settings

use crate::error::{DigestError, Result};
use crate::gateway::retry::RetryPolicy;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SLACK_DIGEST_CONFIG";
/// Prefix of per-workspace token variables (`SLACK_TOKEN_WORK=xoxp-...`)
pub const TOKEN_ENV_PREFIX: &str = "SLACK_TOKEN_";
/// Single-workspace token variable
pub const SINGLE_TOKEN_ENV: &str = "SLACK_USER_TOKEN";
/// Overrides `default_workspace` from the file
pub const DEFAULT_WORKSPACE_ENV: &str = "SLACK_DEFAULT_WORKSPACE";

const SINGLE_WORKSPACE_ID: &str = "default";
const SINGLE_WORKSPACE_NAME: &str = "Slack";

// ─── File format ────────────────────────────────────────────────

/// Persisted configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_workspace: Option<String>,
    #[serde(default)]
    pub workspaces: BTreeMap<String, FileWorkspace>,
    #[serde(default)]
    pub settings: SettingsConfig,
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DigestError::configuration(format!("invalid config file: {}", e)))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DigestError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            DigestError::configuration(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FileWorkspace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

// Custom Debug impl to redact token
impl std::fmt::Debug for FileWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWorkspace")
            .field("name", &self.name)
            .field("token", &"[REDACTED]")
            .field("priority", &self.priority)
            .finish()
    }
}

/// Optional `[settings]` table tuning gateway behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            max_in_flight: default_max_in_flight(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Resolved gateway tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
    /// Maximum concurrent upstream calls per aggregation request
    pub max_in_flight: usize,
    /// Per-request socket timeout used by transports
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        SettingsConfig::default().resolve()
    }
}

impl SettingsConfig {
    pub fn resolve(&self) -> GatewaySettings {
        GatewaySettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.base_backoff_ms),
                max_delay: Duration::from_secs(self.max_backoff_secs),
            },
            max_in_flight: self.max_in_flight.max(1),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

// ─── Credentials ────────────────────────────────────────────────

/// A named workspace credential. Immutable once loaded.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkspaceCredential {
    pub id: String,
    pub name: String,
    pub token: String,
    /// Lower is preferred
    pub priority: i64,
}

// Custom Debug impl to redact token
impl std::fmt::Debug for WorkspaceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCredential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"[REDACTED]")
            .field("priority", &self.priority)
            .finish()
    }
}

/// All configured workspace credentials plus the default-selection rule.
#[derive(Debug, Clone)]
pub struct CredentialRegistry {
    /// In load order: file entries (by id), then environment additions
    credentials: Vec<WorkspaceCredential>,
    default_id: Option<String>,
    settings: GatewaySettings,
}

impl CredentialRegistry {
    /// Find the config file, checking multiple locations in order:
    /// 1. SLACK_DIGEST_CONFIG env var (if set)
    /// 2. ./slack-digest.toml (current directory)
    /// 3. ~/.config/slack-digest/config.toml (XDG config dir)
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "{} points to a missing file", CONFIG_PATH_ENV);
        }

        let local_config = PathBuf::from("slack-digest.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load from the config file (if any) merged with the process environment.
    pub fn load() -> Result<Self> {
        let file = match Self::find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading workspace configuration from file");
                Some(FileConfig::load_from(&path)?)
            }
            None => {
                tracing::info!("No config file found, using environment variables only");
                None
            }
        };
        Self::from_sources(file, std::env::vars())
    }

    /// Merge file entries with environment variables. Pure and deterministic:
    /// environment variables are applied in lexical order of their names.
    pub fn from_sources<I>(file: Option<FileConfig>, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file = file.unwrap_or_default();
        let env: BTreeMap<String, String> = env.into_iter().collect();

        let mut credentials: Vec<WorkspaceCredential> = Vec::new();
        for (raw_id, ws) in &file.workspaces {
            let id = normalize_id(raw_id);
            if id.is_empty() {
                return Err(DigestError::configuration("workspace ids must not be empty"));
            }
            if ws.token.trim().is_empty() {
                return Err(DigestError::configuration(format!(
                    "workspaces.{}.token must not be empty",
                    raw_id
                )));
            }
            if credentials.iter().any(|c| c.id == id) {
                return Err(DigestError::configuration(format!(
                    "workspace id '{}' is configured twice",
                    id
                )));
            }
            credentials.push(WorkspaceCredential {
                name: ws.name.clone().unwrap_or_else(|| raw_id.clone()),
                id,
                token: ws.token.trim().to_string(),
                priority: ws.priority.unwrap_or(1),
            });
        }

        for (key, value) in &env {
            let Some(suffix) = key.strip_prefix(TOKEN_ENV_PREFIX) else {
                continue;
            };
            if suffix.is_empty() {
                continue;
            }
            let id = normalize_id(suffix);
            upsert_from_env(&mut credentials, key, &id, &title_case(&id), value)?;
        }

        if let Some(value) = env.get(SINGLE_TOKEN_ENV) {
            upsert_from_env(
                &mut credentials,
                SINGLE_TOKEN_ENV,
                SINGLE_WORKSPACE_ID,
                SINGLE_WORKSPACE_NAME,
                value,
            )?;
        }

        let configured_default = env
            .get(DEFAULT_WORKSPACE_ENV)
            .map(String::as_str)
            .or(file.default_workspace.as_deref())
            .map(normalize_id)
            .filter(|id| !id.is_empty());

        let mut settings = file.settings.clone();
        if let Some(val) = env.get("SLACK_DIGEST_CACHE_TTL_SECS") {
            settings.cache_ttl_secs = parse_env_number("SLACK_DIGEST_CACHE_TTL_SECS", val)?;
        }
        if let Some(val) = env.get("SLACK_DIGEST_MAX_IN_FLIGHT") {
            settings.max_in_flight = parse_env_number("SLACK_DIGEST_MAX_IN_FLIGHT", val)?;
        }

        let default_id = select_default(&credentials, configured_default);

        tracing::debug!(
            workspaces = credentials.len(),
            default = ?default_id,
            "Credential registry loaded"
        );

        Ok(Self {
            credentials,
            default_id,
            settings: settings.resolve(),
        })
    }

    /// Resolve a workspace id, or the default credential when `None`.
    pub fn resolve(&self, workspace: Option<&str>) -> Result<&WorkspaceCredential> {
        if self.credentials.is_empty() {
            return Err(DigestError::configuration(format!(
                "no Slack workspaces configured. Either:\n\
                 1. Create {} (or point {} at a config file)\n\
                 2. Set {}<name> environment variables\n\
                 3. Set the {} environment variable",
                paths::config_file().display(),
                CONFIG_PATH_ENV,
                TOKEN_ENV_PREFIX,
                SINGLE_TOKEN_ENV
            )));
        }

        match workspace {
            Some(requested) => {
                let id = normalize_id(requested);
                self.get(&id).ok_or_else(|| {
                    DigestError::configuration(format!(
                        "unknown workspace '{}' (configured: {})",
                        requested,
                        self.ids().join(", ")
                    ))
                })
            }
            None => self
                .default_id
                .as_deref()
                .and_then(|id| self.get(id))
                .ok_or_else(|| {
                    DigestError::configuration("no default workspace could be selected")
                }),
        }
    }

    /// Credentials ordered by priority (ties keep load order).
    pub fn list(&self) -> Vec<&WorkspaceCredential> {
        let mut list: Vec<&WorkspaceCredential> = self.credentials.iter().collect();
        list.sort_by_key(|c| c.priority);
        list
    }

    pub fn get(&self, id: &str) -> Option<&WorkspaceCredential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    pub fn is_default(&self, id: &str) -> bool {
        self.default_id.as_deref() == Some(id)
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn with_settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = settings;
        self
    }

    fn ids(&self) -> Vec<&str> {
        self.list().into_iter().map(|c| c.id.as_str()).collect()
    }
}

fn upsert_from_env(
    credentials: &mut Vec<WorkspaceCredential>,
    var: &str,
    id: &str,
    name: &str,
    token: &str,
) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(DigestError::configuration(format!("{} is set but empty", var)));
    }
    if let Some(existing) = credentials.iter_mut().find(|c| c.id == id) {
        tracing::debug!(workspace = %id, var = %var, "Environment overrides workspace token");
        existing.token = token.to_string();
        return Ok(());
    }
    let priority = credentials.len() as i64 + 1;
    credentials.push(WorkspaceCredential {
        id: id.to_string(),
        name: name.to_string(),
        token: token.to_string(),
        priority,
    });
    Ok(())
}

/// Explicit default if configured, else lowest priority (first loaded wins ties).
fn select_default(
    credentials: &[WorkspaceCredential],
    configured: Option<String>,
) -> Option<String> {
    if let Some(id) = configured {
        if credentials.iter().any(|c| c.id == id) {
            return Some(id);
        }
        tracing::warn!(
            workspace = %id,
            "Configured default workspace does not exist, falling back to priority order"
        );
    }
    credentials
        .iter()
        .min_by_key(|c| c.priority)
        .map(|c| c.id.clone())
}

fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}

fn title_case(id: &str) -> String {
    id.split(|c: char| c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_env_number<T: std::str::FromStr>(var: &str, val: &str) -> Result<T> {
    val.trim().parse().map_err(|_| {
        DigestError::configuration(format!("{} must be a valid number, got: {}", var, val))
    })
}
