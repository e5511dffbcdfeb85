// Module: Config
// Configuration model, JSON loader and validator. The engine only ever sees
// a config that passed `AgentConfig::validate` with zero findings.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{event_implies_action, ParameterDef};

/// Action ids are slugs: lowercase alphanumerics with `_`, `.` and `-`
/// inside, alphanumeric at both ends (two characters minimum).
static ACTION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*[a-z0-9]$").expect("valid action id regex"));

/// Root of the agent configuration file.
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

/// Where the control plane lives and how we authenticate against it.
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    /// e.g. `https://control.example.com`
    pub base_url: String,
    /// Version path prefixed to every endpoint, e.g. `/api/v1`.
    #[serde(default = "default_api_path")]
    pub api_path: String,
    /// Bearer token. Only its last 8 characters ever reach a log line.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,
    /// Seconds the upstream hides a fetched delivery from other agents.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u64,
    /// When false, a failed poll does not change the tick cadence.
    #[serde(default)]
    pub retry_on_error: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_batch: default_max_batch(),
            visibility_timeout: default_visibility_timeout(),
            retry_on_error: false,
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Ceiling kept for autoscaling; the pool starts `min_workers` workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Roots scripts may live under. Empty means unrestricted.
    #[serde(default)]
    pub allowed_script_paths: Vec<PathBuf>,
    /// Default script timeout in seconds when an action sets none.
    #[serde(default = "default_script_timeout")]
    pub script_timeout: u64,
    /// Environment overlaid on every script, below per-action env.
    #[serde(default)]
    pub global_env: BTreeMap<String, String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_script_paths: Vec::new(),
            script_timeout: default_script_timeout(),
            global_env: BTreeMap::new(),
        }
    }
}

/// One locally configured automation.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    /// Slug, unique among loaded actions.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ActionKind,
    /// Event types that activate this action.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// When set, the delivery's action slug must equal this to match.
    #[serde(default)]
    pub action_filter: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    /// Parameter key -> template string, rendered per delivery.
    #[serde(default)]
    pub parameter_map: BTreeMap<String, String>,
    /// UI schema advertised upstream for callable actions.
    #[serde(default)]
    pub parameter_defs: Vec<ParameterDef>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub source: ScriptSource,
    /// Script actions: path on disk (local) or path inside the repo (git).
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub git_options: Option<GitOptions>,
    #[serde(default)]
    pub http_spec: Option<HttpSpec>,
    /// Optional files the captured streams are mirrored into.
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Script,
    Http,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptSource {
    #[default]
    Local,
    Git,
}

/// Git checkout an action's script is served from.
#[derive(Debug, Clone, Deserialize)]
pub struct GitOptions {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    /// Minimum seconds between pulls of this repository.
    #[serde(default = "default_git_poll_interval")]
    pub poll_interval_sec: u64,
}

/// Templated request of an HTTP action. Every string is a template.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Extra query parameters overlaid on the rendered URL.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl ActionConfig {
    /// Callable actions surface as buttons upstream: at least one trigger is
    /// in the `action_triggered` family and the action has a display name.
    pub fn is_callable(&self) -> bool {
        !self.name.is_empty() && self.triggers.iter().any(|t| event_implies_action(t))
    }

    pub fn action_type(&self) -> &'static str {
        if self.is_callable() {
            "callable"
        } else {
            "automatic"
        }
    }

    /// Effective timeout in seconds with the kind-specific default.
    pub fn effective_timeout(&self, security: &SecurityConfig) -> u64 {
        match self.timeout_sec {
            Some(t) if t > 0 => t,
            _ => match self.kind {
                ActionKind::Script => security.script_timeout,
                ActionKind::Http => default_http_timeout(),
            },
        }
    }
}

/// One validation finding. Validation collects all of them instead of
/// stopping at the first, so an operator fixes the file in one pass.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("upstream.base_url is empty")]
    EmptyBaseUrl,

    #[error("upstream.token is empty")]
    EmptyToken,

    #[error("poller.interval_ms must be at least 100 (got {0})")]
    IntervalTooShort(u64),

    #[error("pool.min_workers must be at least 1")]
    NoWorkers,

    #[error("pool.max_workers ({max}) is below pool.min_workers ({min})")]
    WorkerBoundsInverted { min: usize, max: usize },

    #[error("pool.queue_size must be at least 1")]
    EmptyQueue,

    #[error("action '{id}': id does not match ^[a-z0-9][a-z0-9_.-]*[a-z0-9]$")]
    InvalidActionId { id: String },

    #[error("action '{id}': duplicate id")]
    DuplicateActionId { id: String },

    #[error("action '{id}': at least one trigger is required")]
    NoTriggers { id: String },

    #[error("action '{id}': trigger '{trigger}' is empty or blank")]
    BlankTrigger { id: String, trigger: String },

    #[error("action '{id}': script actions need a non-empty script_path")]
    MissingScriptPath { id: String },

    #[error("action '{id}': http actions need an http_spec with a url")]
    MissingHttpSpec { id: String },

    #[error("action '{id}': git-sourced actions need git_options with a url")]
    MissingGitOptions { id: String },

    #[error("action '{id}': timeout_sec must be at least 1")]
    TimeoutTooShort { id: String },

    #[error(
        "action '{id}': mixes callable triggers ({callable}) with automatic \
         triggers ({automatic}); an action is one or the other"
    )]
    MixedTriggers {
        id: String,
        callable: String,
        automatic: String,
    },

    #[error("action '{id}': callable actions (trigger '{trigger}') need a display name")]
    CallableWithoutName { id: String, trigger: String },
}

/// Read and parse the configuration file. Validation is a separate step so
/// the `check` subcommand can print every finding.
pub fn load(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: AgentConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

impl AgentConfig {
    /// Check every invariant the engine relies on. Returns all findings.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut findings = Vec::new();

        if self.upstream.base_url.trim().is_empty() {
            findings.push(ConfigError::EmptyBaseUrl);
        }
        if self.upstream.token.trim().is_empty() {
            findings.push(ConfigError::EmptyToken);
        }
        if self.poller.interval_ms < 100 {
            findings.push(ConfigError::IntervalTooShort(self.poller.interval_ms));
        }
        if self.pool.min_workers == 0 {
            findings.push(ConfigError::NoWorkers);
        }
        if self.pool.max_workers < self.pool.min_workers {
            findings.push(ConfigError::WorkerBoundsInverted {
                min: self.pool.min_workers,
                max: self.pool.max_workers,
            });
        }
        if self.pool.queue_size == 0 {
            findings.push(ConfigError::EmptyQueue);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for action in &self.actions {
            if !ACTION_ID_RE.is_match(&action.id) {
                findings.push(ConfigError::InvalidActionId {
                    id: action.id.clone(),
                });
            }
            if !seen.insert(action.id.as_str()) {
                findings.push(ConfigError::DuplicateActionId {
                    id: action.id.clone(),
                });
            }
            self.validate_action(action, &mut findings);
        }

        findings
    }

    fn validate_action(&self, action: &ActionConfig, findings: &mut Vec<ConfigError>) {
        if action.triggers.is_empty() {
            findings.push(ConfigError::NoTriggers {
                id: action.id.clone(),
            });
        }
        for trigger in &action.triggers {
            if trigger.trim().is_empty() {
                findings.push(ConfigError::BlankTrigger {
                    id: action.id.clone(),
                    trigger: trigger.clone(),
                });
            }
        }

        // An action is callable or automatic, never both.
        let callable: Vec<&str> = action
            .triggers
            .iter()
            .filter(|t| event_implies_action(t))
            .map(String::as_str)
            .collect();
        let automatic: Vec<&str> = action
            .triggers
            .iter()
            .filter(|t| !t.trim().is_empty() && !event_implies_action(t))
            .map(String::as_str)
            .collect();
        if !callable.is_empty() && !automatic.is_empty() {
            findings.push(ConfigError::MixedTriggers {
                id: action.id.clone(),
                callable: callable.join(", "),
                automatic: automatic.join(", "),
            });
        }
        if !callable.is_empty() && action.name.trim().is_empty() {
            findings.push(ConfigError::CallableWithoutName {
                id: action.id.clone(),
                trigger: callable[0].to_string(),
            });
        }

        if let Some(timeout) = action.timeout_sec {
            if timeout < 1 {
                findings.push(ConfigError::TimeoutTooShort {
                    id: action.id.clone(),
                });
            }
        }

        match action.kind {
            ActionKind::Script => {
                let missing = action
                    .script_path
                    .as_deref()
                    .map_or(true, |p| p.trim().is_empty());
                if missing {
                    findings.push(ConfigError::MissingScriptPath {
                        id: action.id.clone(),
                    });
                }
                if action.source == ScriptSource::Git {
                    let missing_git = action
                        .git_options
                        .as_ref()
                        .map_or(true, |g| g.url.trim().is_empty());
                    if missing_git {
                        findings.push(ConfigError::MissingGitOptions {
                            id: action.id.clone(),
                        });
                    }
                }
            }
            ActionKind::Http => {
                let missing = action
                    .http_spec
                    .as_ref()
                    .map_or(true, |s| s.url.trim().is_empty());
                if missing {
                    findings.push(ConfigError::MissingHttpSpec {
                        id: action.id.clone(),
                    });
                }
            }
        }
    }
}

fn default_api_path() -> String {
    "/api/v1".to_string()
}
fn default_interval_ms() -> u64 {
    5_000
}
fn default_max_batch() -> u32 {
    10
}
fn default_visibility_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    5
}
fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    4
}
fn default_queue_size() -> usize {
    1_000
}
fn default_script_timeout() -> u64 {
    300
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_git_poll_interval() -> u64 {
    300
}
pub fn default_http_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_config(actions: serde_json::Value) -> AgentConfig {
        let raw = json!({
            "upstream": {
                "base_url": "https://control.example.com",
                "token": "sk-test-0123456789abcdef"
            },
            "actions": actions
        });
        serde_json::from_value(raw).unwrap()
    }

    fn script_action(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "kind": "script",
            "triggers": ["alert.created"],
            "script_path": "/opt/scripts/a.sh"
        })
    }

    #[test]
    fn defaults_are_applied() {
        let config = minimal_config(json!([]));
        assert_eq!(config.upstream.api_path, "/api/v1");
        assert_eq!(config.poller.interval_ms, 5_000);
        assert_eq!(config.poller.max_batch, 10);
        assert_eq!(config.poller.visibility_timeout, 300);
        assert!(!config.poller.retry_on_error);
        assert_eq!(config.poller.backoff, BackoffKind::Exponential);
        assert_eq!(config.pool.queue_size, 1_000);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.security.script_timeout, 300);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn valid_action_ids_pass() {
        for id in ["a1", "aa", "restart_pods", "db.backup-v2", "0x0"] {
            let config = minimal_config(json!([script_action(id)]));
            assert!(config.validate().is_empty(), "{id} should be valid");
        }
    }

    #[test]
    fn invalid_action_ids_are_rejected() {
        // Both ends must be alphanumeric, so one character is too short.
        for id in ["", "a", "-a", "a-", "A", "has space", "Ünicode", ".dot"] {
            let config = minimal_config(json!([{
                "id": id,
                "kind": "script",
                "triggers": ["alert.created"],
                "script_path": "/opt/scripts/a.sh"
            }]));
            let findings = config.validate();
            assert!(
                findings
                    .iter()
                    .any(|f| matches!(f, ConfigError::InvalidActionId { .. })),
                "{id:?} should be rejected, got {findings:?}"
            );
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = minimal_config(json!([script_action("dup"), script_action("dup")]));
        assert!(config
            .validate()
            .iter()
            .any(|f| matches!(f, ConfigError::DuplicateActionId { .. })));
    }

    #[test]
    fn script_without_path_is_rejected() {
        let config = minimal_config(json!([{
            "id": "fixture_action",
            "kind": "script",
            "triggers": ["alert.created"]
        }]));
        assert!(config
            .validate()
            .iter()
            .any(|f| matches!(f, ConfigError::MissingScriptPath { .. })));
    }

    #[test]
    fn http_without_spec_is_rejected() {
        let config = minimal_config(json!([{
            "id": "fixture_action",
            "kind": "http",
            "triggers": ["action.triggered"],
            "name": "Ping"
        }]));
        assert!(config
            .validate()
            .iter()
            .any(|f| matches!(f, ConfigError::MissingHttpSpec { .. })));
    }

    #[test]
    fn git_source_requires_options() {
        let config = minimal_config(json!([{
            "id": "fixture_action",
            "kind": "script",
            "triggers": ["alert.created"],
            "source": "git",
            "script_path": "scripts/a.sh"
        }]));
        assert!(config
            .validate()
            .iter()
            .any(|f| matches!(f, ConfigError::MissingGitOptions { .. })));
    }

    #[test]
    fn mixed_triggers_are_rejected() {
        let config = minimal_config(json!([{
            "id": "fixture_action",
            "kind": "script",
            "name": "Mixed",
            "triggers": ["action.triggered", "alert.created"],
            "script_path": "/opt/scripts/a.sh"
        }]));
        assert!(config
            .validate()
            .iter()
            .any(|f| matches!(f, ConfigError::MixedTriggers { .. })));
    }

    #[test]
    fn callable_needs_a_name() {
        let config = minimal_config(json!([{
            "id": "fixture_action",
            "kind": "script",
            "triggers": ["incident.action_triggered"],
            "script_path": "/opt/scripts/a.sh"
        }]));
        assert!(config
            .validate()
            .iter()
            .any(|f| matches!(f, ConfigError::CallableWithoutName { .. })));
    }

    #[test]
    fn classification() {
        let config = minimal_config(json!([
            {
                "id": "callable",
                "kind": "http",
                "name": "Ping",
                "triggers": ["action.triggered"],
                "http_spec": {"url": "https://example.com"}
            },
            script_action("automatic")
        ]));
        assert!(config.actions[0].is_callable());
        assert_eq!(config.actions[0].action_type(), "callable");
        assert!(!config.actions[1].is_callable());
        assert_eq!(config.actions[1].action_type(), "automatic");
    }

    #[test]
    fn effective_timeout_defaults_by_kind() {
        let config = minimal_config(json!([
            script_action("script_default"),
            {
                "id": "http_hook",
                "kind": "http",
                "triggers": ["alert.created"],
                "http_spec": {"url": "https://example.com"}
            },
            {
                "id": "explicit",
                "kind": "script",
                "triggers": ["alert.created"],
                "script_path": "/opt/scripts/a.sh",
                "timeout_sec": 7
            }
        ]));
        let security = &config.security;
        assert_eq!(config.actions[0].effective_timeout(security), 300);
        assert_eq!(config.actions[1].effective_timeout(security), 30);
        assert_eq!(config.actions[2].effective_timeout(security), 7);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/config.json"));
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.json");
        let config = load(&path).unwrap();
        assert!(config.validate().is_empty());
        assert_eq!(config.actions.len(), 3);
        assert!(config.actions.iter().any(|a| a.source == ScriptSource::Git));
    }
}
