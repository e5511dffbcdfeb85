// Module: Protocol
// Wire and data model shared between the poller, dispatcher, executors and
// the upstream client. Everything here mirrors the control-plane JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of work fetched from the upstream control plane.
///
/// A delivery is unique per agent (`id`); the underlying event (`event_id`)
/// may be offered to several agents. `data` is an open mapping carrying the
/// event payload and is never validated against a schema here; the upstream
/// is authoritative for its shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Delivery {
    /// Delivery identifier, unique within this agent's lifetime.
    pub id: String,

    /// Event identifier, shared across agents.
    #[serde(default)]
    pub event_id: String,

    /// Dotted event type, e.g. `alert.created` or `action.triggered`.
    pub event_type: String,

    /// Upstream emission time, ISO-8601.
    #[serde(default)]
    pub timestamp: String,

    /// Action metadata, present when the delivery was triggered by a user
    /// pressing a configured action button upstream.
    #[serde(default)]
    pub action: Option<DeliveryAction>,

    /// Free-form event payload. Always present, possibly empty.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Upstream identity of the action a delivery was triggered for.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeliveryAction {
    /// Upstream UUID of the action record.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// True when an event type carries a user-triggered action, i.e. the
/// delivery is expected to name which action to run.
pub fn event_implies_action(event_type: &str) -> bool {
    event_type == "action.triggered" || event_type.ends_with(".action_triggered")
}

impl Delivery {
    /// The action slug this delivery names, if any. Prefers the structured
    /// `action` metadata; falls back to the legacy `data.action_name` field.
    pub fn action_slug_hint(&self) -> Option<&str> {
        if let Some(action) = &self.action {
            if !action.slug.is_empty() {
                return Some(action.slug.as_str());
            }
        }
        self.data.get("action_name").and_then(Value::as_str)
    }

    /// Upstream UUID of the triggering action, or empty when absent.
    pub fn action_uuid(&self) -> &str {
        self.action.as_ref().map(|a| a.id.as_str()).unwrap_or("")
    }

    /// User-supplied parameter values for callable actions, when present.
    pub fn user_parameters(&self) -> Option<&Map<String, Value>> {
        self.data.get("parameters").and_then(Value::as_object)
    }
}

/// Response body of `GET /deliveries`.
#[derive(Debug, Default, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub events: Vec<Delivery>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Body of the claim PATCH that fences the upstream visibility window.
#[derive(Debug, Serialize)]
pub struct ClaimRequest {
    pub execution_status: &'static str,
    pub running_at: String,
}

impl ClaimRequest {
    pub fn now() -> Self {
        Self {
            execution_status: "running",
            running_at: utc_now_rfc3339(),
        }
    }
}

/// RFC3339 UTC with second precision, the only timestamp format on the wire.
pub fn utc_now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of running one action for one delivery.
///
/// For script actions `exit_code` is the OS exit status; for HTTP actions it
/// is the response status code. `-1` marks a timeout or a killed child.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A failure produced before any work ran (no output captured).
    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            exit_code,
            stderr: message.clone(),
            error: Some(message),
            ..Self::default()
        }
    }

    /// Completed iff no error was recorded and the exit code is 0 or a 2xx
    /// HTTP status. Everything else is failed.
    pub fn status(&self) -> ExecutionStatus {
        let error_free = self.error.as_deref().map_or(true, str::is_empty);
        if error_free && (self.exit_code == 0 || (200..300).contains(&self.exit_code)) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Rendered parameter set handed from the dispatcher to an executor.
/// Ordered so composed command lines and auto-built bodies are stable.
pub type RenderedParams = std::collections::BTreeMap<String, String>;

/// The PATCH envelope that closes a delivery upstream.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_status: ExecutionStatus,
    pub execution_exit_code: i32,
    pub execution_stdout: String,
    pub execution_stderr: String,
    pub execution_duration_ms: u64,
    pub execution_error: String,
    /// Local action slug that handled the delivery.
    pub execution_action_name: String,
    /// Upstream action UUID, when the delivery carried one.
    pub execution_action_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

/// One entry of the declarative action catalog pushed at startup.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub action_type: String,
    /// First declared event type; the upstream keys the catalog entry on it.
    pub trigger: String,
    pub timeout: u64,
    pub parameters: Vec<ParameterDef>,
}

/// UI schema for one user-facing parameter of a callable action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Body of `POST /actions`.
#[derive(Debug, Serialize)]
pub struct RegistrationRequest {
    pub actions: Vec<RegistrationEntry>,
}

/// Per-slug outcome returned by the catalog sync (207 carries failures).
#[derive(Debug, Default, Deserialize)]
pub struct RegistrationResponse {
    #[serde(default)]
    pub results: Vec<RegistrationOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct RegistrationOutcome {
    pub slug: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl RegistrationOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.status.eq_ignore_ascii_case("error")
    }
}
