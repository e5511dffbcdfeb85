// Module: Dispatch
// The heart of the pipeline: match a claimed delivery to an action, render
// its parameters, run the right executor and report the outcome. Every
// delivery that enters here leaves with exactly one report attempt.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ActionConfig;
use crate::executors::ActionExecutor;
use crate::metrics::{names, RecorderHandle};
use crate::protocol::{event_implies_action, Delivery, ExecutionResult, RenderedParams};
use crate::reporter::Reporter;
use crate::template::{render_or_empty, RenderContext};

/// Handler seam the worker pool drives. The dispatcher is the production
/// implementation.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken);
}

pub struct Dispatcher {
    actions: Arc<Vec<ActionConfig>>,
    executors: Vec<Box<dyn ActionExecutor>>,
    reporter: Reporter,
    recorder: RecorderHandle,
}

impl Dispatcher {
    pub fn new(
        actions: Arc<Vec<ActionConfig>>,
        executors: Vec<Box<dyn ActionExecutor>>,
        reporter: Reporter,
        recorder: RecorderHandle,
    ) -> Self {
        Self {
            actions,
            executors,
            reporter,
            recorder,
        }
    }
}

/// Decrements the running gauge on every exit path.
struct RunningGuard {
    recorder: RecorderHandle,
}

impl RunningGuard {
    fn enter(recorder: &RecorderHandle) -> Self {
        recorder.gauge_add(names::EXECUTIONS_RUNNING, 1, &[]);
        Self {
            recorder: recorder.clone(),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.recorder.gauge_add(names::EXECUTIONS_RUNNING, -1, &[]);
    }
}

/// First action in declaration order whose triggers contain the delivery's
/// event type and whose filter, if any, matches. Pure function of inputs.
pub fn match_action<'a>(
    actions: &'a [ActionConfig],
    delivery: &Delivery,
) -> Option<&'a ActionConfig> {
    actions.iter().find(|action| {
        action
            .triggers
            .iter()
            .any(|trigger| trigger == &delivery.event_type)
            && filter_matches(action, delivery)
    })
}

fn filter_matches(action: &ActionConfig, delivery: &Delivery) -> bool {
    let filter = match action.action_filter.as_deref() {
        Some(filter) if !filter.is_empty() => filter,
        // No filter expected: matches any delivery, including an
        // action-triggered one with no action identity.
        _ => return true,
    };
    match delivery.action_slug_hint() {
        // Case-sensitive, exact.
        Some(slug) => slug == filter,
        // A filter is expected but the delivery names no action: refuse to
        // guess.
        None => false,
    }
}

/// Render the parameter map, then let user-provided string values win. The
/// user value for a key may sit directly in `data` or, for keys declared in
/// `parameter_defs`, inside `data.parameters`.
pub fn prepare_params(
    action: &ActionConfig,
    delivery: &Delivery,
    ctx: &RenderContext,
) -> RenderedParams {
    let mut params = RenderedParams::new();
    for (key, template) in &action.parameter_map {
        params.insert(key.clone(), render_or_empty(template, ctx));
    }

    let mut keys: Vec<&str> = action.parameter_map.keys().map(String::as_str).collect();
    for def in &action.parameter_defs {
        if !keys.contains(&def.name.as_str()) {
            keys.push(def.name.as_str());
        }
    }

    let user_params = delivery.user_parameters();
    for key in keys {
        let user_value = delivery
            .data
            .get(key)
            .or_else(|| user_params.and_then(|p| p.get(key)));
        match user_value {
            Some(Value::String(s)) => {
                params.insert(key.to_string(), s.clone());
            }
            // Non-string user input is skipped; the rendered value stands.
            Some(_) | None => {}
        }
    }
    params
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) {
        let _running = RunningGuard::enter(&self.recorder);

        let Some(action) = match_action(&self.actions, &delivery) else {
            let observed = delivery.action_slug_hint().unwrap_or("none").to_string();
            warn!(
                delivery = %delivery.id,
                event_type = %delivery.event_type,
                observed_action = %observed,
                "no action configured; closing delivery as failed"
            );
            let result = ExecutionResult::failure(
                1,
                format!(
                    "No action configured for event type '{}' (action: {})",
                    delivery.event_type, observed
                ),
            );
            self.reporter
                .report(&delivery.id, &observed, delivery.action_uuid(), &result)
                .await;
            return;
        };

        if event_implies_action(&delivery.event_type)
            && delivery.action_slug_hint().is_none()
            && action
                .action_filter
                .as_deref()
                .map_or(true, str::is_empty)
        {
            // Filterless match of an identity-less triggered event. Allowed,
            // but operators should know it happens.
            warn!(
                delivery = %delivery.id,
                action = %action.id,
                "action-triggered delivery carries no action identity; matched by unfiltered action"
            );
        }

        let ctx = RenderContext::for_delivery(&delivery);
        let params = prepare_params(action, &delivery, &ctx);

        let Some(executor) = self.executors.iter().find(|e| e.can_handle(action.kind)) else {
            let result = ExecutionResult::failure(
                1,
                format!(
                    "no executor registered for kind '{}' (action '{}')",
                    action.kind.as_str(),
                    action.id
                ),
            );
            self.reporter
                .report(&delivery.id, &action.id, delivery.action_uuid(), &result)
                .await;
            return;
        };

        info!(
            delivery = %delivery.id,
            action = %action.id,
            kind = action.kind.as_str(),
            "executing action"
        );
        let started = Instant::now();
        let result = executor.execute(action, &delivery, &params, cancel).await;
        let status = result.status();

        self.recorder.histogram(
            names::EXECUTION_DURATION,
            &[
                ("action", &action.id),
                ("kind", action.kind.as_str()),
                ("status", status.as_str()),
            ],
            started.elapsed(),
        );
        info!(
            delivery = %delivery.id,
            action = %action.id,
            status = status.as_str(),
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "action finished"
        );

        self.reporter
            .report(&delivery.id, &action.id, delivery.action_uuid(), &result)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::executors::script::ScriptRunner;
    use crate::gitsource::GitSourceManager;
    use crate::metrics;
    use crate::upstream::{RetryPolicy, UpstreamClient};
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn delivery(value: serde_json::Value) -> Delivery {
        serde_json::from_value(value).unwrap()
    }

    fn actions_from(value: serde_json::Value) -> Vec<ActionConfig> {
        serde_json::from_value(value).unwrap()
    }

    fn reporter_for(server: &MockServer) -> Reporter {
        let config: AgentConfig = serde_json::from_value(json!({
            "upstream": {"base_url": server.uri(), "token": "sk-test-0123456789abcdef"}
        }))
        .unwrap();
        let client = UpstreamClient::with_retry(
            &config.upstream,
            metrics::noop(),
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        )
        .unwrap();
        Reporter::new(Arc::new(client))
    }

    #[test]
    fn match_is_first_in_declaration_order() {
        let actions = actions_from(json!([
            {"id": "first", "kind": "script", "triggers": ["alert.created"], "script_path": "/a"},
            {"id": "second", "kind": "script", "triggers": ["alert.created"], "script_path": "/b"}
        ]));
        let d = delivery(json!({"id": "d", "event_type": "alert.created"}));
        assert_eq!(match_action(&actions, &d).unwrap().id, "first");
    }

    #[test]
    fn match_requires_the_trigger() {
        let actions = actions_from(json!([
            {"id": "incident_only", "kind": "script", "triggers": ["incident.created"], "script_path": "/a"}
        ]));
        let d = delivery(json!({"id": "d", "event_type": "alert.created"}));
        assert!(match_action(&actions, &d).is_none());
    }

    #[test]
    fn filter_matches_structured_slug() {
        let actions = actions_from(json!([
            {
                "id": "restart", "kind": "script", "name": "Restart",
                "triggers": ["incident.action_triggered"],
                "action_filter": "restart_pods",
                "script_path": "/a"
            }
        ]));
        let matching = delivery(json!({
            "id": "d", "event_type": "incident.action_triggered",
            "action": {"id": "u", "name": "Restart pods", "slug": "restart_pods"}
        }));
        let wrong_slug = delivery(json!({
            "id": "d", "event_type": "incident.action_triggered",
            "action": {"id": "u", "name": "Other", "slug": "other"}
        }));
        assert!(match_action(&actions, &matching).is_some());
        assert!(match_action(&actions, &wrong_slug).is_none());
    }

    #[test]
    fn filter_falls_back_to_action_name_field() {
        let actions = actions_from(json!([
            {
                "id": "reboot", "kind": "script", "name": "Reboot",
                "triggers": ["action.triggered"],
                "action_filter": "reboot",
                "script_path": "/a"
            }
        ]));
        let legacy = delivery(json!({
            "id": "d", "event_type": "action.triggered",
            "data": {"action_name": "reboot"}
        }));
        assert!(match_action(&actions, &legacy).is_some());
    }

    #[test]
    fn filter_refuses_to_guess_without_identity() {
        let actions = actions_from(json!([
            {
                "id": "reboot", "kind": "script", "name": "Reboot",
                "triggers": ["action.triggered"],
                "action_filter": "reboot",
                "script_path": "/a"
            }
        ]));
        let anonymous = delivery(json!({"id": "d", "event_type": "action.triggered"}));
        assert!(match_action(&actions, &anonymous).is_none());
    }

    #[test]
    fn empty_filter_matches_any_delivery() {
        let actions = actions_from(json!([
            {
                "id": "catchall", "kind": "script", "name": "Catch",
                "triggers": ["action.triggered"],
                "script_path": "/a"
            }
        ]));
        let anonymous = delivery(json!({"id": "d", "event_type": "action.triggered"}));
        assert!(match_action(&actions, &anonymous).is_some());
    }

    #[test]
    fn case_sensitive_filter_comparison() {
        let actions = actions_from(json!([
            {
                "id": "strict_filter", "kind": "script", "name": "A",
                "triggers": ["action.triggered"],
                "action_filter": "Restart",
                "script_path": "/a"
            }
        ]));
        let lowercase = delivery(json!({
            "id": "d", "event_type": "action.triggered",
            "data": {"action_name": "restart"}
        }));
        assert!(match_action(&actions, &lowercase).is_none());
    }

    #[test]
    fn params_render_and_user_strings_win() {
        let actions = actions_from(json!([
            {
                "id": "render_params", "kind": "script", "triggers": ["alert.created"],
                "script_path": "/a",
                "parameter_map": {
                    "msg": "{{ msg }}",
                    "severity": "{{ severity | upcase }}",
                    "count": "{{ count }}"
                }
            }
        ]));
        let d = delivery(json!({
            "id": "d", "event_type": "alert.created",
            "data": {"msg": "hi", "severity": "low", "count": 7}
        }));
        let ctx = RenderContext::for_delivery(&d);
        let params = prepare_params(&actions[0], &d, &ctx);
        // User string wins over the rendered template...
        assert_eq!(params["msg"], "hi");
        assert_eq!(params["severity"], "low");
        // ...but a non-string user value keeps the rendered one.
        assert_eq!(params["count"], "7");
    }

    #[test]
    fn declared_parameters_are_taken_from_user_input() {
        let actions = actions_from(json!([
            {
                "id": "strict_filter", "kind": "script", "name": "A",
                "triggers": ["action.triggered"],
                "script_path": "/a",
                "parameter_defs": [{"name": "namespace"}]
            }
        ]));
        let d = delivery(json!({
            "id": "d", "event_type": "action.triggered",
            "data": {"parameters": {"namespace": "prod", "unlisted": "x"}}
        }));
        let ctx = RenderContext::for_delivery(&d);
        let params = prepare_params(&actions[0], &d, &ctx);
        assert_eq!(params.get("namespace").map(String::as_str), Some("prod"));
        // Keys never declared anywhere are not injected.
        assert!(!params.contains_key("unlisted"));
    }

    #[tokio::test]
    async fn happy_script_delivery_is_executed_and_reported() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/deliveries/d1"))
            .and(body_partial_json(json!({
                "execution_status": "completed",
                "execution_exit_code": 0,
                "execution_stdout": "hi\n",
                "execution_action_name": "echo_hello"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.sh");
        fs::write(&script, "#!/bin/sh\necho \"$REC_PARAM_MSG\"\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        let actions = Arc::new(actions_from(json!([
            {
                "id": "echo_hello", "kind": "script",
                "triggers": ["alert.created"],
                "script_path": script.to_str().unwrap(),
                "parameter_map": {"msg": "{{ msg }}"}
            }
        ])));
        let git = Arc::new(GitSourceManager::new("/tmp/unused", metrics::noop()));
        let dispatcher = Dispatcher::new(
            actions,
            vec![Box::new(ScriptRunner::new(git, Default::default()))],
            reporter_for(&server),
            metrics::noop(),
        );

        let d = delivery(json!({
            "id": "d1", "event_type": "alert.created", "data": {"msg": "hi"}
        }));
        dispatcher.handle(d, &CancellationToken::new()).await;
        // wiremock asserts the report PATCH on drop.
    }

    #[tokio::test]
    async fn unmatched_delivery_is_reported_failed_with_none() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/deliveries/d9"))
            .and(body_partial_json(json!({
                "execution_status": "failed",
                "execution_exit_code": 1,
                "execution_action_name": "none"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(
            Arc::new(Vec::new()),
            vec![],
            reporter_for(&server),
            metrics::noop(),
        );
        let d = delivery(json!({"id": "d9", "event_type": "unknown.event"}));
        dispatcher.handle(d, &CancellationToken::new()).await;

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body["execution_stderr"]
            .as_str()
            .unwrap()
            .contains("No action configured"));
    }

    #[tokio::test]
    async fn unmatched_uses_observed_action_name_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/deliveries/d2"))
            .and(body_partial_json(json!({
                "execution_action_name": "restart_pods",
                "execution_action_id": "uuid-7"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(
            Arc::new(Vec::new()),
            vec![],
            reporter_for(&server),
            metrics::noop(),
        );
        let d = delivery(json!({
            "id": "d2", "event_type": "incident.action_triggered",
            "action": {"id": "uuid-7", "name": "Restart pods", "slug": "restart_pods"}
        }));
        dispatcher.handle(d, &CancellationToken::new()).await;
    }
}
