// Module: Registry
// One-shot declarative push of the action catalog, run before the poller is
// armed so the upstream can offer every button the agent actually serves.
// The sync is idempotent: the upstream reconciles, the agent keeps no state.

use tracing::{error, info};

use crate::config::{ActionConfig, SecurityConfig};
use crate::errors::UpstreamError;
use crate::protocol::RegistrationEntry;
use crate::upstream::UpstreamClient;

/// Convert the loaded actions into catalog entries.
pub fn catalog_entries(
    actions: &[ActionConfig],
    security: &SecurityConfig,
) -> Vec<RegistrationEntry> {
    actions
        .iter()
        .map(|action| RegistrationEntry {
            slug: action.id.clone(),
            name: action.name.clone(),
            description: action.description.clone(),
            action_type: action.action_type().to_string(),
            trigger: action.triggers.first().cloned().unwrap_or_default(),
            timeout: action.effective_timeout(security),
            parameters: action.parameter_defs.clone(),
        })
        .collect()
}

/// Push the catalog. 201 and 207 both let startup continue; per-slug
/// failures inside a 207 are logged for the operator.
pub async fn sync_catalog(
    upstream: &UpstreamClient,
    actions: &[ActionConfig],
    security: &SecurityConfig,
) -> Result<(), UpstreamError> {
    if actions.is_empty() {
        info!("no actions configured; skipping catalog sync");
        return Ok(());
    }

    let entries = catalog_entries(actions, security);
    let total = entries.len();
    let response = upstream.sync_actions(entries).await?;

    let mut failures = 0;
    for outcome in response.results.iter().filter(|r| r.failed()) {
        failures += 1;
        error!(
            slug = %outcome.slug,
            status = %outcome.status,
            error = outcome.error.as_deref().unwrap_or("unspecified"),
            "action registration rejected"
        );
    }
    info!(
        total,
        registered = total - failures,
        failures,
        "action catalog synced"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metrics;
    use crate::upstream::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with_actions(actions: serde_json::Value, base_url: &str) -> AgentConfig {
        serde_json::from_value(json!({
            "upstream": {"base_url": base_url, "token": "sk-test-0123456789abcdef"},
            "actions": actions
        }))
        .unwrap()
    }

    #[test]
    fn entries_carry_slug_type_and_first_trigger() {
        let config = config_with_actions(
            json!([
                {
                    "id": "restart_pods",
                    "kind": "script",
                    "name": "Restart pods",
                    "description": "Bounce the deployment",
                    "triggers": ["incident.action_triggered"],
                    "script_path": "/opt/scripts/restart.sh",
                    "timeout_sec": 120,
                    "parameter_defs": [{"name": "namespace", "required": true}]
                },
                {
                    "id": "on_alert",
                    "kind": "http",
                    "triggers": ["alert.created", "alert.updated"],
                    "http_spec": {"url": "https://hook.example.com"}
                }
            ]),
            "https://control.example.com",
        );
        let entries = catalog_entries(&config.actions, &config.security);
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].slug, "restart_pods");
        assert_eq!(entries[0].action_type, "callable");
        assert_eq!(entries[0].trigger, "incident.action_triggered");
        assert_eq!(entries[0].timeout, 120);
        assert_eq!(entries[0].parameters.len(), 1);

        assert_eq!(entries[1].action_type, "automatic");
        // Only the first declared trigger is advertised.
        assert_eq!(entries[1].trigger, "alert.created");
        assert_eq!(entries[1].timeout, 30);
    }

    #[tokio::test]
    async fn full_success_posts_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/actions"))
            .and(body_partial_json(json!({
                "actions": [{"slug": "on_alert", "action_type": "automatic"}]
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_with_actions(
            json!([
                {
                    "id": "on_alert",
                    "kind": "http",
                    "triggers": ["alert.created"],
                    "http_spec": {"url": "https://hook.example.com"}
                }
            ]),
            &server.uri(),
        );
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
        sync_catalog(&client, &config.actions, &config.security)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn partial_success_continues_startup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/actions"))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({
                "results": [
                    {"slug": "ok_action", "status": "created"},
                    {"slug": "bad_action", "status": "error", "error": "slug taken"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_with_actions(
            json!([
                {
                    "id": "ok_action",
                    "kind": "http",
                    "triggers": ["alert.created"],
                    "http_spec": {"url": "https://hook.example.com"}
                },
                {
                    "id": "bad_action",
                    "kind": "http",
                    "triggers": ["alert.created"],
                    "http_spec": {"url": "https://hook.example.com"}
                }
            ]),
            &server.uri(),
        );
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
        // 207 is success-continuing.
        sync_catalog(&client, &config.actions, &config.security)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_catalog_skips_the_post() {
        let server = MockServer::start().await;
        // No mock mounted: any request would 404 and fail the call.
        let config = config_with_actions(json!([]), &server.uri());
        let client = UpstreamClient::new(&config.upstream, metrics::noop()).unwrap();
        sync_catalog(&client, &config.actions, &config.security)
            .await
            .unwrap();
    }
}
