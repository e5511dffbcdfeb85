// HTTP action executor: renders the request spec against the delivery,
// dispatches, and folds the response into the execution result. The status
// code doubles as the exit code so the standard classification applies.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Url};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{ActionConfig, ActionKind, HttpSpec};
use crate::executors::ActionExecutor;
use crate::metrics::{names, RecorderHandle};
use crate::protocol::{Delivery, ExecutionResult, RenderedParams};
use crate::template::{render, RenderContext};

pub struct HttpActionExecutor {
    client: reqwest::Client,
    recorder: RecorderHandle,
}

impl HttpActionExecutor {
    pub fn new(recorder: RecorderHandle) -> Self {
        Self {
            client: reqwest::Client::new(),
            recorder,
        }
    }

    /// Build the full request or explain why it cannot be built. Everything
    /// in the spec is a template; a render failure here is a dispatch-level
    /// failure, not an empty string.
    fn build_request(
        &self,
        action: &ActionConfig,
        spec: &HttpSpec,
        ctx: &RenderContext,
        params: &RenderedParams,
    ) -> Result<(Method, reqwest::RequestBuilder), String> {
        let raw_url =
            render(&spec.url, ctx).map_err(|e| format!("failed to render url template: {e}"))?;
        let mut url =
            Url::parse(&raw_url).map_err(|e| format!("invalid url '{raw_url}': {e}"))?;

        for (key, template) in &spec.params {
            let value = render(template, ctx)
                .map_err(|e| format!("failed to render query parameter '{key}': {e}"))?;
            url.query_pairs_mut().append_pair(key, &value);
        }

        let method_raw = spec.method.as_deref().unwrap_or("POST");
        if method_raw.chars().any(char::is_whitespace) || method_raw.is_empty() {
            return Err(format!("invalid http method '{method_raw}'"));
        }
        let method = Method::from_bytes(method_raw.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid http method '{method_raw}'"))?;

        let mut headers = HeaderMap::new();
        for (key, template) in &spec.headers {
            let value = render(template, ctx)
                .map_err(|e| format!("failed to render header '{key}': {e}"))?;
            let name: HeaderName = key
                .parse()
                .map_err(|_| format!("invalid header name '{key}'"))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| format!("invalid value for header '{key}'"))?;
            headers.insert(name, value);
        }
        // Header names are loggable; Authorization values never are.
        let header_names: Vec<&str> = headers
            .keys()
            .filter(|name| **name != AUTHORIZATION)
            .map(HeaderName::as_str)
            .collect();
        trace!(action = %action.id, headers = ?header_names, "request headers set");

        let timeout = Duration::from_secs(match action.timeout_sec {
            Some(t) if t > 0 => t,
            _ => crate::config::default_http_timeout(),
        });

        let mut request = self
            .client
            .request(method.clone(), url)
            .headers(headers)
            .timeout(timeout);

        if !spec.body.is_empty() {
            let body = render(&spec.body, ctx)
                .map_err(|e| format!("failed to render body template: {e}"))?;
            request = request.body(body);
        } else if !params.is_empty() {
            request = request.json(&params);
        }

        Ok((method, request))
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    fn can_handle(&self, kind: ActionKind) -> bool {
        kind == ActionKind::Http
    }

    async fn execute(
        &self,
        action: &ActionConfig,
        delivery: &Delivery,
        params: &RenderedParams,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let Some(spec) = &action.http_spec else {
            return ExecutionResult::failure(1, format!("action '{}' has no http_spec", action.id));
        };

        let ctx = RenderContext::for_delivery(delivery);
        let (method, request) = match self.build_request(action, spec, &ctx, params) {
            Ok(built) => built,
            Err(message) => return ExecutionResult::failure(1, message),
        };

        debug!(action = %action.id, method = %method, "dispatching http action");
        let started = Instant::now();
        let response = tokio::select! {
            response = request.send() => response,
            _ = cancel.cancelled() => {
                return ExecutionResult::failure(1, "http request cancelled during shutdown");
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.recorder.histogram(
                    names::HTTP_REQUEST_DURATION,
                    &[("method", method.as_str()), ("status", "error")],
                    started.elapsed(),
                );
                return ExecutionResult {
                    exit_code: 1,
                    stderr: err.to_string(),
                    error: Some(err.to_string()),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                };
            }
        };

        let status = response.status().as_u16();
        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    json!(String::from_utf8_lossy(value.as_bytes())),
                )
            })
            .collect();
        let body = response.text().await.unwrap_or_default();
        let duration = started.elapsed();

        self.recorder.histogram(
            names::HTTP_REQUEST_DURATION,
            &[("method", method.as_str()), ("status", &status.to_string())],
            duration,
        );

        let envelope = json!({
            "status_code": status,
            "headers": headers,
            "body": body,
            "duration_ms": duration.as_millis() as u64,
        });

        let error = if (200..300).contains(&status) {
            None
        } else {
            Some(format!("http request returned status {status}"))
        };

        ExecutionResult {
            exit_code: i32::from(status),
            stdout: envelope.to_string(),
            stderr: String::new(),
            duration_ms: duration.as_millis() as u64,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::protocol::ExecutionStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method as wm_method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn delivery(data: serde_json::Value) -> Delivery {
        serde_json::from_value(json!({
            "id": "d1",
            "event_type": "action.triggered",
            "data": data
        }))
        .unwrap()
    }

    fn http_action(spec: serde_json::Value) -> ActionConfig {
        serde_json::from_value(json!({
            "id": "ping",
            "kind": "http",
            "name": "Ping",
            "triggers": ["action.triggered"],
            "http_spec": spec
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn server_error_maps_to_failed_with_envelope() {
        let server = MockServer::start().await;
        Mock::given(wm_method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpActionExecutor::new(metrics::noop());
        let action = http_action(json!({"url": format!("{}/hook", server.uri())}));
        let result = executor
            .execute(
                &action,
                &delivery(json!({})),
                &RenderedParams::new(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.exit_code, 500);
        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("500"));
        let envelope: serde_json::Value = serde_json::from_str(&result.stdout).unwrap();
        assert_eq!(envelope["status_code"], 500);
        assert_eq!(envelope["body"], "boom");
        assert!(envelope["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn params_become_the_json_body_when_no_body_template() {
        let server = MockServer::start().await;
        Mock::given(wm_method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({"namespace": "prod"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpActionExecutor::new(metrics::noop());
        let action = http_action(json!({"url": format!("{}/hook", server.uri())}));
        let mut params = RenderedParams::new();
        params.insert("namespace".to_string(), "prod".to_string());
        let result = executor
            .execute(
                &action,
                &delivery(json!({})),
                &params,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 204);
        assert_eq!(result.status(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn url_query_and_headers_are_templated() {
        let server = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(path("/alerts/a-77"))
            .and(query_param("severity", "critical"))
            .and(header("X-Alert-Source", "pager"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpActionExecutor::new(metrics::noop());
        let action = http_action(json!({
            "url": format!("{}/alerts/{{{{ alert_id }}}}", server.uri()),
            "method": "GET",
            "params": {"severity": "{{ severity }}"},
            "headers": {"X-Alert-Source": "{{ source }}"}
        }));
        let result = executor
            .execute(
                &action,
                &delivery(json!({
                    "alert_id": "a-77",
                    "severity": "critical",
                    "source": "pager"
                })),
                &RenderedParams::new(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 200);
    }

    #[tokio::test]
    async fn body_template_wins_over_params() {
        let server = MockServer::start().await;
        Mock::given(wm_method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({"text": "disk full"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpActionExecutor::new(metrics::noop());
        let action = http_action(json!({
            "url": format!("{}/hook", server.uri()),
            "body": "{\"text\": \"{{ summary }}\"}"
        }));
        let mut params = RenderedParams::new();
        params.insert("ignored".to_string(), "x".to_string());
        let result = executor
            .execute(
                &action,
                &delivery(json!({"summary": "disk full"})),
                &params,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 200);
    }

    #[tokio::test]
    async fn whitespace_method_is_rejected_before_dispatch() {
        let executor = HttpActionExecutor::new(metrics::noop());
        let action = http_action(json!({
            "url": "http://127.0.0.1:1/never",
            "method": "PO ST"
        }));
        let result = executor
            .execute(
                &action,
                &delivery(json!({})),
                &RenderedParams::new(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.error.as_deref().unwrap().contains("invalid http method"));
    }

    #[tokio::test]
    async fn bad_template_in_url_is_a_dispatch_failure() {
        let executor = HttpActionExecutor::new(metrics::noop());
        let action = http_action(json!({"url": "http://example.com/{{ x | sparkle }}"}));
        let result = executor
            .execute(
                &action,
                &delivery(json!({})),
                &RenderedParams::new(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("failed to render url template"));
    }

    #[tokio::test]
    async fn transport_failure_is_exit_one() {
        let executor = HttpActionExecutor::new(metrics::noop());
        // Nothing listens on this port.
        let action = http_action(json!({"url": "http://127.0.0.1:9/unreachable", "method": "GET"}));
        let result = executor
            .execute(
                &action,
                &delivery(json!({})),
                &RenderedParams::new(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(!result.stderr.is_empty());
        assert_eq!(result.status(), ExecutionStatus::Failed);
    }
}
