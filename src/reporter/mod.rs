// Module: Reporter
// Folds an execution result into the terminal PATCH envelope and sends it.
// A failed report is logged, never propagated: the upstream re-offers the
// delivery once its visibility window lapses.

use std::sync::Arc;

use tracing::{debug, error};

use crate::protocol::{utc_now_rfc3339, ExecutionReport, ExecutionResult, ExecutionStatus};
use crate::upstream::UpstreamClient;

/// Build the report envelope for one finished execution. `action_name` is
/// the local slug (or `"none"` for unmatched deliveries); `action_uuid` is
/// the upstream action id when the delivery carried one.
pub fn build_report(
    action_name: &str,
    action_uuid: &str,
    result: &ExecutionResult,
) -> ExecutionReport {
    let status = result.status();
    let stamp = utc_now_rfc3339();
    let (completed_at, failed_at) = match status {
        ExecutionStatus::Completed => (Some(stamp), None),
        ExecutionStatus::Failed => (None, Some(stamp)),
    };
    ExecutionReport {
        execution_status: status,
        execution_exit_code: result.exit_code,
        execution_stdout: result.stdout.clone(),
        execution_stderr: result.stderr.clone(),
        execution_duration_ms: result.duration_ms,
        execution_error: result.error.clone().unwrap_or_default(),
        execution_action_name: action_name.to_string(),
        execution_action_id: action_uuid.to_string(),
        completed_at,
        failed_at,
    }
}

pub struct Reporter {
    upstream: Arc<UpstreamClient>,
}

impl Reporter {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }

    /// Report the terminal result for a delivery. Returns whether the
    /// upstream acknowledged it.
    pub async fn report(
        &self,
        delivery_id: &str,
        action_name: &str,
        action_uuid: &str,
        result: &ExecutionResult,
    ) -> bool {
        let report = build_report(action_name, action_uuid, result);
        match self.upstream.report_execution(delivery_id, &report).await {
            Ok(()) => {
                debug!(
                    delivery = delivery_id,
                    action = action_name,
                    status = report.execution_status.as_str(),
                    exit_code = report.execution_exit_code,
                    "reported execution"
                );
                true
            }
            Err(err) => {
                error!(
                    delivery = delivery_id,
                    action = action_name,
                    error = %err,
                    "failed to report execution; delivery will be re-offered after its visibility timeout"
                );
                false
            }
        }
    }
}
