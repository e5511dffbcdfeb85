// Module: Executors
// One implementation per action kind. The dispatcher picks the executor
// through `can_handle`, so adding a kind (e.g. grpc) is a new file here.

pub mod http;
pub mod script;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ActionConfig, ActionKind};
use crate::protocol::{Delivery, ExecutionResult, RenderedParams};

/// Contract every action executor fulfills. Executors never fail out of
/// band: anything that goes wrong becomes a failed `ExecutionResult` so the
/// delivery is always closed upstream.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Whether this executor runs actions of the given kind.
    fn can_handle(&self, kind: ActionKind) -> bool;

    /// Run the action for one delivery with the rendered parameters.
    async fn execute(
        &self,
        action: &ActionConfig,
        delivery: &Delivery,
        params: &RenderedParams,
        cancel: &CancellationToken,
    ) -> ExecutionResult;
}
