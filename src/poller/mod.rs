// Module: Poller
// Drives the pipeline: fetch a batch, claim each delivery, hand the claimed
// ones to the pool. Claims are sequential on purpose; the fetch batch is
// small and the upstream fences ownership per delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackoffKind, PollerConfig};
use crate::metrics::{names, RecorderHandle};
use crate::pool::DeliverySink;
use crate::upstream::UpstreamClient;

/// Failed polls never push the cadence past this.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct Poller {
    upstream: Arc<UpstreamClient>,
    sink: DeliverySink,
    config: PollerConfig,
    recorder: RecorderHandle,
    retry_count: u32,
}

impl Poller {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        sink: DeliverySink,
        config: PollerConfig,
        recorder: RecorderHandle,
    ) -> Self {
        Self {
            upstream,
            sink,
            config,
            recorder,
            retry_count: 0,
        }
    }

    /// Poll until cancelled. The first poll happens immediately; afterwards
    /// the cadence follows `interval_ms`, stretched by the backoff schedule
    /// while fetches fail.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval_ms,
            max_batch = self.config.max_batch,
            visibility_timeout = self.config.visibility_timeout,
            "poller started"
        );
        loop {
            self.poll_once().await;
            let delay = self.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("poller stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn poll_once(&mut self) {
        let deliveries = match self
            .upstream
            .fetch_deliveries(self.config.max_batch, self.config.visibility_timeout)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.recorder
                    .counter(names::POLLS, &[("outcome", "error")]);
                self.bump_retry();
                warn!(
                    error = %err,
                    retry_count = self.retry_count,
                    "failed to fetch deliveries"
                );
                return;
            }
        };

        self.recorder
            .counter(names::POLLS, &[("outcome", "success")]);
        self.retry_count = 0;

        if deliveries.is_empty() {
            debug!("no deliveries pending");
            return;
        }
        debug!(count = deliveries.len(), "fetched deliveries");
        for _ in &deliveries {
            self.recorder.counter(names::DELIVERIES_RECEIVED, &[]);
        }

        for delivery in deliveries {
            match self.upstream.claim_delivery(&delivery.id).await {
                Ok(()) => {
                    self.recorder
                        .counter(names::CLAIMS, &[("outcome", "success")]);
                    // Submit logs and counts its own drops.
                    self.sink.submit(delivery);
                }
                Err(err) => {
                    self.recorder
                        .counter(names::CLAIMS, &[("outcome", "error")]);
                    warn!(
                        delivery = %delivery.id,
                        error = %err,
                        "claim failed; skipping (upstream will re-offer after visibility timeout)"
                    );
                }
            }
        }
    }

    /// Time until the next poll. With retry-on-error disabled the tick is
    /// fixed; enabled, failures stretch it exponentially or linearly, capped
    /// at five minutes.
    fn next_delay(&self) -> Duration {
        let base = Duration::from_millis(self.config.interval_ms);
        if self.retry_count == 0 || !self.config.retry_on_error {
            return base;
        }
        let stretched = match self.config.backoff {
            BackoffKind::Exponential => {
                base.saturating_mul(2u32.saturating_pow(self.retry_count))
            }
            BackoffKind::Linear => base.saturating_mul(self.retry_count),
        };
        stretched.min(MAX_BACKOFF)
    }

    /// Count a failed poll; past `max_retries` the counter wraps to zero and
    /// the loop keeps going forever.
    fn bump_retry(&mut self) {
        self.retry_count += 1;
        if self.retry_count > self.config.max_retries {
            self.retry_count = 0;
        }
    }
}
