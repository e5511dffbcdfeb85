// Module: Pool
// Bounded worker pool between the poller and the dispatcher. Submission is
// non-blocking: a full queue drops the delivery, which is safe because the
// upstream re-offers it after the visibility timeout.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::dispatch::DeliveryHandler;
use crate::metrics::{names, RecorderHandle};
use crate::protocol::Delivery;

/// Producer half handed to the poller.
#[derive(Clone)]
pub struct DeliverySink {
    tx: mpsc::Sender<Delivery>,
    recorder: RecorderHandle,
}

impl DeliverySink {
    /// Non-blocking submit. Returns false when the delivery was dropped
    /// (queue full or pool shut down); the drop is logged and counted here.
    pub fn submit(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                warn!(
                    delivery = %delivery.id,
                    event_type = %delivery.event_type,
                    "queue_full: dropping delivery; upstream will re-offer it"
                );
                self.recorder.counter(
                    names::DELIVERIES_DROPPED,
                    &[("reason", "queue_full")],
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(delivery)) => {
                warn!(delivery = %delivery.id, "pool closed: dropping delivery");
                self.recorder
                    .counter(names::DELIVERIES_DROPPED, &[("reason", "pool_closed")]);
                false
            }
        }
    }
}

/// Fixed set of workers draining a bounded queue. `min_workers` are started;
/// `max_workers` is the configured ceiling for future scaling.
pub struct WorkerPool {
    tx: mpsc::Sender<Delivery>,
    recorder: RecorderHandle,
    handles: Vec<JoinHandle<()>>,
    /// Internal close signal; lets workers close the queue and drain even
    /// while sink clones are still held elsewhere.
    closing: CancellationToken,
}

impl WorkerPool {
    pub fn start(
        config: &PoolConfig,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
        recorder: RecorderHandle,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>(config.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let closing = CancellationToken::new();

        let worker_count = config.min_workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let rx = rx.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            let closing = closing.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // Take the next delivery; the receiver lock is held only
                    // while waiting, so one worker waiting keeps the others
                    // runnable. Once the pool is closing, the queue stops
                    // accepting and the workers drain what is buffered.
                    let delivery = {
                        let mut rx = rx.lock().await;
                        if closing.is_cancelled() {
                            rx.close();
                            rx.try_recv().ok()
                        } else {
                            tokio::select! {
                                delivery = rx.recv() => delivery,
                                _ = closing.cancelled() => {
                                    rx.close();
                                    rx.try_recv().ok()
                                }
                            }
                        }
                    };
                    match delivery {
                        Some(delivery) => handler.handle(delivery, &cancel).await,
                        None => break,
                    }
                }
                debug!(worker, "worker drained and exited");
            }));
        }

        Self {
            tx,
            recorder,
            handles,
            closing,
        }
    }

    pub fn sink(&self) -> DeliverySink {
        DeliverySink {
            tx: self.tx.clone(),
            recorder: self.recorder.clone(),
        }
    }

    /// Close the queue, let the workers drain every pending delivery and
    /// finish their current execution, then return.
    pub async fn shutdown(self) {
        self.closing.cancel();
        drop(self.tx);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker terminated abnormally");
            }
        }
        debug!("worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct CountingHandler {
        handled: AtomicUsize,
        gate: Semaphore,
    }

    impl CountingHandler {
        fn new(permits: usize) -> Self {
            Self {
                handled: AtomicUsize::new(0),
                gate: Semaphore::new(permits),
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for CountingHandler {
        async fn handle(&self, _delivery: Delivery, _cancel: &CancellationToken) {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn delivery(id: &str) -> Delivery {
        serde_json::from_value(json!({"id": id, "event_type": "alert.created"})).unwrap()
    }

    fn pool_config(queue: usize, workers: usize) -> PoolConfig {
        serde_json::from_value(json!({
            "queue_size": queue,
            "min_workers": workers,
            "max_workers": workers
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn queue_overflow_drops_beyond_capacity() {
        // One worker blocked on the gate, queue of 2: out of 6 submissions
        // the worker holds one, two sit in the queue, the rest are dropped.
        let handler = Arc::new(CountingHandler::new(0));
        let pool = WorkerPool::start(
            &pool_config(2, 1),
            handler.clone(),
            CancellationToken::new(),
            metrics::noop(),
        );
        let sink = pool.sink();

        // Let the worker pick up the first delivery and block inside handle.
        assert!(sink.submit(delivery("d0")));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut accepted = 0;
        let mut dropped = 0;
        for i in 1..6 {
            if sink.submit(delivery(&format!("d{i}"))) {
                accepted += 1;
            } else {
                dropped += 1;
            }
        }
        assert_eq!(accepted, 2, "queue capacity bounds acceptance");
        assert_eq!(dropped, 3);

        // Release the gate; everything accepted gets handled, nothing more.
        handler.gate.add_permits(100);
        pool.shutdown().await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_deliveries() {
        let handler = Arc::new(CountingHandler::new(1000));
        let pool = WorkerPool::start(
            &pool_config(100, 2),
            handler.clone(),
            CancellationToken::new(),
            metrics::noop(),
        );
        let sink = pool.sink();
        for i in 0..20 {
            assert!(sink.submit(delivery(&format!("d{i}"))));
        }
        pool.shutdown().await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn submit_after_shutdown_reports_closed() {
        let handler = Arc::new(CountingHandler::new(1000));
        let pool = WorkerPool::start(
            &pool_config(10, 1),
            handler,
            CancellationToken::new(),
            metrics::noop(),
        );
        let sink = pool.sink();
        pool.shutdown().await;
        assert!(!sink.submit(delivery("late")));
    }

    #[tokio::test]
    async fn single_worker_preserves_fifo_order() {
        struct OrderHandler {
            seen: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl DeliveryHandler for OrderHandler {
            async fn handle(&self, delivery: Delivery, _cancel: &CancellationToken) {
                self.seen.lock().await.push(delivery.id);
            }
        }

        let handler = Arc::new(OrderHandler {
            seen: Mutex::new(Vec::new()),
        });
        let pool = WorkerPool::start(
            &pool_config(100, 1),
            handler.clone(),
            CancellationToken::new(),
            metrics::noop(),
        );
        let sink = pool.sink();
        for i in 0..10 {
            sink.submit(delivery(&format!("d{i}")));
        }
        pool.shutdown().await;
        let seen = handler.seen.lock().await;
        let expected: Vec<String> = (0..10).map(|i| format!("d{i}")).collect();
        assert_eq!(*seen, expected);
    }
}
