//! Batch delivery loop of one open subscription
//!
//! ### Loop
//! 1. Rewind the log to the consumed offset
//! 2. Wait for a first line, then keep reading until the batch reaches
//!    `max_batch_bytes` or `batch_timeout` has passed since the first line
//! 3. Pause the reader and hand the batch to the handler
//! 4. On success commit the batch end offset and resume the reader
//! 5. On failure sleep for the backoff delay and retry the same batch
//!
//! A failed commit is fatal: the subscription is marked broken and the loop
//! ends. Every wait is cut short by the stop signal; a running handler call
//! is not. A crash between handler success and commit redelivers the batch.

use crate::config::DeliveryConfig;
use crate::error::{EventError, Result};
use crate::log::Log;
use crate::types::{Batch, SubscriptionStatus};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Consumer of the batches of a durable subscription
///
/// Returning an error makes the deliverer retry the same batch after a
/// backoff delay.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: Batch) -> Result<()>;
}

#[async_trait]
impl<F, Fut> BatchHandler for F
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, batch: Batch) -> Result<()> {
        (self)(batch).await
    }
}

pub(crate) type SharedStatus = Arc<Mutex<SubscriptionStatus>>;

pub(crate) fn set_status(status: &SharedStatus, value: SubscriptionStatus) {
    *status.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Lines read but not yet committed
struct Pending {
    data: Bytes,
    start: u64,
    end: u64,
}

enum Wake {
    Stop,
    Data,
    Timer,
}

pub(crate) struct Deliverer<H> {
    sub_id: String,
    log: Arc<dyn Log>,
    handler: H,
    config: DeliveryConfig,
    status: SharedStatus,
    stop: watch::Receiver<bool>,
}

impl<H: BatchHandler> Deliverer<H> {
    pub(crate) fn new(
        log: Arc<dyn Log>,
        handler: H,
        config: DeliveryConfig,
        status: SharedStatus,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sub_id: log.sub_id().to_string(),
            log,
            handler,
            config,
            status,
            stop,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(err) = self.log.rewind().await {
            self.break_with(err);
            return;
        }
        tracing::debug!(sub_id = %self.sub_id, offset = self.log.read_offset(), "Deliverer started");

        while let Some(pending) = self.collect().await {
            if !self.deliver(pending).await {
                break;
            }
        }

        tracing::debug!(sub_id = %self.sub_id, "Deliverer stopped");
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Read lines until the batch is full or quiet; `None` when stopping
    async fn collect(&mut self) -> Option<Pending> {
        let mut data = BytesMut::new();
        let mut start = self.log.read_offset();
        let mut deadline: Option<Instant> = None;
        let mut failures = 0u32;

        loop {
            if self.stopped() {
                return None;
            }

            match self.log.read_next().await {
                Ok(Some(line)) => {
                    failures = 0;
                    data.extend_from_slice(&line);
                    let at = *deadline.get_or_insert_with(|| Instant::now() + self.config.batch_timeout);
                    if data.len() >= self.config.max_batch_bytes || Instant::now() >= at {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    let delay = self.config.backoff.next(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        sub_id = %self.sub_id,
                        error = %err,
                        backoff_ms = delay.as_millis() as u64,
                        "Log read failed, rewinding"
                    );
                    if !self.sleep(delay).await {
                        return None;
                    }
                    if let Err(err) = self.log.rewind().await {
                        self.break_with(err);
                        return None;
                    }
                    data.clear();
                    deadline = None;
                    start = self.log.read_offset();
                    continue;
                }
            }

            match self.wait(deadline).await {
                Wake::Stop => return None,
                Wake::Data => {}
                Wake::Timer => break,
            }
        }

        Some(Pending {
            data: data.freeze(),
            start,
            end: self.log.read_offset(),
        })
    }

    async fn wait(&mut self, deadline: Option<Instant>) -> Wake {
        let timer = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.stop.changed() => Wake::Stop,
            _ = self.log.readable() => Wake::Data,
            _ = timer => Wake::Timer,
        }
    }

    /// Cancelable sleep; `false` when stopped
    async fn sleep(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => !self.stopped(),
            _ = self.stop.changed() => false,
        }
    }

    /// Deliver one batch until it succeeds; `false` when the loop must end
    async fn deliver(&mut self, pending: Pending) -> bool {
        let mut failures = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.log.pause();

            let batch = Batch {
                sub_id: self.sub_id.clone(),
                data: pending.data.clone(),
                start_offset: pending.start,
                end_offset: pending.end,
                attempt,
            };
            tracing::debug!(
                sub_id = %self.sub_id,
                bytes = batch.len(),
                start = pending.start,
                end = pending.end,
                attempt,
                "Delivering batch"
            );

            match self.handler.handle(batch).await {
                Ok(()) => {
                    if let Err(err) = self.log.commit(pending.end).await {
                        self.break_with(err);
                        return false;
                    }
                    if self.stopped() {
                        return false;
                    }
                    self.log.resume();
                    return true;
                }
                Err(err) => {
                    let delay = self.config.backoff.next(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        sub_id = %self.sub_id,
                        error = %err,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Batch handler failed, retrying"
                    );
                    if !self.sleep(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    fn break_with(&self, err: EventError) {
        self.log.pause();
        tracing::error!(sub_id = %self.sub_id, error = %err, "Subscription broken");
        set_status(
            &self.status,
            SubscriptionStatus::Broken {
                reason: err.to_string(),
            },
        );
    }
}
