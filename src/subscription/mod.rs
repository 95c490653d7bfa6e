//! Durable subscriptions on top of the router
//!
//! A durable subscription is a `(topic, subId)` pair backed by a log. An
//! appender listener registered on the router writes every matching message
//! to the log; `open_subscription` attaches a batch handler that consumes
//! the log with at-least-once delivery.
//!
//! The set of subscriptions is checkpointed to an [`IndexStore`] on every
//! create and delete, and re-created by `load_subscriptions` after a restart.

pub(crate) mod appender;
pub mod deliverer;

use crate::config::{DeliveryConfig, PubSubConfig};
use crate::error::{EventError, Result};
use crate::log::{FileLogStore, Log, LogStore};
use crate::router::listener::ListenerId;
use crate::router::{self, Router};
use crate::state::{FileIndexStore, IndexStore};
use crate::types::{CloseOptions, Encode, Message, OpenOptions, SubscriptionInfo, SubscriptionStatus};
use appender::Appender;
use deliverer::{set_status, Deliverer, SharedStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub use deliverer::BatchHandler;

struct Delivery {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Delivery {
    async fn stop(self, sub_id: &str) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(sub_id, error = %e, "Deliverer task failed");
        }
    }
}

struct Entry {
    topic: String,
    log: Arc<dyn Log>,
    appender: ListenerId,
    status: SharedStatus,
    delivery: Option<Delivery>,
}

impl Entry {
    fn status(&self) -> SubscriptionStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn info(&self, sub_id: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            sub_id: sub_id.to_string(),
            topic: self.topic.clone(),
            status: self.status(),
            consumed_offset: self.log.consumed_offset(),
        }
    }
}

struct Inner<M> {
    router: Arc<Router<M>>,
    logs: Arc<dyn LogStore>,
    index: Arc<dyn IndexStore>,
    delivery: DeliveryConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

/// Manages the durable subscriptions of one router
///
/// Cheap to clone; clones share the same subscriptions.
pub struct SubscriptionManager<M: Encode = Message> {
    inner: Arc<Inner<M>>,
}

impl<M: Encode> Clone for SubscriptionManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Encode> SubscriptionManager<M> {
    /// Create a manager over explicit log and index stores
    pub fn new(
        router: Arc<Router<M>>,
        logs: Arc<dyn LogStore>,
        index: Arc<dyn IndexStore>,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                router,
                logs,
                index,
                delivery,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a manager storing logs and `index.json` in `config.subscription_dir`
    pub fn from_config(router: Arc<Router<M>>, config: &PubSubConfig) -> Result<Self> {
        config.validate()?;
        let dir = &config.subscription_dir;
        Ok(Self::new(
            router,
            Arc::new(FileLogStore::new(dir)),
            Arc::new(FileIndexStore::in_dir(dir)),
            config.delivery(),
        ))
    }

    /// The router the appenders are registered on
    pub fn router(&self) -> &Arc<Router<M>> {
        &self.inner.router
    }

    /// Create a durable subscription, or return the log of an existing one
    pub async fn create_subscription(&self, topic: &str, sub_id: &str) -> Result<Arc<dyn Log>> {
        validate_sub_id(sub_id)?;
        router::check_topic(topic)?;
        let mut entries = self.inner.entries.lock().await;
        self.create_locked(&mut entries, topic, sub_id, true).await
    }

    async fn create_locked(
        &self,
        entries: &mut HashMap<String, Entry>,
        topic: &str,
        sub_id: &str,
        checkpoint: bool,
    ) -> Result<Arc<dyn Log>> {
        if let Some(entry) = entries.get(sub_id) {
            if entry.topic != topic {
                tracing::warn!(
                    sub_id,
                    topic,
                    existing = %entry.topic,
                    "Subscription exists with a different topic"
                );
            }
            return Ok(entry.log.clone());
        }

        let log = self.inner.logs.open(sub_id).await?;
        let appender = match self.inner.router.listen(topic, Appender::new(log.clone())) {
            Ok(id) => id,
            Err(e) => {
                let _ = log.close().await;
                return Err(e);
            }
        };

        entries.insert(
            sub_id.to_string(),
            Entry {
                topic: topic.to_string(),
                log: log.clone(),
                appender,
                status: Arc::new(std::sync::Mutex::new(SubscriptionStatus::Idle)),
                delivery: None,
            },
        );
        if checkpoint {
            if let Err(e) = self.checkpoint(entries) {
                // not recorded, so not live either
                if let Some(entry) = entries.remove(sub_id) {
                    self.inner.router.ignore(&entry.topic, entry.appender);
                }
                if let Err(close_err) = log.close().await {
                    tracing::warn!(sub_id, error = %close_err, "Failed to close log after aborted create");
                }
                return Err(e);
            }
        }

        tracing::info!(
            sub_id,
            topic,
            store = self.inner.logs.name(),
            "Subscription created"
        );
        Ok(log)
    }

    /// Delete a subscription and its log; `false` if it does not exist
    pub async fn delete_subscription(&self, topic: &str, sub_id: &str) -> Result<bool> {
        let (entry, saved) = {
            let mut entries = self.inner.entries.lock().await;
            let Some(entry) = entries.remove(sub_id) else {
                return Ok(false);
            };
            if entry.topic != topic {
                tracing::warn!(
                    sub_id,
                    topic,
                    recorded = %entry.topic,
                    "Deleting subscription registered under a different topic"
                );
            }
            self.inner.router.ignore(&entry.topic, entry.appender);
            (entry, self.checkpoint(&entries))
        };

        // Tear down completely even when the index could not be saved.
        entry.log.pause();
        if let Some(delivery) = entry.delivery {
            delivery.stop(sub_id).await;
        }
        let closed = entry.log.close().await;
        let removed = self.inner.logs.remove(sub_id).await;

        if let Err(e) = saved {
            tracing::warn!(sub_id, error = %e, "Subscription deleted but index not saved");
            return Err(e);
        }
        closed?;
        removed?;

        tracing::info!(sub_id, topic = %entry.topic, "Subscription deleted");
        Ok(true)
    }

    /// Attach a batch handler to a subscription and start delivering
    ///
    /// The subscription is created first unless `options.create` is false.
    /// Only one handler can be attached at a time.
    pub async fn open_subscription<H>(
        &self,
        topic: &str,
        sub_id: &str,
        options: OpenOptions,
        handler: H,
    ) -> Result<()>
    where
        H: BatchHandler + 'static,
    {
        validate_sub_id(sub_id)?;
        router::check_topic(topic)?;
        let mut entries = self.inner.entries.lock().await;

        if entries.contains_key(sub_id) {
            if !options.reuse {
                return Err(EventError::AlreadyExists(sub_id.to_string()));
            }
        } else if options.create {
            self.create_locked(&mut entries, topic, sub_id, true).await?;
        } else {
            return Err(EventError::NotFound(sub_id.to_string()));
        }

        let Some(entry) = entries.get_mut(sub_id) else {
            return Err(EventError::NotFound(sub_id.to_string()));
        };
        if let Some(delivery) = &entry.delivery {
            if !delivery.task.is_finished() {
                return Err(EventError::AlreadyDelivering(sub_id.to_string()));
            }
        }

        let config = self.inner.delivery.with_overrides(&options);
        let (stop, stop_rx) = watch::channel(false);
        set_status(&entry.status, SubscriptionStatus::Delivering);
        entry.log.resume();

        let deliverer = Deliverer::new(
            entry.log.clone(),
            handler,
            config,
            entry.status.clone(),
            stop_rx,
        );
        let task = tokio::spawn(deliverer.run());
        entry.delivery = Some(Delivery { stop, task });

        tracing::info!(
            sub_id,
            topic = %entry.topic,
            max_batch_bytes = config.max_batch_bytes,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            "Subscription opened"
        );
        Ok(())
    }

    /// Stop delivering to a subscription; its appender keeps appending
    ///
    /// Waits for an in-flight batch to finish. With `options.delete` the
    /// subscription is deleted instead. `false` if it does not exist.
    pub async fn close_subscription(
        &self,
        topic: &str,
        sub_id: &str,
        options: CloseOptions,
    ) -> Result<bool> {
        if options.delete {
            return self.delete_subscription(topic, sub_id).await;
        }

        let (log, delivery) = {
            let mut entries = self.inner.entries.lock().await;
            let Some(entry) = entries.get_mut(sub_id) else {
                return Ok(false);
            };
            entry.log.pause();
            set_status(&entry.status, SubscriptionStatus::Closed);
            (entry.log.clone(), entry.delivery.take())
        };

        if let Some(delivery) = delivery {
            delivery.stop(sub_id).await;
        }
        // The deliverer may have resumed the reader before it saw the stop.
        log.pause();

        tracing::info!(sub_id, topic, "Subscription closed");
        Ok(true)
    }

    /// Re-create every subscription recorded in the index
    ///
    /// Every entry is attempted; the first failure is returned after all
    /// others were loaded.
    pub async fn load_subscriptions(&self) -> Result<usize> {
        let saved = self.inner.index.load()?;
        let mut entries = self.inner.entries.lock().await;
        let mut loaded = 0;
        let mut first_error = None;

        for (sub_id, topic) in &saved {
            let created = match validate_sub_id(sub_id).and_then(|_| router::check_topic(topic)) {
                Ok(()) => self.create_locked(&mut entries, topic, sub_id, false).await,
                Err(e) => Err(e),
            };
            match created {
                Ok(_) => loaded += 1,
                Err(e) => {
                    tracing::warn!(sub_id = %sub_id, topic = %topic, error = %e, "Failed to load subscription");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(loaded, total = saved.len(), "Subscriptions loaded");
        match first_error {
            Some(e) => Err(e),
            None => Ok(loaded),
        }
    }

    /// Snapshot of every subscription, ordered by id
    pub async fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let entries = self.inner.entries.lock().await;
        let mut infos: Vec<_> = entries
            .iter()
            .map(|(sub_id, entry)| entry.info(sub_id))
            .collect();
        infos.sort_by(|a, b| a.sub_id.cmp(&b.sub_id));
        infos
    }

    /// Snapshot of one subscription
    pub async fn get_subscription(&self, sub_id: &str) -> Option<SubscriptionInfo> {
        let entries = self.inner.entries.lock().await;
        entries.get(sub_id).map(|entry| entry.info(sub_id))
    }

    /// Stop every deliverer, unregister every appender and close every log
    ///
    /// The persisted index is left untouched, so a new manager can
    /// `load_subscriptions` again.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(String, Entry)> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().collect()
        };

        let mut first_error = None;
        for (sub_id, entry) in drained {
            self.inner.router.ignore(&entry.topic, entry.appender);
            entry.log.pause();
            if let Some(delivery) = entry.delivery {
                delivery.stop(&sub_id).await;
            }
            if let Err(e) = entry.log.close().await {
                tracing::warn!(sub_id = %sub_id, error = %e, "Failed to close log");
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Subscription manager shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn checkpoint(&self, entries: &HashMap<String, Entry>) -> Result<()> {
        let snapshot: BTreeMap<String, String> = entries
            .iter()
            .map(|(sub_id, entry)| (sub_id.clone(), entry.topic.clone()))
            .collect();
        self.inner.index.save(&snapshot)
    }
}

/// Subscription ids name files, so they must be non-empty path components
fn validate_sub_id(sub_id: &str) -> Result<()> {
    let unsafe_id = sub_id.is_empty()
        || sub_id == "."
        || sub_id == ".."
        || sub_id.contains(['/', '\\', '\0']);
    if unsafe_id {
        return Err(EventError::InvalidSubscription(sub_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sub_id() {
        for ok in ["analyst", "a.b", "sub-1", "..x"] {
            assert!(validate_sub_id(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", ".", "..", "a/b", "a\\b", "a\0b"] {
            assert!(
                matches!(validate_sub_id(bad), Err(EventError::InvalidSubscription(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
