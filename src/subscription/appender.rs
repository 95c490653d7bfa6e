//! Router listener that appends every message to a subscription log

use crate::delivery::Ack;
use crate::error::EventError;
use crate::log::Log;
use crate::router::listener::Listener;
use crate::types::Encode;
use std::sync::Arc;

/// Encodes each delivered message and appends it to the log
///
/// The append is synchronous so records keep publish order. The ack is
/// answered once the flush is durable.
pub(crate) struct Appender {
    log: Arc<dyn Log>,
}

impl Appender {
    pub(crate) fn new(log: Arc<dyn Log>) -> Self {
        Self { log }
    }
}

impl<M: Encode> Listener<M> for Appender {
    fn deliver(&self, message: &Arc<M>, ack: Ack) {
        let line = match message.encode() {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(sub_id = self.log.sub_id(), error = %err, "Message rejected by durable appender");
                ack.fail(err);
                return;
            }
        };

        if let Err(err) = self.log.append(&line) {
            ack.fail(err);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let log = self.log.clone();
                handle.spawn(async move {
                    ack.done(log.flush().await);
                });
            }
            Err(_) => ack.fail(EventError::Config(
                "durable subscriptions need a tokio runtime to flush".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogStore, MemoryLogStore};
    use crate::router::Router;
    use crate::types::{Json, Message};
    use bytes::Bytes;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_emit_completion_implies_flushed() {
        let store = MemoryLogStore::new();
        let log = store.open("s").await.unwrap();
        let router: Router<Message> = Router::new();
        router.listen("a.*", Appender::new(log)).unwrap();

        let first = router.emit("a.b", Message::from("hello"));
        let second = router.emit("a.c", Message::from(serde_json::json!({"n": 1})));
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());

        assert_eq!(
            store.get("s").unwrap().contents(),
            Bytes::from("hello\n{\"n\":1}\n")
        );
    }

    #[tokio::test]
    async fn test_encode_failure_writes_nothing() {
        let store = MemoryLogStore::new();
        let log = store.open("s").await.unwrap();
        let router: Router<Json<BTreeMap<(u8, u8), u8>>> = Router::new();
        router.listen("t", Appender::new(log)).unwrap();

        let mut bad = BTreeMap::new();
        bad.insert((1, 2), 3);
        let report = router.emit("t", Json(bad)).await;
        assert!(matches!(report.first_error(), Some(EventError::Serialization(_))));
        assert!(store.get("s").unwrap().contents().is_empty());
    }

    #[tokio::test]
    async fn test_flush_failure_is_acked() {
        let store = MemoryLogStore::new();
        let log = store.open("s").await.unwrap();
        store.get("s").unwrap().fail_flushes(true);
        let router: Router<Message> = Router::new();
        router.listen("t", Appender::new(log)).unwrap();

        let report = router.emit("t", Message::from("x")).await;
        assert!(matches!(report.first_error(), Some(EventError::LogIo { .. })));
    }

    #[tokio::test]
    async fn test_flush_failure_fails_every_emit_in_flight() {
        let store = MemoryLogStore::new();
        let log = store.open("s").await.unwrap();
        let handle = store.get("s").unwrap();
        handle.fail_flushes(true);
        let router: Router<Message> = Router::new();
        router.listen("t", Appender::new(log)).unwrap();

        let first = router.emit("t", Message::from("A"));
        let second = router.emit("t", Message::from("B"));
        assert!(!first.await.is_ok());
        assert!(!second.await.is_ok());
        assert!(handle.contents().is_empty());

        // nothing was dropped: the next durable emit writes all three in order
        handle.fail_flushes(false);
        assert!(router.emit("t", Message::from("C")).await.is_ok());
        assert_eq!(handle.contents(), Bytes::from("A\nB\nC\n"));
    }

    #[test]
    fn test_without_runtime_fails_ack() {
        let store = MemoryLogStore::new();
        let log = futures::executor::block_on(store.open("s")).unwrap();
        let router: Router<Message> = Router::new();
        router.listen("t", Appender::new(log)).unwrap();

        let report = futures::executor::block_on(router.emit("t", Message::from("x")));
        assert!(matches!(report.first_error(), Some(EventError::Config(_))));
    }
}
