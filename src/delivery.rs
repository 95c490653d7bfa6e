//! Acknowledgment aggregation for a single emit
//!
//! Every emit owns one [`EmitTracker`]. It starts expecting a single sentinel
//! ack that stands for "router scan finished"; each matched listener bumps
//! the expected count before it is invoked and hands out one [`Ack`]. The
//! sentinel is acked after the scan, so the [`Completion`] resolves exactly
//! once, after the last ack, whether listeners answer synchronously or later.

use crate::error::{EventError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome of one emit, available once every matched listener acknowledged
#[derive(Debug, Default)]
pub struct EmitReport {
    /// Number of listeners the message was delivered to
    pub delivered: usize,

    /// Errors reported by listeners, in acknowledgment order
    pub errors: Vec<EventError>,
}

impl EmitReport {
    /// The first error reported, if any
    pub fn first_error(&self) -> Option<&EventError> {
        self.errors.first()
    }

    /// Whether every listener acknowledged without error
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of listeners on success, the first error otherwise
    pub fn into_result(self) -> Result<usize> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.delivered),
        }
    }
}

struct EmitState {
    expected: usize,
    completed: usize,
    errors: Vec<EventError>,
    done: Option<oneshot::Sender<EmitReport>>,
}

/// Per-emit acknowledgment counter
pub(crate) struct EmitTracker {
    state: Mutex<EmitState>,
}

impl EmitTracker {
    /// Create a tracker expecting only the sentinel ack
    pub(crate) fn new() -> (Arc<Self>, Completion) {
        let (tx, rx) = oneshot::channel();
        let tracker = Arc::new(Self {
            state: Mutex::new(EmitState {
                expected: 1,
                completed: 0,
                errors: Vec::new(),
                done: Some(tx),
            }),
        });
        (tracker, Completion { rx })
    }

    fn lock(&self) -> MutexGuard<'_, EmitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Account for one more listener and hand out its ack
    pub(crate) fn expect(self: &Arc<Self>) -> Ack {
        self.lock().expected += 1;
        Ack {
            tracker: Some(self.clone()),
        }
    }

    /// Ack the sentinel once the router scan is over
    pub(crate) fn finish_scan(&self) {
        self.complete(None);
    }

    fn complete(&self, error: Option<EventError>) {
        let mut state = self.lock();
        state.completed += 1;
        if let Some(err) = error {
            state.errors.push(err);
        }
        if state.completed == state.expected {
            if let Some(tx) = state.done.take() {
                let report = EmitReport {
                    delivered: state.expected - 1,
                    errors: std::mem::take(&mut state.errors),
                };
                let _ = tx.send(report);
            }
        }
    }
}

/// One listener's acknowledgment of a delivered message
///
/// Must be answered exactly once. An `Ack` dropped without an answer counts
/// as a failed delivery so the emit still completes.
pub struct Ack {
    tracker: Option<Arc<EmitTracker>>,
}

impl Ack {
    /// Acknowledge successful processing
    pub fn ok(self) {
        self.done(Ok(()));
    }

    /// Report a delivery failure
    pub fn fail(self, err: EventError) {
        self.done(Err(err));
    }

    /// Acknowledge with the outcome of processing
    pub fn done(mut self, result: Result<()>) {
        if let Some(tracker) = self.tracker.take() {
            tracker.complete(result.err());
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.complete(Some(EventError::Ack(
                "listener dropped its ack without answering".to_string(),
            )));
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("pending", &self.tracker.is_some())
            .finish()
    }
}

/// Future resolving to the [`EmitReport`] of one emit
///
/// Dispatch has already happened when this is returned; dropping it only
/// discards the report.
#[must_use = "the emit already happened; await this to learn whether it was acknowledged"]
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<EmitReport>,
}

impl Future for Completion {
    type Output = EmitReport;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<EmitReport> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|report| report.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_no_listeners_completes_on_scan() {
        let (tracker, completion) = EmitTracker::new();
        tracker.finish_scan();
        let report = completion.now_or_never().unwrap();
        assert_eq!(report.delivered, 0);
        assert!(report.is_ok());
    }

    #[test]
    fn test_waits_for_sentinel() {
        let (tracker, mut completion) = EmitTracker::new();
        let ack = tracker.expect();
        ack.ok();
        assert!((&mut completion).now_or_never().is_none());
        tracker.finish_scan();
        assert_eq!(completion.now_or_never().unwrap().delivered, 1);
    }

    #[test]
    fn test_waits_for_late_ack() {
        let (tracker, mut completion) = EmitTracker::new();
        let first = tracker.expect();
        let second = tracker.expect();
        first.ok();
        tracker.finish_scan();
        assert!((&mut completion).now_or_never().is_none());
        second.ok();
        assert_eq!(completion.now_or_never().unwrap().delivered, 2);
    }

    #[test]
    fn test_collects_errors_in_order() {
        let (tracker, completion) = EmitTracker::new();
        let a = tracker.expect();
        let b = tracker.expect();
        let c = tracker.expect();
        b.fail(EventError::Handler("b".to_string()));
        a.ok();
        c.fail(EventError::Handler("c".to_string()));
        tracker.finish_scan();

        let report = completion.now_or_never().unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(report.first_error(), Some(EventError::Handler(m)) if m == "b"));
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_dropped_ack_counts_as_error() {
        let (tracker, completion) = EmitTracker::new();
        drop(tracker.expect());
        tracker.finish_scan();

        let report = completion.now_or_never().unwrap();
        assert!(matches!(report.first_error(), Some(EventError::Ack(_))));
    }

    #[test]
    fn test_into_result_ok() {
        let report = EmitReport {
            delivered: 4,
            errors: Vec::new(),
        };
        assert_eq!(report.into_result().unwrap(), 4);
    }
}
