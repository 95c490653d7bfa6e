//! Listener trait and the two listener shapes the router accepts

use crate::delivery::Ack;
use std::sync::Arc;

/// Token identifying one registration, returned by `Router::listen`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A callable invoked for every message on a matching topic
///
/// `deliver` runs synchronously inside `emit`. It must answer `ack` exactly
/// once, either before returning or later (e.g. from a spawned task).
pub trait Listener<M>: Send + Sync {
    fn deliver(&self, message: &Arc<M>, ack: Ack);
}

/// Listener that acknowledges right after its body runs
///
/// Built by [`from_fn`]; it cannot report a delivery failure.
pub struct FnListener<F>(F);

/// Wrap a closure taking only the message
pub fn from_fn<M, F>(f: F) -> FnListener<F>
where
    F: Fn(&M) + Send + Sync,
{
    FnListener(f)
}

impl<M, F> Listener<M> for FnListener<F>
where
    F: Fn(&M) + Send + Sync,
{
    fn deliver(&self, message: &Arc<M>, ack: Ack) {
        (self.0)(message);
        ack.ok();
    }
}

/// Listener that answers its own ack
pub struct AckListener<F>(F);

/// Wrap a closure taking the message and its ack
pub fn with_ack<M, F>(f: F) -> AckListener<F>
where
    F: Fn(&Arc<M>, Ack) + Send + Sync,
{
    AckListener(f)
}

impl<M, F> Listener<M> for AckListener<F>
where
    F: Fn(&Arc<M>, Ack) + Send + Sync,
{
    fn deliver(&self, message: &Arc<M>, ack: Ack) {
        (self.0)(message, ack)
    }
}

/// Identity of a shared listener, ignoring vtable metadata
pub(crate) fn same_listener<M>(a: &Arc<dyn Listener<M>>, b: &Arc<dyn Listener<M>>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
