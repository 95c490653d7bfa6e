//! Topic router: exact, prefix and suffix listeners with acked fan-out
//!
//! Topics are matched structurally on the separator (default `.`):
//!
//! - `foo.bar` listens to exactly `foo.bar`
//! - `foo.*` listens to every topic starting with `foo.` (`foo.`, `foo.bar.baz`),
//!   but not to `foo`
//! - `*.bar` listens to every topic ending with `.bar` (`.bar`, `a.b.bar`),
//!   but not to `bar`
//!
//! Every literal separator occurrence is a match point, so empty components
//! (`a..b`, `.foo`) are matched like any other.

pub(crate) mod index;
pub mod listener;

use crate::config::{self, PubSubConfig, WILDCARD};
use crate::delivery::{Completion, EmitTracker};
use crate::error::{EventError, Result};
use index::{ListenerIndex, Registration};
use listener::{Listener, ListenerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Exact,
    Prefix,
    Suffix,
}

struct RouterIndex<M> {
    exact: ListenerIndex<M>,
    prefix: ListenerIndex<M>,
    suffix: ListenerIndex<M>,
}

impl<M> RouterIndex<M> {
    fn category(&self, category: Category) -> &ListenerIndex<M> {
        match category {
            Category::Exact => &self.exact,
            Category::Prefix => &self.prefix,
            Category::Suffix => &self.suffix,
        }
    }

    fn category_mut(&mut self, category: Category) -> &mut ListenerIndex<M> {
        match category {
            Category::Exact => &mut self.exact,
            Category::Prefix => &mut self.prefix,
            Category::Suffix => &mut self.suffix,
        }
    }
}

/// In-process topic router
///
/// Generic over the payload type `M`; defaults to [`Message`](crate::Message).
/// The index lock is never held while a listener runs, so listeners may
/// `listen`, `ignore` or `emit` re-entrantly.
pub struct Router<M = crate::types::Message> {
    separator: String,
    index: Mutex<RouterIndex<M>>,
    next_id: AtomicU64,
}

impl<M> Default for Router<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Router<M> {
    /// Create a router using the `.` separator
    pub fn new() -> Self {
        Self {
            separator: config::DEFAULT_SEPARATOR.to_string(),
            index: Mutex::new(RouterIndex {
                exact: ListenerIndex::default(),
                prefix: ListenerIndex::default(),
                suffix: ListenerIndex::default(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a router with a custom separator
    pub fn with_separator(separator: impl Into<String>) -> Result<Self> {
        let separator = separator.into();
        config::validate_separator(&separator)?;
        Ok(Self {
            separator,
            ..Self::new()
        })
    }

    /// Create a router from the `separator` of a config
    pub fn from_config(config: &PubSubConfig) -> Result<Self> {
        Self::with_separator(config.separator.clone())
    }

    /// The topic component separator
    pub fn separator(&self) -> &str {
        &self.separator
    }

    fn lock(&self) -> MutexGuard<'_, RouterIndex<M>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener on a topic, `foo.*` or `*.foo` pattern
    pub fn listen(&self, topic: &str, listener: impl Listener<M> + 'static) -> Result<ListenerId> {
        self.listen_shared(topic, Arc::new(listener))
    }

    /// Register a shared listener; the same `Arc` can later be passed to
    /// [`Router::ignore_listener`]
    pub fn listen_shared(&self, topic: &str, listener: Arc<dyn Listener<M>>) -> Result<ListenerId> {
        let (category, key) = classify(topic)?;
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .category_mut(category)
            .insert(key, Registration { id, listener });

        tracing::debug!(topic, listener = %id, ?category, "Listener registered");
        Ok(id)
    }

    /// Remove the registration with this id; unknown topics or ids are ignored
    pub fn ignore(&self, topic: &str, id: ListenerId) -> bool {
        match classify(topic) {
            Ok((category, key)) => self.lock().category_mut(category).remove_id(key, id),
            Err(_) => false,
        }
    }

    /// Remove one registration of this listener; unknown topics are ignored
    pub fn ignore_listener(&self, topic: &str, listener: &Arc<dyn Listener<M>>) -> bool {
        match classify(topic) {
            Ok((category, key)) => self
                .lock()
                .category_mut(category)
                .remove_listener(key, listener),
            Err(_) => false,
        }
    }

    /// Total number of registrations across all categories
    pub fn listener_count(&self) -> usize {
        let index = self.lock();
        index.exact.len() + index.prefix.len() + index.suffix.len()
    }

    /// Deliver a message to every matching listener
    ///
    /// Dispatch runs before this returns. The returned [`Completion`]
    /// resolves once every matched listener has acknowledged.
    pub fn emit(&self, topic: &str, message: M) -> Completion {
        let message = Arc::new(message);
        let (tracker, completion) = EmitTracker::new();
        self.dispatch(topic, &message, &tracker);
        tracker.finish_scan();
        completion
    }

    fn dispatch(&self, topic: &str, message: &Arc<M>, tracker: &Arc<EmitTracker>) {
        let len = topic.len();
        self.notify(Category::Exact, topic, message, tracker);

        let sep = self.separator.len();
        let mut from = 0;
        while let Some(found) = topic[from..].find(self.separator.as_str()) {
            let p = from + found;
            self.notify(Category::Prefix, &topic[..p + sep], message, tracker);
            self.notify(Category::Suffix, &topic[p..len], message, tracker);
            from = p + sep;
        }
    }

    /// Call every listener of one group, reading it by position
    ///
    /// A listener that ignores itself (or an earlier one) during dispatch
    /// shifts the group, so the listener after it is skipped for this emit.
    fn notify(&self, category: Category, key: &str, message: &Arc<M>, tracker: &Arc<EmitTracker>) {
        let mut position = 0;
        loop {
            // Re-read the group on every step: listeners may change it re-entrantly.
            let listener = {
                let index = self.lock();
                let listeners = index.category(category);
                if !listeners.has_length(key.len()) {
                    return;
                }
                listeners.get(key, position)
            };
            let Some(listener) = listener else {
                return;
            };
            listener.deliver(message, tracker.expect());
            position += 1;
        }
    }

    /// Alias for [`Router::listen`]
    pub fn subscribe(&self, topic: &str, listener: impl Listener<M> + 'static) -> Result<ListenerId> {
        self.listen(topic, listener)
    }

    /// Alias for [`Router::ignore`]
    pub fn unsubscribe(&self, topic: &str, id: ListenerId) -> bool {
        self.ignore(topic, id)
    }

    /// Alias for [`Router::emit`]
    pub fn publish(&self, topic: &str, message: M) -> Completion {
        self.emit(topic, message)
    }
}

/// Check that a topic can be registered
pub(crate) fn check_topic(topic: &str) -> Result<()> {
    classify(topic).map(|_| ())
}

/// Split a registration topic into its category and index key
fn classify(topic: &str) -> Result<(Category, &str)> {
    if topic.is_empty() {
        return Err(EventError::InvalidTopic(topic.to_string()));
    }
    let head = topic.starts_with(WILDCARD);
    let tail = topic.ends_with(WILDCARD);
    match (head, tail) {
        (true, true) => Err(EventError::InvalidTopic(topic.to_string())),
        (false, true) => Ok((Category::Prefix, &topic[..topic.len() - WILDCARD.len_utf8()])),
        (true, false) => Ok((Category::Suffix, &topic[WILDCARD.len_utf8()..])),
        (false, false) => Ok((Category::Exact, topic)),
    }
}
