//! Listener groups bucketed by key length
//!
//! Keys are spread over 256 buckets by `len & 255`. A live listener count per
//! bucket lets dispatch skip the string lookup entirely for key lengths that
//! have no listeners, which is the common case for most published topics.
//! The bucketing only prunes lookups; the key comparison is always exact.

use super::listener::{same_listener, Listener, ListenerId};
use std::collections::HashMap;
use std::sync::Arc;

const FINGERPRINTS: usize = 256;

#[inline]
pub(crate) fn fingerprint(len: usize) -> usize {
    len & (FINGERPRINTS - 1)
}

pub(crate) struct Registration<M> {
    pub(crate) id: ListenerId,
    pub(crate) listener: Arc<dyn Listener<M>>,
}

/// One listener category (exact, prefix or suffix)
pub(crate) struct ListenerIndex<M> {
    buckets: Vec<HashMap<String, Vec<Registration<M>>>>,
    live: [usize; FINGERPRINTS],
    total: usize,
}

impl<M> Default for ListenerIndex<M> {
    fn default() -> Self {
        Self {
            buckets: (0..FINGERPRINTS).map(|_| HashMap::new()).collect(),
            live: [0; FINGERPRINTS],
            total: 0,
        }
    }
}

impl<M> ListenerIndex<M> {
    /// Append a registration to the group for `key`
    pub(crate) fn insert(&mut self, key: &str, registration: Registration<M>) {
        let fp = fingerprint(key.len());
        self.buckets[fp]
            .entry(key.to_string())
            .or_default()
            .push(registration);
        self.live[fp] += 1;
        self.total += 1;
    }

    /// Remove the first registration with this id
    pub(crate) fn remove_id(&mut self, key: &str, id: ListenerId) -> bool {
        self.remove_first(key, |r| r.id == id)
    }

    /// Remove the first registration holding this exact listener
    pub(crate) fn remove_listener(&mut self, key: &str, listener: &Arc<dyn Listener<M>>) -> bool {
        self.remove_first(key, |r| same_listener(&r.listener, listener))
    }

    fn remove_first(&mut self, key: &str, matches: impl Fn(&Registration<M>) -> bool) -> bool {
        let fp = fingerprint(key.len());
        let bucket = &mut self.buckets[fp];
        let Some(group) = bucket.get_mut(key) else {
            return false;
        };
        let Some(pos) = group.iter().position(matches) else {
            return false;
        };
        group.remove(pos);
        if group.is_empty() {
            bucket.remove(key);
        }
        self.live[fp] -= 1;
        self.total -= 1;
        true
    }

    /// Whether any listener is registered under a key of this length
    #[inline]
    pub(crate) fn has_length(&self, len: usize) -> bool {
        self.live[fingerprint(len)] > 0
    }

    /// The listener at `position` in the group for `key`, if any
    pub(crate) fn get(&self, key: &str, position: usize) -> Option<Arc<dyn Listener<M>>> {
        self.buckets[fingerprint(key.len())]
            .get(key)
            .and_then(|group| group.get(position))
            .map(|r| r.listener.clone())
    }

    /// Number of registrations in this category
    pub(crate) fn len(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Ack;

    struct Noop;

    impl Listener<()> for Noop {
        fn deliver(&self, _message: &Arc<()>, ack: Ack) {
            ack.ok();
        }
    }

    fn reg(id: u64) -> Registration<()> {
        Registration {
            id: ListenerId(id),
            listener: Arc::new(Noop),
        }
    }

    #[test]
    fn test_fingerprint_wraps_at_256() {
        assert_eq!(fingerprint(3), 3);
        assert_eq!(fingerprint(256), 0);
        assert_eq!(fingerprint(259), 3);
    }

    #[test]
    fn test_live_count_tracks_lengths() {
        let mut index = ListenerIndex::default();
        assert!(!index.has_length(4));

        index.insert("foo.", reg(1));
        index.insert("bar.", reg(2));
        assert!(index.has_length(4));
        assert!(!index.has_length(3));
        assert_eq!(index.len(), 2);

        assert!(index.remove_id("foo.", ListenerId(1)));
        assert!(index.has_length(4));
        assert!(index.remove_id("bar.", ListenerId(2)));
        assert!(!index.has_length(4));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_colliding_lengths_stay_distinct() {
        let mut index = ListenerIndex::default();
        let long = "x".repeat(260);
        index.insert(&long, reg(1));
        assert!(index.has_length(4));
        assert!(index.get("abcd", 0).is_none());
        assert!(index.get(&long, 0).is_some());
    }

    #[test]
    fn test_remove_only_one_and_drop_empty_group() {
        let mut index = ListenerIndex::default();
        let shared: Arc<dyn Listener<()>> = Arc::new(Noop);
        for id in 1..=2 {
            index.insert(
                "k",
                Registration {
                    id: ListenerId(id),
                    listener: shared.clone(),
                },
            );
        }

        assert!(index.remove_listener("k", &shared));
        assert!(index.get("k", 0).is_some());
        assert!(index.get("k", 1).is_none());

        assert!(index.remove_listener("k", &shared));
        assert!(index.get("k", 0).is_none());
        assert!(!index.remove_listener("k", &shared));
        assert!(!index.remove_id("missing", ListenerId(9)));
    }
}
