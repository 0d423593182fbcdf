//! Generic "what is new since last poll" detection.
//!
//! Every source supplies two functions: how to key an item, and whether an item
//! counts as newly true given its previous state (absent for never-seen keys).
//! Posts, likes and watched films are new whenever they appear; achievements
//! are new when their `achieved` flag flips from false to true.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use chrono::{DateTime, Utc};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Order in which a source API returns its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOrder {
    NewestFirst,
    OldestFirst,
}

/// Items carrying an "achieved / liked / earned" flag.
pub trait Flagged {
    fn is_flagged(&self) -> bool;
}

/// Newly seen keys are always new; known keys never are.
pub fn always_new<T>(previous: Option<&T>, _current: &T) -> bool {
    previous.is_none()
}

/// New when the flag is set now and was not set before.
pub fn became_true<T: Flagged>(previous: Option<&T>, current: &T) -> bool {
    current.is_flagged() && !previous.map(Flagged::is_flagged).unwrap_or(false)
}

pub struct DeltaDetector<T, K> {
    identity: fn(&T) -> Option<K>,
    is_newly_true: fn(Option<&T>, &T) -> bool,
    occurred_at: Option<fn(&T) -> Option<DateTime<Utc>>>,
    native_order: NativeOrder,
}

impl<T, K> DeltaDetector<T, K>
where
    T: Clone,
    K: Eq + Hash + std::fmt::Debug,
{
    pub fn new(identity: fn(&T) -> Option<K>, is_newly_true: fn(Option<&T>, &T) -> bool) -> Self {
        Self {
            identity,
            is_newly_true,
            occurred_at: None,
            native_order: NativeOrder::NewestFirst,
        }
    }

    /// Sort the delta by this timestamp instead of relying on native order.
    pub fn ordered_by(mut self, occurred_at: fn(&T) -> Option<DateTime<Utc>>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    pub fn native_order(mut self, order: NativeOrder) -> Self {
        self.native_order = order;
        self
    }

    /// Items of `current` that are new relative to `previous`, oldest first.
    ///
    /// An empty `previous` means nothing has been synced yet: the delta is empty
    /// and the caller only seeds its baseline, so years of history are not
    /// backfilled on the first poll.
    pub fn detect_new(&self, previous: &[T], current: &[T]) -> Vec<T> {
        if previous.is_empty() {
            return Vec::new();
        }

        let known: HashMap<K, &T> = previous
            .iter()
            .filter_map(|item| (self.identity)(item).map(|key| (key, item)))
            .collect();

        let mut reported = HashSet::new();
        let mut fresh = Vec::new();
        for (index, item) in current.iter().enumerate() {
            let Some(key) = (self.identity)(item) else {
                log_warn!("skipping remote item #{index} without identity");
                continue;
            };
            if !(self.is_newly_true)(known.get(&key).copied(), item) {
                continue;
            }
            if reported.insert(key) {
                fresh.push(item.clone());
            }
        }

        self.oldest_first(&mut fresh);
        fresh
    }

    /// Well-formed items of `current`, to become the next snapshot.
    pub fn baseline(&self, current: &[T]) -> Vec<T> {
        current
            .iter()
            .filter(|item| (self.identity)(item).is_some())
            .cloned()
            .collect()
    }

    fn oldest_first(&self, items: &mut [T]) {
        if self.native_order == NativeOrder::NewestFirst {
            items.reverse();
        }
        // Stable: ties keep chronological native order, undated items go first.
        if let Some(occurred_at) = self.occurred_at {
            items.sort_by_key(|item| occurred_at(item));
        }
    }
}
