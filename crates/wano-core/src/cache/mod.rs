//! Reference-counted change-notification cache
//!
//! One cache instance mirrors one store table (interface state, uplink
//! status, bridge ports) for the keys somebody cares about.
//!
//! ## Reference counting
//!
//! An entry holds one reference per connected observer plus one while the
//! backing row is known to exist. The entry is removed as soon as the count
//! drops to zero, so an entry exists iff its refcount is positive.
//!
//! ## Deferred delivery
//!
//! The cache never calls observers. Snapshot changes queue notifications that
//! the orchestrator drains with [`ChangeCache::take_notifications()`] after the
//! current event has been fully processed; first subscriptions queue a refresh
//! that the orchestrator resolves against the store with
//! [`ChangeCache::take_refreshes()`] and [`ChangeCache::on_refresh()`].
//!
//! ```text
//! store row event ──► on_row_*() ──► snapshot ──► pending notifications
//!                                                     │
//! subscribe() ──► refresh queue ──► select_*() ──► on_refresh()
//!                                                     │
//!                                  take_notifications() ──► observers
//! ```

use std::collections::{HashMap, VecDeque};

use tracing::debug;

/// Identifies one observer connection
pub type ObserverToken = u64;

/// Back reference to an observer connection
///
/// Returned by [`ChangeCache::subscribe()`] and consumed by
/// [`ChangeCache::unsubscribe()`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    key: String,
    token: ObserverToken,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> ObserverToken {
        self.token
    }
}

#[derive(Debug)]
struct CacheEntry<S, O> {
    snapshot: Option<S>,
    /// Backing row is known to exist and holds a reference
    present: bool,
    refcount: usize,
    observers: Vec<(ObserverToken, O)>,
}

impl<S, O> CacheEntry<S, O> {
    fn new() -> Self {
        Self {
            snapshot: None,
            present: false,
            refcount: 0,
            observers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Notification {
    key: String,
    token: ObserverToken,
}

/// Keyed snapshot cache with observer notification
#[derive(Debug)]
pub struct ChangeCache<S, O> {
    name: &'static str,
    entries: HashMap<String, CacheEntry<S, O>>,
    pending: VecDeque<Notification>,
    refreshes: VecDeque<String>,
    next_token: ObserverToken,
}

impl<S: Clone, O: Clone> ChangeCache<S, O> {
    /// Create an empty cache; `name` only shows up in logs
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
            pending: VecDeque::new(),
            refreshes: VecDeque::new(),
            next_token: 1,
        }
    }

    /// Return the entry for `key`, creating it with refcount 0
    ///
    /// Callers must take a reference on a fresh entry before returning to the
    /// event loop.
    fn get_or_create(&mut self, key: &str) -> (&mut CacheEntry<S, O>, bool) {
        let created = !self.entries.contains_key(key);
        if created {
            debug!("{}: Creating cache entry {}", self.name, key);
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(CacheEntry::new);
        (entry, created)
    }

    fn notify_all(&mut self, key: &str) {
        let Some(entry) = self.entries.get(key) else {
            return;
        };
        for (token, _) in &entry.observers {
            let n = Notification {
                key: key.to_string(),
                token: *token,
            };
            if !self.pending.contains(&n) {
                self.pending.push_back(n);
            }
        }
    }

    /// Drop one reference; reclaims the entry at zero
    fn release(&mut self, key: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            debug!("{}: Reclaiming cache entry {}", self.name, key);
            self.entries.remove(key);
        }
    }

    fn store_row(&mut self, key: &str, row: S) {
        let (entry, _) = self.get_or_create(key);
        if !entry.present {
            entry.present = true;
            entry.refcount += 1;
        }
        entry.snapshot = Some(row);
        self.notify_all(key);
    }

    /// Source callback: a row appeared
    pub fn on_row_new(&mut self, key: &str, row: S) {
        self.store_row(key, row);
    }

    /// Source callback: a row changed; unknown keys are treated as new rows
    pub fn on_row_modify(&mut self, key: &str, row: S) {
        self.store_row(key, row);
    }

    /// Source callback: a row was deleted
    ///
    /// Observers are told the snapshot is gone before the row reference is
    /// dropped.
    pub fn on_row_delete(&mut self, key: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if !entry.present {
            return;
        }
        entry.present = false;
        entry.snapshot = None;
        self.notify_all(key);
        self.release(key);
    }

    /// Result of a refresh started by a first subscription
    ///
    /// Ignored if every subscriber left in the meantime.
    pub fn on_refresh(&mut self, key: &str, row: Option<S>) {
        if !self.entries.contains_key(key) {
            return;
        }
        match row {
            Some(row) => self.store_row(key, row),
            None => self.on_row_delete(key),
        }
    }

    /// Connect an observer to `key`
    ///
    /// The first reference to a key queues a refresh from the store; an
    /// already valid snapshot is delivered to the new observer on the next
    /// drain.
    pub fn subscribe(&mut self, key: &str, observer: O) -> Subscription {
        let token = self.next_token;
        self.next_token += 1;

        let (entry, created) = self.get_or_create(key);
        entry.refcount += 1;
        entry.observers.push((token, observer));
        let valid = entry.snapshot.is_some();

        if created {
            self.refreshes.push_back(key.to_string());
        } else if valid {
            self.pending.push_back(Notification {
                key: key.to_string(),
                token,
            });
        }

        Subscription {
            key: key.to_string(),
            token,
        }
    }

    /// Disconnect an observer and drop its reference
    ///
    /// Safe when the entry is already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) {
        let Some(entry) = self.entries.get_mut(&subscription.key) else {
            return;
        };
        let before = entry.observers.len();
        entry.observers.retain(|(t, _)| *t != subscription.token);
        if entry.observers.len() != before {
            self.release(&subscription.key);
        }
    }

    /// Queue a store refresh for a subscribed key
    pub fn refresh(&mut self, subscription: &Subscription) {
        if self.entries.contains_key(&subscription.key) && !self.refreshes.contains(&subscription.key)
        {
            self.refreshes.push_back(subscription.key.clone());
        }
    }

    /// Queue a store refresh for every cached key
    pub fn refresh_all(&mut self) {
        for key in self.entries.keys() {
            if !self.refreshes.contains(key) {
                self.refreshes.push_back(key.clone());
            }
        }
    }

    /// Current snapshot of `key`
    pub fn snapshot(&self, key: &str) -> Option<&S> {
        self.entries.get(key).and_then(|e| e.snapshot.as_ref())
    }

    /// Reference count of `key`; 0 when no entry exists
    pub fn refcount(&self, key: &str) -> usize {
        self.entries.get(key).map(|e| e.refcount).unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.refreshes.is_empty()
    }

    /// Drain queued notifications
    ///
    /// Each item carries the observer and the snapshot as of now. Observers
    /// that disconnected after the notification was queued are skipped.
    pub fn take_notifications(&mut self) -> Vec<(O, Option<S>)> {
        let mut out = Vec::new();
        while let Some(n) = self.pending.pop_front() {
            let Some(entry) = self.entries.get(&n.key) else {
                continue;
            };
            if let Some((_, observer)) = entry.observers.iter().find(|(t, _)| *t == n.token) {
                out.push((observer.clone(), entry.snapshot.clone()));
            }
        }
        out
    }

    /// Drain keys waiting for a store refresh
    pub fn take_refreshes(&mut self) -> Vec<String> {
        self.refreshes
            .drain(..)
            .filter(|key| self.entries.contains_key(key))
            .collect()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (key, entry) in &self.entries {
            assert!(entry.refcount > 0, "{key}: entry alive with refcount 0");
            assert_eq!(
                entry.refcount,
                entry.observers.len() + usize::from(entry.present),
                "{key}: refcount does not match references"
            );
        }
    }
}
