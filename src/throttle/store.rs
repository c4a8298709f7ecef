//! Keyed sliding-window event store.
//!
//! The store knows nothing about limits or lockouts. It keeps, per key, the
//! timestamps of recent events and answers "how many events in the last W ms".
//! Trimming is lazy (on access); keys that stop being touched are removed by
//! [`WindowCounterStore::sweep`].

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{trace, warn};

use crate::clock::Clock;

/// Event history for a single key.
///
/// Timestamps are kept in ascending order, which holds as long as they come
/// from a monotonic [`Clock`].
#[derive(Debug, Clone, Default)]
pub struct WindowEntry {
    timestamps: VecDeque<u64>,
    last_access: u64,
}

impl WindowEntry {
    /// Create an empty entry touched at `now`.
    pub fn new(now: u64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            last_access: now,
        }
    }

    /// Drop every timestamp older than `now - window_ms`.
    ///
    /// The lower bound is inclusive: an event exactly `window_ms` old stays.
    pub fn trim(&mut self, now: u64, window_ms: u64) {
        let cutoff = now.saturating_sub(window_ms);
        while matches!(self.timestamps.front(), Some(&t) if t < cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Trim to the window, mark the entry as accessed and return the count.
    pub fn count_in_window(&mut self, now: u64, window_ms: u64) -> usize {
        self.trim(now, window_ms);
        self.last_access = now;
        self.timestamps.len()
    }

    /// Append an event at `now`.
    pub fn push(&mut self, now: u64) {
        self.timestamps.push_back(now);
        self.last_access = now;
    }

    /// Milliseconds until the oldest retained event leaves the window.
    ///
    /// Returns 0 when there are no events.
    pub fn reset_after(&self, now: u64, window_ms: u64) -> u64 {
        self.timestamps
            .front()
            .map(|&oldest| oldest.saturating_add(window_ms).saturating_sub(now))
            .unwrap_or(0)
    }

    /// Forget every recorded event.
    pub fn clear(&mut self) {
        self.timestamps.clear();
    }

    /// Number of retained timestamps, without trimming.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Time of the most recent read or write.
    pub fn last_access(&self) -> u64 {
        self.last_access
    }
}

/// Result of an atomic count-decide-record step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Events in the window before this call.
    pub count: usize,
    /// Milliseconds until the oldest event in the window expires.
    pub reset_ms: u64,
    /// Whether this call recorded a new event.
    pub recorded: bool,
}

/// Shared, sharded map from key to [`WindowEntry`].
///
/// Each operation locks only the shard that holds its key, so concurrent
/// requests for different keys rarely contend and a sweep never blocks the
/// whole map at once.
pub struct WindowCounterStore {
    entries: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
}

impl WindowCounterStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// The clock this store reads time from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Count events for `key` within the last `window_ms`.
    ///
    /// Trims stale timestamps and refreshes the entry's last access time as a
    /// side effect. Unknown keys count as zero and are not created.
    pub fn count(&self, key: &str, window_ms: u64) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .get_mut(key)
            .map(|mut entry| entry.count_in_window(now, window_ms))
            .unwrap_or(0)
    }

    /// Record an event for `key` at the current time.
    pub fn record(&self, key: &str) {
        let now = self.clock.now_ms();
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.push(now);
            return;
        }
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| WindowEntry::new(now))
            .push(now);
    }

    /// Milliseconds until the oldest in-window event for `key` expires.
    pub fn reset_after(&self, key: &str, window_ms: u64) -> u64 {
        let now = self.clock.now_ms();
        self.entries
            .get_mut(key)
            .map(|mut entry| {
                entry.trim(now, window_ms);
                entry.reset_after(now, window_ms)
            })
            .unwrap_or(0)
    }

    /// Count, compare against `limit` and conditionally record, as one step.
    ///
    /// The shard lock for `key` is held for the whole call, so two callers can
    /// never both observe `limit - 1` and both be admitted. A rejected call
    /// leaves the timestamps untouched.
    pub fn admit(&self, key: &str, window_ms: u64, limit: usize) -> Admission {
        let now = self.clock.now_ms();
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| WindowEntry::new(now));

        let count = entry.count_in_window(now, window_ms);
        if count >= limit {
            return Admission {
                count,
                reset_ms: entry.reset_after(now, window_ms),
                recorded: false,
            };
        }

        entry.push(now);
        Admission {
            count,
            reset_ms: entry.reset_after(now, window_ms),
            recorded: true,
        }
    }

    /// Remove `key` entirely. Returns whether it existed.
    pub fn reset_key(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key not accessed within the last `max_idle_ms`.
    ///
    /// Returns the number of evicted keys.
    pub fn sweep(&self, max_idle_ms: u64) -> usize {
        self.sweep_by(|_| max_idle_ms)
    }

    /// Remove every key idle for longer than the threshold `max_idle_for`
    /// returns for it. Returns the number of evicted keys.
    pub fn sweep_by<F>(&self, max_idle_for: F) -> usize
    where
        F: Fn(&str) -> u64,
    {
        let now = self.clock.now_ms();
        let mut evicted = 0;

        self.entries.retain(|key, entry| {
            let last_access = entry.last_access();
            if last_access > now {
                warn!(
                    key = %key,
                    last_access,
                    now,
                    "Window entry last accessed in the future, keeping it"
                );
                return true;
            }

            let keep = now - last_access <= max_idle_for(key);
            if !keep {
                evicted += 1;
            }
            keep
        });

        trace!(evicted, remaining = self.entries.len(), "Swept window store");
        evicted
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for WindowCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCounterStore")
            .field("keys", &self.entries.len())
            .finish()
    }
}
