//! Scheduled-callback registry.
//!
//! Tracks every outstanding one-shot and periodic callback of a session. The
//! registry is the authority for quiescence: a session may only finish while
//! it is empty.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

/// Handle returned to sandboxed code by `setTimeout` / `setInterval`.
pub type TimerId = u64;

/// Which sub-registry a callback lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Once,
    Repeating,
}

#[derive(Debug)]
struct Entry<T> {
    callback: T,
    due: Instant,
    seq: u64,
    period: Duration,
}

/// A callback taken off the queue.
#[derive(Debug)]
pub struct Fired<T> {
    pub id: TimerId,
    pub kind: TimerKind,
    pub callback: T,
}

/// One-shot and periodic callbacks plus a due-time queue.
///
/// Callbacks due at the same instant fire in scheduling order.
#[derive(Debug)]
pub struct CallbackRegistry<T> {
    next_id: TimerId,
    next_seq: u64,
    once: HashMap<TimerId, Entry<T>>,
    repeating: HashMap<TimerId, Entry<T>>,
    queue: BTreeMap<(Instant, u64), TimerId>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            once: HashMap::new(),
            repeating: HashMap::new(),
            queue: BTreeMap::new(),
        }
    }

    fn enqueue(&mut self, id: TimerId, due: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((due, seq), id);
        seq
    }

    fn allocate(&mut self) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Schedule `callback` to run once, `delay` after `now`.
    pub fn schedule_once(&mut self, now: Instant, delay: Duration, callback: T) -> TimerId {
        let id = self.allocate();
        let due = now + delay;
        let seq = self.enqueue(id, due);
        self.once.insert(
            id,
            Entry {
                callback,
                due,
                seq,
                period: Duration::ZERO,
            },
        );
        id
    }

    /// Schedule `callback` every `period`, first run one period after `now`.
    pub fn schedule_repeating(&mut self, now: Instant, period: Duration, callback: T) -> TimerId {
        let id = self.allocate();
        let due = now + period;
        let seq = self.enqueue(id, due);
        self.repeating.insert(
            id,
            Entry {
                callback,
                due,
                seq,
                period,
            },
        );
        id
    }

    /// Cancel a one-shot callback. Unknown handles are ignored.
    pub fn cancel_once(&mut self, id: TimerId) -> bool {
        self.once.remove(&id).is_some_and(|entry| {
            self.queue.remove(&(entry.due, entry.seq));
            true
        })
    }

    /// Cancel a periodic callback. Unknown handles are ignored.
    pub fn cancel_repeating(&mut self, id: TimerId) -> bool {
        self.repeating.remove(&id).is_some_and(|entry| {
            self.queue.remove(&(entry.due, entry.seq));
            true
        })
    }

    /// Earliest due instant, if anything is scheduled.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    #[must_use]
    pub fn contains(&self, id: TimerId) -> bool {
        self.once.contains_key(&id) || self.repeating.contains_key(&id)
    }

    /// Outstanding callbacks across both sub-registries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.once.len() + self.repeating.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.once.is_empty() && self.repeating.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.once.clear();
        self.repeating.clear();
        self.queue.clear();
    }
}

impl<T: Clone> CallbackRegistry<T> {
    /// Take the earliest callback due at or before `now`.
    ///
    /// One-shot callbacks leave the registry; periodic ones are re-queued one
    /// period after `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Fired<T>> {
        let (&(due, seq), &id) = self.queue.iter().next()?;
        if due > now {
            return None;
        }
        self.queue.remove(&(due, seq));

        if let Some(entry) = self.once.remove(&id) {
            return Some(Fired {
                id,
                kind: TimerKind::Once,
                callback: entry.callback,
            });
        }

        let next_due = now + self.repeating.get(&id)?.period;
        let next_seq = self.enqueue(id, next_due);
        let entry = self.repeating.get_mut(&id)?;
        entry.due = next_due;
        entry.seq = next_seq;
        Some(Fired {
            id,
            kind: TimerKind::Repeating,
            callback: entry.callback.clone(),
        })
    }
}
