// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Waiting queue for pending slot allocations.
//!
//! One FIFO per provider, ordered by `(enqueued_at, insertion sequence)`.
//! The queue hands out at-least-once semantics: a popped entry that cannot be
//! served is re-enqueued, and consumers tolerate duplicates by re-checking
//! the voice's `allocation_status`. This handle is the durability seam; a
//! persistent backend replays entries through the same interface.

use crate::clock::SharedClock;
use crate::model::{Provider, QueueEntry, UserId, VoiceId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

type QueueKey = (DateTime<Utc>, u64);

/// Position of an entry after an enqueue, 1-indexed, with the queue length
/// at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePosition {
    /// 1-indexed FIFO rank.
    pub position: usize,
    /// Number of entries waiting on the provider, including this one.
    pub length: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    queues: HashMap<Provider, BTreeMap<QueueKey, QueueEntry>>,
    by_voice: HashMap<VoiceId, (Provider, QueueKey)>,
    seq: u64,
}

impl QueueInner {
    fn position_of(&self, provider: Provider, key: QueueKey) -> usize {
        self.queues
            .get(&provider)
            .map(|q| q.range(..=key).count())
            .unwrap_or_default()
    }
}

/// Store of pending allocation requests, one FIFO per provider.
#[derive(Debug)]
pub struct SlotQueue {
    clock: SharedClock,
    inner: Mutex<QueueInner>,
}

impl SlotQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { clock, inner: Mutex::new(QueueInner::default()) }
    }

    /// Appends a voice to its provider's queue, or returns the existing
    /// position when the voice is already waiting.
    pub fn enqueue(&self, provider: Provider, voice_id: VoiceId, user_id: UserId) -> QueuePosition {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if let Some((provider, key)) = inner.by_voice.get(&voice_id).copied() {
            let position = inner.position_of(provider, key);
            let length = inner.queues.get(&provider).map(BTreeMap::len).unwrap_or_default();
            return QueuePosition { position, length };
        }
        inner.seq += 1;
        let key = (now, inner.seq);
        let entry = QueueEntry { provider, voice_id, user_id, enqueued_at: now, attempts: 0 };
        let _ = inner.queues.entry(provider).or_default().insert(key, entry);
        let _ = inner.by_voice.insert(voice_id, (provider, key));
        let position = inner.position_of(provider, key);
        let length = inner.queues.get(&provider).map(BTreeMap::len).unwrap_or_default();
        QueuePosition { position, length }
    }

    /// Puts a popped entry back at the tail, bumping its attempt count.
    pub fn requeue(&self, entry: QueueEntry) -> QueuePosition {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if let Some((provider, key)) = inner.by_voice.get(&entry.voice_id).copied() {
            // Someone re-enqueued the voice already; keep the earlier entry.
            let position = inner.position_of(provider, key);
            let length = inner.queues.get(&provider).map(BTreeMap::len).unwrap_or_default();
            return QueuePosition { position, length };
        }
        inner.seq += 1;
        let key = (now, inner.seq);
        let provider = entry.provider;
        let voice_id = entry.voice_id;
        let requeued = QueueEntry { enqueued_at: now, attempts: entry.attempts + 1, ..entry };
        let _ = inner.queues.entry(provider).or_default().insert(key, requeued);
        let _ = inner.by_voice.insert(voice_id, (provider, key));
        let position = inner.position_of(provider, key);
        let length = inner.queues.get(&provider).map(BTreeMap::len).unwrap_or_default();
        QueuePosition { position, length }
    }

    /// The oldest `n` entries without removing them.
    #[must_use]
    pub fn peek(&self, provider: Provider, n: usize) -> Vec<QueueEntry> {
        let inner = self.inner.lock();
        inner
            .queues
            .get(&provider)
            .map(|q| q.values().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns up to `capacity` oldest entries.
    pub fn pop_ready(&self, provider: Provider, capacity: usize) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.queues.get_mut(&provider) else {
            return Vec::new();
        };
        let keys: Vec<QueueKey> = queue.keys().take(capacity).copied().collect();
        let mut popped = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = queue.remove(&key) {
                popped.push(entry);
            }
        }
        for entry in &popped {
            let _ = inner.by_voice.remove(&entry.voice_id);
        }
        popped
    }

    /// Drops a voice's entry if present. Idempotent.
    pub fn remove(&self, voice_id: VoiceId) -> bool {
        let mut inner = self.inner.lock();
        let Some((provider, key)) = inner.by_voice.remove(&voice_id) else {
            return false;
        };
        inner.queues.get_mut(&provider).map(|q| q.remove(&key).is_some()).unwrap_or(false)
    }

    /// Number of entries waiting on `provider`.
    #[must_use]
    pub fn len(&self, provider: Provider) -> usize {
        self.inner.lock().queues.get(&provider).map(BTreeMap::len).unwrap_or_default()
    }

    /// Whether `provider` has no waiting entries.
    #[must_use]
    pub fn is_empty(&self, provider: Provider) -> bool {
        self.len(provider) == 0
    }

    /// 1-indexed FIFO rank of a waiting voice, `None` when not queued.
    #[must_use]
    pub fn position(&self, voice_id: VoiceId) -> Option<usize> {
        let inner = self.inner.lock();
        let (provider, key) = inner.by_voice.get(&voice_id).copied()?;
        Some(inner.position_of(provider, key))
    }

    /// Age of the oldest waiting entry, for the operational view.
    #[must_use]
    pub fn oldest_wait(&self, provider: Provider) -> Option<chrono::Duration> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let (_, entry) = inner.queues.get(&provider)?.iter().next()?;
        Some(now - entry.enqueued_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn queue() -> (Arc<ManualClock>, SlotQueue) {
        let clock = Arc::new(ManualClock::starting_now());
        let q = SlotQueue::new(clock.clone());
        (clock, q)
    }

    #[test]
    fn fifo_order_with_insertion_tie_break() {
        let (_clock, q) = queue();
        let (a, b, c) = (VoiceId::new(), VoiceId::new(), VoiceId::new());
        assert_eq!(
            q.enqueue(Provider::ElevenLabs, a, UserId::from("u1")),
            QueuePosition { position: 1, length: 1 }
        );
        assert_eq!(
            q.enqueue(Provider::ElevenLabs, b, UserId::from("u2")),
            QueuePosition { position: 2, length: 2 }
        );
        assert_eq!(
            q.enqueue(Provider::ElevenLabs, c, UserId::from("u3")),
            QueuePosition { position: 3, length: 3 }
        );

        let popped = q.pop_ready(Provider::ElevenLabs, 2);
        assert_eq!(popped.iter().map(|e| e.voice_id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(q.position(c), Some(1));
    }

    #[test]
    fn duplicate_enqueue_keeps_position() {
        let (_clock, q) = queue();
        let (a, b) = (VoiceId::new(), VoiceId::new());
        let _ = q.enqueue(Provider::ElevenLabs, a, UserId::from("u1"));
        let _ = q.enqueue(Provider::ElevenLabs, b, UserId::from("u2"));
        let again = q.enqueue(Provider::ElevenLabs, a, UserId::from("u1"));
        assert_eq!(again, QueuePosition { position: 1, length: 2 });
        assert_eq!(q.len(Provider::ElevenLabs), 2);
    }

    #[test]
    fn requeue_moves_to_tail_and_counts_attempts() {
        let (_clock, q) = queue();
        let (a, b) = (VoiceId::new(), VoiceId::new());
        let _ = q.enqueue(Provider::ElevenLabs, a, UserId::from("u1"));
        let _ = q.enqueue(Provider::ElevenLabs, b, UserId::from("u2"));
        let popped = q.pop_ready(Provider::ElevenLabs, 1);
        let entry = popped.into_iter().next().unwrap();
        assert_eq!(entry.voice_id, a);
        let pos = q.requeue(entry);
        assert_eq!(pos.position, 2);
        let tail = q.peek(Provider::ElevenLabs, 2).pop().unwrap();
        assert_eq!(tail.voice_id, a);
        assert_eq!(tail.attempts, 1);
    }

    #[test]
    fn providers_are_independent() {
        let (_clock, q) = queue();
        let _ = q.enqueue(Provider::ElevenLabs, VoiceId::new(), UserId::from("u1"));
        assert_eq!(q.len(Provider::ElevenLabs), 1);
        assert_eq!(q.len(Provider::Cartesia), 0);
        assert!(q.is_empty(Provider::Cartesia));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_clock, q) = queue();
        let a = VoiceId::new();
        let _ = q.enqueue(Provider::ElevenLabs, a, UserId::from("u1"));
        assert!(q.remove(a));
        assert!(!q.remove(a));
        assert_eq!(q.len(Provider::ElevenLabs), 0);
    }

    #[test]
    fn oldest_wait_tracks_head_age() {
        let (clock, q) = queue();
        let _ = q.enqueue(Provider::ElevenLabs, VoiceId::new(), UserId::from("u1"));
        clock.advance(chrono::Duration::seconds(45));
        assert_eq!(q.oldest_wait(Provider::ElevenLabs), Some(chrono::Duration::seconds(45)));
    }
}
