// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Voice state: records, guarded lifecycle transitions, slot locks,
//! remote-id uniqueness, and the slot audit log.
//!
//! Two locking layers exist on purpose. The in-process mutex per voice row
//! makes individual reads/writes atomic. The *slot lock* (owner + TTL stored
//! on the row) is the domain-level lock the slot manager holds across a whole
//! allocation or eviction, surviving worker handoffs; stale slot locks are
//! overridden once their TTL lapses.

use crate::clock::{Clock, SharedClock};
use crate::error::Error;
use crate::model::{
    AllocationStatus, EventId, Provider, SlotEvent, SlotEventType, UserId, Voice, VoiceId,
};
use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Whether the lifecycle admits the `from -> to` edge.
///
/// Same-state writes are allowed so idempotent retries stay cheap.
fn transition_allowed(from: AllocationStatus, to: AllocationStatus) -> bool {
    use AllocationStatus::{Allocating, Cooling, Error, Evicted, Ready, Recorded};
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Recorded, Allocating)
            | (Recorded, Error)
            | (Allocating, Ready)
            | (Allocating, Error)
            | (Allocating, Recorded)
            | (Ready, Cooling)
            | (Ready, Recorded)
            | (Ready, Evicted)
            | (Cooling, Ready)
            | (Cooling, Evicted)
            | (Cooling, Recorded)
            | (Evicted, Recorded)
            | (Evicted, Allocating)
            | (Error, Recorded)
            | (Error, Allocating)
    )
}

/// Store of voice rows and slot audit events.
#[derive(Debug)]
pub struct VoiceStore {
    clock: SharedClock,
    voices: RwLock<HashMap<VoiceId, Arc<Mutex<Voice>>>>,
    remote_index: Mutex<HashMap<String, VoiceId>>,
    events: Mutex<Vec<SlotEvent>>,
}

impl VoiceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            voices: RwLock::new(HashMap::new()),
            remote_index: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Inserts a new voice row.
    pub fn insert(&self, voice: Voice) -> Result<(), Error> {
        let mut voices = self.voices.write();
        if voices.contains_key(&voice.voice_id) {
            return Err(Error::AlreadyExists {
                entity: "voice",
                id: voice.voice_id.to_string(),
            });
        }
        let _ = voices.insert(voice.voice_id, Arc::new(Mutex::new(voice)));
        Ok(())
    }

    fn cell(&self, voice_id: VoiceId) -> Result<Arc<Mutex<Voice>>, Error> {
        self.voices
            .read()
            .get(&voice_id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound { entity: "voice", id: voice_id.to_string() })
    }

    /// A snapshot of the row.
    pub fn get(&self, voice_id: VoiceId) -> Result<Voice, Error> {
        Ok(self.cell(voice_id)?.lock().clone())
    }

    /// Deletes the row, releasing its remote-id binding. Returns the final
    /// snapshot so callers can cascade (blob, remote slot, queue entry).
    pub fn remove(&self, voice_id: VoiceId) -> Result<Voice, Error> {
        let cell = {
            let mut voices = self.voices.write();
            voices
                .remove(&voice_id)
                .ok_or_else(|| Error::NotFound { entity: "voice", id: voice_id.to_string() })?
        };
        let voice = cell.lock().clone();
        if let Some(remote_id) = &voice.remote_voice_id {
            let _ = self.remote_index.lock().remove(remote_id);
        }
        Ok(voice)
    }

    /// Snapshots of all voices belonging to `user_id`, upload order not
    /// guaranteed.
    #[must_use]
    pub fn list_for_user(&self, user_id: &UserId) -> Vec<Voice> {
        let cells: Vec<_> = self.voices.read().values().map(Arc::clone).collect();
        let mut out: Vec<Voice> = cells
            .iter()
            .map(|c| c.lock().clone())
            .filter(|v| &v.user_id == user_id)
            .collect();
        out.sort_by_key(|v| (v.created_at, v.voice_id));
        out
    }

    /// Runs `f` on the row under its mutex and returns the updated snapshot.
    pub fn update<R>(
        &self,
        voice_id: VoiceId,
        f: impl FnOnce(&mut Voice) -> R,
    ) -> Result<(R, Voice), Error> {
        let cell = self.cell(voice_id)?;
        let mut voice = cell.lock();
        let out = f(&mut voice);
        Ok((out, voice.clone()))
    }

    /// Moves the row to `to`, rejecting edges outside the lifecycle with
    /// [`Error::InvalidTransition`]. `apply` runs after the check, under the
    /// row mutex, for field updates that belong to the same transition.
    pub fn transition(
        &self,
        voice_id: VoiceId,
        to: AllocationStatus,
        apply: impl FnOnce(&mut Voice),
    ) -> Result<Voice, Error> {
        let cell = self.cell(voice_id)?;
        let mut voice = cell.lock();
        if !transition_allowed(voice.allocation_status, to) {
            return Err(Error::InvalidTransition {
                voice_id,
                from: voice.allocation_status,
                to,
            });
        }
        voice.allocation_status = to;
        apply(&mut voice);
        Ok(voice.clone())
    }

    /// Binds a provider-side voice id, enforcing global uniqueness.
    pub fn bind_remote_id(&self, voice_id: VoiceId, remote_id: &str) -> Result<Voice, Error> {
        let cell = self.cell(voice_id)?;
        let mut voice = cell.lock();
        let mut index = self.remote_index.lock();
        if let Some(holder) = index.get(remote_id) {
            if *holder != voice_id {
                return Err(Error::RemoteIdTaken { remote_voice_id: remote_id.to_owned() });
            }
        }
        if let Some(previous) = voice.remote_voice_id.take() {
            let _ = index.remove(&previous);
        }
        let _ = index.insert(remote_id.to_owned(), voice_id);
        voice.remote_voice_id = Some(remote_id.to_owned());
        Ok(voice.clone())
    }

    /// Clears the provider-side binding, removing it from the uniqueness
    /// index. Idempotent.
    pub fn clear_remote_id(&self, voice_id: VoiceId) -> Result<Voice, Error> {
        let cell = self.cell(voice_id)?;
        let mut voice = cell.lock();
        if let Some(previous) = voice.remote_voice_id.take() {
            let _ = self.remote_index.lock().remove(&previous);
        }
        Ok(voice.clone())
    }

    /// Attempts to take the domain slot lock for `owner`.
    ///
    /// Succeeds when the lock is free, already held by `owner`, or held by
    /// someone whose TTL has lapsed. Returns whether the lock is now held by
    /// `owner`.
    pub fn try_acquire_slot_lock(
        &self,
        voice_id: VoiceId,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let now = self.clock.now();
        let cell = self.cell(voice_id)?;
        let mut voice = cell.lock();
        let free = match (voice.slot_lock_owner, voice.slot_lock_expires_at) {
            (None, _) => true,
            (Some(holder), _) if holder == owner => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        };
        if free {
            voice.slot_lock_owner = Some(owner);
            voice.slot_lock_expires_at = Some(now + ttl);
        }
        Ok(free)
    }

    /// Releases the slot lock if `owner` holds it. Returns whether a release
    /// happened.
    pub fn release_slot_lock(&self, voice_id: VoiceId, owner: Uuid) -> Result<bool, Error> {
        let cell = self.cell(voice_id)?;
        let mut voice = cell.lock();
        if voice.slot_lock_owner == Some(owner) {
            voice.slot_lock_owner = None;
            voice.slot_lock_expires_at = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether a live (non-expired) slot lock is held by someone other than
    /// `owner`.
    pub fn slot_locked_by_other(&self, voice_id: VoiceId, owner: Uuid) -> Result<bool, Error> {
        let now = self.clock.now();
        let voice = self.get(voice_id)?;
        Ok(match (voice.slot_lock_owner, voice.slot_lock_expires_at) {
            (Some(holder), Some(expires)) => holder != owner && expires > now,
            _ => false,
        })
    }

    /// Live count of voices of `provider` in a slot-holding state.
    ///
    /// Counted from the rows on every call rather than cached, so the count
    /// cannot drift from the truth.
    #[must_use]
    pub fn count_active(&self, provider: Provider) -> usize {
        let cells: Vec<_> = self.voices.read().values().map(Arc::clone).collect();
        cells
            .iter()
            .filter(|c| {
                let v = c.lock();
                v.provider == provider && v.allocation_status.holds_slot()
            })
            .count()
    }

    /// Snapshots of `provider` voices idle past `warm_hold` in an evictable
    /// state and not under a live slot lock. Ordering is left to the caller.
    #[must_use]
    pub fn eviction_candidates(&self, provider: Provider, warm_hold: Duration) -> Vec<Voice> {
        let now = self.clock.now();
        let threshold = now - warm_hold;
        let cells: Vec<_> = self.voices.read().values().map(Arc::clone).collect();
        cells
            .iter()
            .map(|c| c.lock().clone())
            .filter(|v| {
                v.provider == provider
                    && matches!(
                        v.allocation_status,
                        AllocationStatus::Ready | AllocationStatus::Cooling
                    )
                    && v.last_used_at.is_none_or(|used| used < threshold)
                    && !matches!(
                        (v.slot_lock_owner, v.slot_lock_expires_at),
                        (Some(_), Some(expires)) if expires > now
                    )
            })
            .collect()
    }

    /// Per-status counts for one provider, for the operational view.
    #[must_use]
    pub fn status_counts(&self, provider: Provider) -> HashMap<AllocationStatus, usize> {
        let cells: Vec<_> = self.voices.read().values().map(Arc::clone).collect();
        let mut counts = HashMap::new();
        for cell in &cells {
            let v = cell.lock();
            if v.provider == provider {
                *counts.entry(v.allocation_status).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Appends a slot audit event.
    pub fn record_event(
        &self,
        voice_id: VoiceId,
        user_id: UserId,
        event_type: SlotEventType,
        reason: impl Into<String>,
        metadata: serde_json::Value,
    ) -> SlotEvent {
        let event = SlotEvent {
            event_id: EventId::new(),
            voice_id,
            user_id,
            event_type,
            reason: reason.into(),
            metadata,
            created_at: self.clock.now(),
        };
        self.events.lock().push(event.clone());
        event
    }

    /// All audit events for one voice, oldest first.
    #[must_use]
    pub fn events_for(&self, voice_id: VoiceId) -> Vec<SlotEvent> {
        self.events.lock().iter().filter(|e| e.voice_id == voice_id).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, VoiceStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = VoiceStore::new(clock.clone());
        (clock, store)
    }

    fn voice(store: &VoiceStore, clock: &ManualClock) -> VoiceId {
        let voice_id = VoiceId::new();
        store
            .insert(Voice {
                voice_id,
                user_id: UserId::from("u1"),
                name: "mum".to_owned(),
                provider: Provider::ElevenLabs,
                sample_blob_key: format!("samples/{voice_id}"),
                sample_bytes: 1024,
                remote_voice_id: None,
                allocation_status: AllocationStatus::Recorded,
                last_used_at: None,
                allocated_at: None,
                slot_lock_owner: None,
                slot_lock_expires_at: None,
                error_message: None,
                created_at: clock.now(),
            })
            .unwrap();
        voice_id
    }

    #[test]
    fn ready_to_allocating_is_rejected() {
        let (clock, store) = store();
        let id = voice(&store, &clock);
        store.transition(id, AllocationStatus::Allocating, |_| {}).unwrap();
        store.transition(id, AllocationStatus::Ready, |_| {}).unwrap();
        let err = store.transition(id, AllocationStatus::Allocating, |_| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn remote_id_is_unique_while_bound() {
        let (clock, store) = store();
        let first = voice(&store, &clock);
        let second = voice(&store, &clock);
        store.bind_remote_id(first, "rv-1").unwrap();
        let err = store.bind_remote_id(second, "rv-1").unwrap_err();
        assert!(matches!(err, Error::RemoteIdTaken { .. }));

        // Clearing releases the id for rebinding.
        store.clear_remote_id(first).unwrap();
        store.bind_remote_id(second, "rv-1").unwrap();
    }

    #[test]
    fn stale_slot_lock_is_overridden() {
        let (clock, store) = store();
        let id = voice(&store, &clock);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert!(store.try_acquire_slot_lock(id, first, Duration::seconds(60)).unwrap());
        assert!(!store.try_acquire_slot_lock(id, second, Duration::seconds(60)).unwrap());
        clock.advance(Duration::seconds(61));
        assert!(store.try_acquire_slot_lock(id, second, Duration::seconds(60)).unwrap());
        assert!(!store.release_slot_lock(id, first).unwrap());
        assert!(store.release_slot_lock(id, second).unwrap());
    }

    #[test]
    fn active_count_tracks_slot_holding_states() {
        let (clock, store) = store();
        let a = voice(&store, &clock);
        let b = voice(&store, &clock);
        assert_eq!(store.count_active(Provider::ElevenLabs), 0);
        store.transition(a, AllocationStatus::Allocating, |_| {}).unwrap();
        store.transition(b, AllocationStatus::Allocating, |_| {}).unwrap();
        store.transition(b, AllocationStatus::Ready, |_| {}).unwrap();
        assert_eq!(store.count_active(Provider::ElevenLabs), 2);
        store
            .transition(b, AllocationStatus::Evicted, |v| {
                v.allocated_at = None;
            })
            .unwrap();
        assert_eq!(store.count_active(Provider::ElevenLabs), 1);
    }

    #[test]
    fn eviction_candidates_respect_warm_hold_and_locks() {
        let (clock, store) = store();
        let id = voice(&store, &clock);
        store.transition(id, AllocationStatus::Allocating, |_| {}).unwrap();
        let now = clock.now();
        store
            .transition(id, AllocationStatus::Ready, |v| {
                v.last_used_at = Some(now);
            })
            .unwrap();

        assert!(store.eviction_candidates(Provider::ElevenLabs, Duration::seconds(900)).is_empty());
        clock.advance(Duration::seconds(901));
        assert_eq!(
            store.eviction_candidates(Provider::ElevenLabs, Duration::seconds(900)).len(),
            1
        );

        // A live slot lock shields the voice.
        let owner = Uuid::new_v4();
        assert!(store.try_acquire_slot_lock(id, owner, Duration::seconds(60)).unwrap());
        assert!(store.eviction_candidates(Provider::ElevenLabs, Duration::seconds(900)).is_empty());
    }
}
