// Copyright 2026 The megolm-engine contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory stores for the various session types and the queue of events
//! waiting for a key.

use std::{
    collections::BTreeMap,
    sync::RwLock as StdRwLock,
};

use ruma::{OwnedRoomId, RoomId};
use tracing::trace;

use crate::{
    olm::{InboundGroupSession, OutboundGroupSession, Session},
    types::events::EncryptedEvent,
};

/// An in-memory store for our pairwise Olm sessions, keyed by the identity
/// key of the remote device.
#[derive(Debug, Default)]
pub struct SessionStore {
    entries: StdRwLock<BTreeMap<String, Vec<Session>>>,
}

impl SessionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the store, replacing any stored copy with the same
    /// session ID.
    pub fn add(&self, session: Session) {
        let mut entries = self.entries.write().unwrap();
        let sessions = entries.entry(session.sender_key.to_base64()).or_default();

        if let Some(existing) = sessions
            .iter_mut()
            .find(|s| s.session_id() == session.session_id())
        {
            *existing = session;
        } else {
            sessions.push(session);
        }
    }

    /// Get all sessions we share with the device owning the given identity
    /// key.
    pub fn get(&self, sender_key: &str) -> Vec<Session> {
        self.entries
            .read()
            .unwrap()
            .get(sender_key)
            .cloned()
            .unwrap_or_default()
    }
}

/// An in-memory store for Megolm sessions.
///
/// Inbound sessions are keyed by room and session ID, outbound ones by the
/// room they encrypt for.
#[derive(Debug, Default)]
pub struct GroupSessionStore {
    inbound: StdRwLock<BTreeMap<OwnedRoomId, BTreeMap<String, InboundGroupSession>>>,
    outbound: StdRwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>,
}

impl GroupSessionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session, replacing any stored copy.
    pub fn add(&self, session: InboundGroupSession) {
        self.inbound
            .write()
            .unwrap()
            .entry(session.room_id.to_owned())
            .or_default()
            .insert(session.session_id().to_owned(), session);
    }

    /// Get the inbound group session with the given ID.
    pub fn get(&self, room_id: &RoomId, session_id: &str) -> Option<InboundGroupSession> {
        self.inbound
            .read()
            .unwrap()
            .get(room_id)?
            .get(session_id)
            .cloned()
    }

    /// Get the outbound group session for the given room, if one exists.
    pub fn get_outbound(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.outbound.read().unwrap().get(room_id).cloned()
    }

    /// Install the outbound group session for the given room, replacing the
    /// previous one.
    pub fn insert_outbound(&self, session: OutboundGroupSession) {
        self.outbound
            .write()
            .unwrap()
            .insert(session.room_id().to_owned(), session);
    }
}

/// An event waiting in the [`PendingDecryptionQueue`] for its room key.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    /// The undecryptable event itself.
    pub event: EncryptedEvent,

    /// The Megolm message index the event was encrypted at. A session can
    /// only decrypt the event if its first known index is at or below this.
    pub needed_index: u32,
}

/// Events that failed to decrypt because their room key is missing, waiting
/// to be replayed once it arrives.
///
/// Buckets are keyed by the claimed sender key and session ID of the
/// undecryptable event. Purely in-memory, a restart simply re-queues events
/// as they fail again.
#[derive(Debug, Default)]
pub struct PendingDecryptionQueue {
    buckets: StdRwLock<BTreeMap<(String, String), Vec<PendingEvent>>>,
}

impl PendingDecryptionQueue {
    /// Create a new, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the queue. Re-adding an event that is already
    /// waiting is a no-op.
    pub fn add(&self, sender_key: &str, session_id: &str, pending: PendingEvent) {
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets
            .entry((sender_key.to_owned(), session_id.to_owned()))
            .or_default();

        if bucket
            .iter()
            .any(|p| p.event.event_id == pending.event.event_id)
        {
            return;
        }

        trace!(
            session_id,
            event_id = ?pending.event.event_id,
            "Queued an undecryptable event until its room key arrives"
        );

        bucket.push(pending);
    }

    /// Take out every waiting event that a session starting at the given
    /// index can decrypt. The bucket is dropped once it's empty.
    pub fn take_ready(
        &self,
        sender_key: &str,
        session_id: &str,
        first_known_index: u32,
    ) -> Vec<PendingEvent> {
        let mut buckets = self.buckets.write().unwrap();
        let key = (sender_key.to_owned(), session_id.to_owned());

        let Some(bucket) = buckets.get_mut(&key) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        bucket.retain(|pending| {
            if pending.needed_index >= first_known_index {
                ready.push(pending.clone());
                false
            } else {
                true
            }
        });

        if bucket.is_empty() {
            buckets.remove(&key);
        }

        ready
    }

    /// Is any event still waiting for the given session.
    pub fn has_waiters(&self, sender_key: &str, session_id: &str) -> bool {
        self.buckets
            .read()
            .unwrap()
            .contains_key(&(sender_key.to_owned(), session_id.to_owned()))
    }
}
