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

//! The persistence layer of the engine.
//!
//! All durable state is keyed off `(room, sender key, session id)` triples
//! or off the canonical key-request body, so unrelated rooms and sessions
//! never contend.

mod caches;
mod memorystore;

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, TransactionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

pub use caches::{GroupSessionStore, PendingDecryptionQueue, PendingEvent, SessionStore};
pub use memorystore::MemoryStore;

use crate::{
    gossiping::{OutgoingKeyRequest, RequestState},
    olm::{InboundGroupSession, Session},
    types::{
        deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key,
        serialize_ed25519_key, RoomKeyRequestBody,
    },
};

/// The error type for the storage layer.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// An error occurred in the store's backend.
    #[error("the store failed to perform an operation: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to serialize or deserialize a stored value.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// A `Result` alias for storage operations.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// A room key that arrived for a room we're not joined to.
///
/// Stored untouched until the join path takes it out, exactly once.
#[derive(Serialize, Deserialize)]
pub struct ParkedKey {
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,

    /// The user that sent us the key.
    pub sender_id: OwnedUserId,

    /// The Curve25519 key of the device that created the session.
    #[serde(
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// The unique ID of the session.
    pub session_id: String,

    /// The exported session key.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key the session creator claimed to own.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub claimed_ed25519_key: Ed25519PublicKey,

    /// The devices the session passed through before reaching us.
    pub forwarding_key_chain: Vec<String>,
}

impl Debug for ParkedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedKey")
            .field("room_id", &self.room_id)
            .field("sender_id", &self.sender_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("claimed_ed25519_key", &self.claimed_ed25519_key)
            .field("forwarding_key_chain", &self.forwarding_key_chain)
            .finish_non_exhaustive()
    }
}

/// The persistent storage collaborator of the engine.
///
/// Update and delete operations on key requests are compare-and-swap shaped
/// so that two racing state transitions can't both win.
#[async_trait]
pub trait CryptoStore: Send + Sync + Debug {
    /// Save the given pairwise Olm sessions.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// Get all Olm sessions we share with the device owning the given
    /// identity key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>>;

    /// Save the given inbound group sessions, replacing stored copies.
    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()>;

    /// Get the inbound group session with the given ID.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Store an outgoing key request. The request becomes findable both by
    /// its ID and by its canonical body.
    async fn save_key_request(&self, request: &OutgoingKeyRequest) -> Result<()>;

    /// Get the outgoing key request with the given request ID.
    async fn get_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingKeyRequest>>;

    /// Get the live outgoing key request for the given body, if one exists.
    async fn get_key_request_by_info(
        &self,
        body: &RoomKeyRequestBody,
    ) -> Result<Option<OutgoingKeyRequest>>;

    /// Get all outgoing key requests that are in the given state.
    async fn get_key_requests_by_state(
        &self,
        state: RequestState,
    ) -> Result<Vec<OutgoingKeyRequest>>;

    /// Replace the request with the given ID, provided it still is in the
    /// expected state. Returns whether the swap happened.
    async fn update_key_request(
        &self,
        request_id: &TransactionId,
        expected_state: RequestState,
        request: OutgoingKeyRequest,
    ) -> Result<bool>;

    /// Delete the request with the given ID, provided it still is in the
    /// expected state. Returns whether the request was deleted.
    async fn delete_key_request(
        &self,
        request_id: &TransactionId,
        expected_state: RequestState,
    ) -> Result<bool>;

    /// Park a room key for a room we're not joined to.
    async fn park_key(&self, key: ParkedKey) -> Result<()>;

    /// Take all parked keys for the given room out of the store.
    ///
    /// The keys are removed by this call, a second take returns nothing.
    async fn take_parked_keys(&self, room_id: &RoomId) -> Result<Vec<ParkedKey>>;
}
