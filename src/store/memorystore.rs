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

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock as StdRwLock,
};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedTransactionId, RoomId, TransactionId};

use super::{
    caches::{GroupSessionStore, SessionStore},
    CryptoStore, ParkedKey, Result,
};
use crate::{
    gossiping::{OutgoingKeyRequest, RequestState},
    olm::{InboundGroupSession, Session},
    types::RoomKeyRequestBody,
};

/// A [`CryptoStore`] that keeps everything in memory.
///
/// The default store, also the fixture every test runs against.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,

    key_requests: StdRwLock<HashMap<OwnedTransactionId, OutgoingKeyRequest>>,
    /// Secondary index over the canonical body key, so duplicate bodies
    /// always collide.
    key_requests_by_info: StdRwLock<HashMap<String, OwnedTransactionId>>,

    parked_keys: StdRwLock<BTreeMap<OwnedRoomId, Vec<ParkedKey>>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        for session in sessions {
            self.sessions.add(session.clone());
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>> {
        Ok(self.sessions.get(sender_key))
    }

    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()> {
        for session in sessions {
            self.inbound_group_sessions.add(session.clone());
        }

        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(room_id, session_id))
    }

    async fn save_key_request(&self, request: &OutgoingKeyRequest) -> Result<()> {
        self.key_requests_by_info
            .write()
            .unwrap()
            .insert(request.body.as_key(), request.request_id.clone());
        self.key_requests
            .write()
            .unwrap()
            .insert(request.request_id.clone(), request.clone());

        Ok(())
    }

    async fn get_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingKeyRequest>> {
        Ok(self.key_requests.read().unwrap().get(request_id).cloned())
    }

    async fn get_key_request_by_info(
        &self,
        body: &RoomKeyRequestBody,
    ) -> Result<Option<OutgoingKeyRequest>> {
        let id = self
            .key_requests_by_info
            .read()
            .unwrap()
            .get(&body.as_key())
            .cloned();

        Ok(id.and_then(|id| self.key_requests.read().unwrap().get(&id).cloned()))
    }

    async fn get_key_requests_by_state(
        &self,
        state: RequestState,
    ) -> Result<Vec<OutgoingKeyRequest>> {
        Ok(self
            .key_requests
            .read()
            .unwrap()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }

    async fn update_key_request(
        &self,
        request_id: &TransactionId,
        expected_state: RequestState,
        request: OutgoingKeyRequest,
    ) -> Result<bool> {
        let mut requests = self.key_requests.write().unwrap();

        let Some(existing) = requests.get(request_id) else {
            return Ok(false);
        };

        if existing.state != expected_state {
            return Ok(false);
        }

        let mut by_info = self.key_requests_by_info.write().unwrap();

        // A resend rotates the request ID while the body stays put.
        if request.request_id != request_id {
            requests.remove(request_id);
        }
        by_info.insert(request.body.as_key(), request.request_id.clone());
        requests.insert(request.request_id.clone(), request);

        Ok(true)
    }

    async fn delete_key_request(
        &self,
        request_id: &TransactionId,
        expected_state: RequestState,
    ) -> Result<bool> {
        let mut requests = self.key_requests.write().unwrap();

        let Some(existing) = requests.get(request_id) else {
            return Ok(false);
        };

        if existing.state != expected_state {
            return Ok(false);
        }

        let info_key = existing.body.as_key();
        requests.remove(request_id);
        self.key_requests_by_info.write().unwrap().remove(&info_key);

        Ok(true)
    }

    async fn park_key(&self, key: ParkedKey) -> Result<()> {
        self.parked_keys
            .write()
            .unwrap()
            .entry(key.room_id.to_owned())
            .or_default()
            .push(key);

        Ok(())
    }

    async fn take_parked_keys(&self, room_id: &RoomId) -> Result<Vec<ParkedKey>> {
        Ok(self
            .parked_keys
            .write()
            .unwrap()
            .remove(room_id)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id, TransactionId};
    use vodozemac::{megolm::GroupSession, olm::Account};

    use super::MemoryStore;
    use crate::{
        gossiping::{OutgoingKeyRequest, RequestState},
        store::{CryptoStore, ParkedKey},
        types::{EventEncryptionAlgorithm, RoomKeyRequestBody},
    };

    fn request_body() -> RoomKeyRequestBody {
        RoomKeyRequestBody {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id!("!test:localhost").to_owned(),
            sender_key: Account::new().curve25519_key(),
            session_id: "SESSION_ID".to_owned(),
        }
    }

    #[tokio::test]
    async fn requests_collide_on_their_body() {
        let store = MemoryStore::new();
        let body = request_body();

        let request = OutgoingKeyRequest {
            request_id: TransactionId::new(),
            body: body.clone(),
            recipients: vec![user_id!("@alice:localhost").to_owned()],
            state: RequestState::Unsent,
        };

        store.save_key_request(&request).await.unwrap();

        let found = store.get_key_request_by_info(&body).await.unwrap().unwrap();
        assert_eq!(found.request_id, request.request_id);

        // A rotated request ID still resolves through the same body.
        let mut rotated = request.clone();
        rotated.request_id = TransactionId::new();
        rotated.state = RequestState::Unsent;

        assert!(store
            .update_key_request(&request.request_id, RequestState::Unsent, rotated.clone())
            .await
            .unwrap());

        let found = store.get_key_request_by_info(&body).await.unwrap().unwrap();
        assert_eq!(found.request_id, rotated.request_id);
        assert!(store
            .get_key_request(&request.request_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_state() {
        let store = MemoryStore::new();

        let request = OutgoingKeyRequest {
            request_id: TransactionId::new(),
            body: request_body(),
            recipients: vec![user_id!("@alice:localhost").to_owned()],
            state: RequestState::Sent,
        };
        store.save_key_request(&request).await.unwrap();

        assert!(!store
            .delete_key_request(&request.request_id, RequestState::Unsent)
            .await
            .unwrap());
        assert!(store
            .delete_key_request(&request.request_id, RequestState::Sent)
            .await
            .unwrap());
        assert!(store
            .get_key_request_by_info(&request.body)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn parked_keys_are_taken_exactly_once() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");

        let exported = {
            let session = GroupSession::new(Default::default());
            let mut inbound = vodozemac::megolm::InboundGroupSession::new(
                &session.session_key(),
                Default::default(),
            );
            inbound.export_at(0).unwrap()
        };

        store
            .park_key(ParkedKey {
                room_id: room_id.to_owned(),
                sender_id: user_id!("@alice:localhost").to_owned(),
                sender_key: Account::new().curve25519_key(),
                session_id: "SESSION_ID".to_owned(),
                session_key: exported,
                claimed_ed25519_key: Account::new().ed25519_key(),
                forwarding_key_chain: vec![],
            })
            .await
            .unwrap();

        let taken = store.take_parked_keys(room_id).await.unwrap();
        assert_eq!(taken.len(), 1);

        let again = store.take_parked_keys(room_id).await.unwrap();
        assert!(again.is_empty());
    }
}
