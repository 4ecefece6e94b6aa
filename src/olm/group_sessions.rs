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
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use ruma::{OwnedRoomId, RoomId};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;
use vodozemac::{
    megolm::{
        DecryptionError, GroupSession, InboundGroupSession as InnerSession, MegolmMessage,
        SessionConfig, SessionKey, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    error::{MegolmResult, SessionCreationError},
    store::ParkedKey,
    types::{
        events::{EncryptedRoomEventContent, ForwardedRoomKeyContent, RoomKeyContent},
        EventEncryptionAlgorithm,
    },
};

/// An inbound Megolm session, the key material needed to decrypt messages of
/// one (room, sending device) pair.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,

    /// A copy of the ratchet's first known index, to avoid having to acquire
    /// the lock for it.
    first_known_index: u32,

    /// The room the session is used in.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,

    /// The Ed25519 key the creator claimed to own. Verified for directly
    /// shared keys, claimed-only for forwarded ones.
    pub signing_key: Ed25519PublicKey,

    /// The devices the session passed through before reaching us, oldest
    /// first. Empty for directly shared keys.
    pub forwarding_key_chain: Vec<String>,

    /// Whether the session was shared with past room history.
    pub shared_history: bool,

    /// Whether the provenance of the session is good enough to mark
    /// decrypted events as trusted. Upgradeable in place, never downgraded.
    trusted: Arc<AtomicBool>,
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .finish()
    }
}

impl InboundGroupSession {
    /// Create a session from a directly shared `m.room_key`.
    ///
    /// Direct shares travel over a verified Olm channel, so the resulting
    /// session is trusted.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        shared_history: bool,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id: Arc<str> = session.session_id().into();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id,
            first_known_index,
            room_id: room_id.to_owned(),
            sender_key,
            signing_key,
            forwarding_key_chain: Vec::new(),
            shared_history,
            trusted: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a session from an `m.forwarded_room_key`.
    ///
    /// The key of a forward is in export format and starts at whatever
    /// ratchet index the forwarder held. Whether it's trusted is decided by
    /// the caller, based on the forward's provenance.
    pub fn from_forwarded_key(
        sender_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
        forwarded_by: Curve25519PublicKey,
        trusted: bool,
    ) -> Result<Self, SessionCreationError> {
        let session = InnerSession::import(&content.session_key, SessionConfig::version_1());
        let session_id: Arc<str> = session.session_id().into();
        let first_known_index = session.first_known_index();

        let mut forwarding_key_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_key_chain.push(forwarded_by.to_base64());

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id,
            first_known_index,
            room_id: content.room_id.to_owned(),
            sender_key,
            signing_key: content.sender_claimed_ed25519_key,
            forwarding_key_chain,
            shared_history: content.shared_history,
            trusted: Arc::new(AtomicBool::new(trusted)),
        })
    }

    /// Restore a session from a parked key, taken out of the parking store
    /// on room join. Parked keys are never trusted.
    pub fn from_parked_key(parked: &ParkedKey) -> Self {
        let session = InnerSession::import(&parked.session_key, SessionConfig::version_1());
        let session_id: Arc<str> = session.session_id().into();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id,
            first_known_index,
            room_id: parked.room_id.to_owned(),
            sender_key: parked.sender_key,
            signing_key: parked.claimed_ed25519_key,
            forwarding_key_chain: parked.forwarding_key_chain.clone(),
            shared_history: true,
            trusted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The unique ID of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room this session encrypts events for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The Ed25519 key the session creator claimed to own.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// The devices the session passed through before reaching us. Empty for
    /// directly shared sessions.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_key_chain
    }

    /// The lowest message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Is the provenance of this session good enough to trust its
    /// plaintexts.
    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    /// Upgrade the session to trusted, in place. There is no way back down.
    pub fn mark_as_trusted(&self) {
        self.trusted.store(true, Ordering::SeqCst)
    }

    /// Check how this session's ratchet relates to another copy of the same
    /// session.
    ///
    /// [`SessionOrdering::Unconnected`] means the two copies don't share a
    /// ratchet even though they claim the same session ID, such a copy must
    /// never replace ours.
    pub async fn compare_ratchet(&self, other: &InboundGroupSession) -> SessionOrdering {
        // Same object, comparing would deadlock on the shared lock.
        if Arc::ptr_eq(&self.inner, &other.inner) {
            SessionOrdering::Equal
        } else if self.sender_key != other.sender_key
            || self.room_id != other.room_id
            || self.session_id != other.session_id
        {
            SessionOrdering::Unconnected
        } else {
            let mut other_inner = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other_inner)
        }
    }

    /// Replace our ratchet with the one of another copy of this session.
    ///
    /// Used when a copy with a lower first known index arrives, widening the
    /// range of decryptable messages.
    pub(crate) fn with_ratchet(mut self, other: &InboundGroupSession) -> Self {
        assert_eq!(
            self.session_id, other.session_id,
            "ratchets can only be swapped between copies of the same session"
        );

        self.inner = other.inner.clone();
        self.first_known_index = other.first_known_index;
        self
    }

    /// Decrypt a Megolm message, returning the plaintext and the message
    /// index it was encrypted at.
    pub async fn decrypt(&self, message: &MegolmMessage) -> MegolmResult<(String, u32)> {
        let decrypted = self.inner.lock().await.decrypt(message)?;

        Ok((
            String::from_utf8_lossy(&decrypted.plaintext).to_string(),
            decrypted.message_index,
        ))
    }

    /// Like [`InboundGroupSession::decrypt`], but reports an out-of-range
    /// message index as a missing key rather than a hard failure, so the
    /// caller can queue the event and request a wider key.
    pub async fn decrypt_or_request(
        &self,
        message: &MegolmMessage,
    ) -> MegolmResult<(String, u32)> {
        match self.decrypt(message).await {
            Err(crate::error::MegolmError::Decryption(DecryptionError::UnknownMessageIndex(
                ..,
            ))) => Err(crate::error::MegolmError::MissingRoomKey),
            result => result,
        }
    }
}

/// An outbound Megolm session, encrypting our own messages for one room.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    creation_time: Instant,
    message_count: Arc<AtomicU64>,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl OutboundGroupSession {
    /// Create a fresh outbound session for the given room, together with the
    /// `m.room_key` content that shares it and our own inbound copy.
    pub fn new(
        room_id: &RoomId,
        our_sender_key: Curve25519PublicKey,
        our_signing_key: Ed25519PublicKey,
        shared_history: bool,
    ) -> (Self, RoomKeyContent, InboundGroupSession) {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id: Arc<str> = session.session_id().into();
        let session_key = session.session_key();

        debug!(
            room_id = ?room_id,
            session_id = ?session_id,
            "Created a new outbound group session"
        );

        let inbound = InboundGroupSession::new(
            our_sender_key,
            our_signing_key,
            room_id,
            &session_key,
            shared_history,
        );

        let content = RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id.to_owned(),
            session_id: session_id.to_string(),
            session_key,
            shared_history,
        };

        let outbound = Self {
            inner: Arc::new(Mutex::new(session)),
            session_id,
            room_id: room_id.to_owned(),
            creation_time: Instant::now(),
            message_count: Arc::new(AtomicU64::new(0)),
        };

        (outbound, content, inbound)
    }

    /// The unique ID of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room this session encrypts for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Should the session be rotated before encrypting anything else.
    pub fn expired(&self, rotation_period: Duration, rotation_period_msgs: u64) -> bool {
        self.creation_time.elapsed() >= rotation_period
            || self.message_count.load(Ordering::SeqCst) >= rotation_period_msgs
    }

    /// Encrypt an event payload for the room this session belongs to.
    pub async fn encrypt(
        &self,
        event_type: &str,
        content: &Value,
    ) -> EncryptedRoomEventContent {
        let payload = json!({
            "room_id": self.room_id,
            "type": event_type,
            "content": content,
        });

        let payload = serde_json::to_string(&payload)
            .expect("a JSON value can always be serialized to a string");

        let ciphertext = self.inner.lock().await.encrypt(&payload);
        self.message_count.fetch_add(1, Ordering::SeqCst);

        EncryptedRoomEventContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            ciphertext,
            session_id: self.session_id.to_string(),
            sender_key: None,
            device_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::room_id;
    use serde_json::json;
    use vodozemac::{megolm::SessionOrdering, olm::Account};

    use super::OutboundGroupSession;

    fn session_pair() -> (OutboundGroupSession, super::InboundGroupSession) {
        let account = Account::new();
        let (outbound, _, inbound) = OutboundGroupSession::new(
            room_id!("!test:localhost"),
            account.curve25519_key(),
            account.ed25519_key(),
            false,
        );

        (outbound, inbound)
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let (outbound, inbound) = session_pair();

        let content = outbound
            .encrypt("m.room.message", &json!({ "body": "hello" }))
            .await;

        assert_eq!(content.session_id, inbound.session_id());

        let (plaintext, index) = inbound.decrypt(&content.ciphertext).await.unwrap();
        assert_eq!(index, 0);

        let payload: serde_json::Value = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(payload["content"]["body"], "hello");
    }

    #[tokio::test]
    async fn rotation_by_message_count() {
        let (outbound, _) = session_pair();

        assert!(!outbound.expired(Duration::from_secs(3600), 1));
        outbound.encrypt("m.room.message", &json!({})).await;
        assert!(outbound.expired(Duration::from_secs(3600), 1));
    }

    #[tokio::test]
    async fn trust_upgrade_is_shared_between_clones() {
        let (_, inbound) = session_pair();
        let clone = inbound.clone();

        assert!(inbound.is_trusted());

        // A direct share starts trusted, so exercise the flag through a
        // fresh atomic.
        let parked_like = super::InboundGroupSession {
            trusted: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            ..clone
        };
        let view = parked_like.clone();

        assert!(!view.is_trusted());
        parked_like.mark_as_trusted();
        assert!(view.is_trusted());
    }

    #[tokio::test]
    async fn unrelated_sessions_are_unconnected() {
        let (_, first) = session_pair();
        let (_, second) = session_pair();

        assert_eq!(
            first.compare_ratchet(&second).await,
            SessionOrdering::Unconnected
        );
        assert_eq!(first.compare_ratchet(&first).await, SessionOrdering::Equal);
    }
}
