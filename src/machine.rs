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

//! The state machine tying the engine together.
//!
//! An [`EncryptionMachine`] owns the device's Olm account, routes incoming
//! to-device events, decrypts and encrypts room events, and drives the key
//! request lifecycle. The embedding client feeds it events and collaborator
//! implementations, and listens on [`EncryptionMachine::subscribe`] for
//! decryption results that arrive out of band.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId,
    UserId,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};
use vodozemac::{megolm::SessionOrdering, Curve25519PublicKey, Ed25519PublicKey};
use zeroize::Zeroizing;

use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    gossiping::KeyRequestMachine,
    identities::{Device, DeviceDirectory, Membership, RoomStateProvider},
    olm::{Account, InboundGroupSession, OutboundGroupSession},
    secret_storage::{with_new_secret_storage_key, SecretStorageKey},
    session_manager::PairwiseSessionManager,
    store::{CryptoStore, GroupSessionStore, ParkedKey, PendingDecryptionQueue, PendingEvent},
    transport::{ToDeviceRequest, Transport},
    types::{
        events::{
            DecryptedOlmEvent, DummyEventContent, EncryptedEvent, EncryptedRoomEventContent,
            EncryptedToDeviceEvent, EncryptedToDeviceEventContent, EventType,
            ForwardedRoomKeyContent, RoomKeyContent,
        },
        EventEncryptionAlgorithm, RoomKeyRequestBody,
    },
};

/// Tunables of the engine.
#[derive(Clone, Debug)]
pub struct EncryptionSettings {
    /// How long an outbound group session may be used before it's rotated.
    pub rotation_period: Duration,

    /// How many messages an outbound group session may encrypt before it's
    /// rotated.
    pub rotation_period_msgs: u64,

    /// The minimum time between two repair attempts for the same wedged
    /// Olm channel.
    pub repair_interval: Duration,

    /// Whether our outbound sessions may be re-shared with users that join
    /// the room later.
    pub shared_history: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            rotation_period: Duration::from_secs(7 * 24 * 3600),
            rotation_period_msgs: 100,
            repair_interval: Duration::from_secs(3600),
            shared_history: false,
        }
    }
}

/// A successfully decrypted room event.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The decrypted event payload.
    pub event: Value,

    /// The ID of the event.
    pub event_id: OwnedEventId,

    /// The room the event was sent in.
    pub room_id: OwnedRoomId,

    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The Curve25519 key of the device that created the session the event
    /// was encrypted with.
    pub sender_key: Option<Curve25519PublicKey>,

    /// The Ed25519 key the session creator claimed to own.
    pub claimed_ed25519_key: Option<Ed25519PublicKey>,

    /// The devices the session passed through before reaching us.
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// Whether the session the event was decrypted with is trusted.
    pub trusted: bool,

    /// The unsigned data of the event, passed through untouched.
    pub unsigned: Option<Value>,
}

/// Updates the engine pushes to its subscribers.
#[derive(Clone, Debug)]
pub enum RoomKeyUpdate {
    /// An event was decrypted. Emitted once per event, in decrypt order.
    Decrypted(DecryptedRoomEvent),

    /// A session we already used was upgraded from untrusted to trusted.
    ///
    /// Events that were previously decrypted with the untrusted copy are
    /// listed so the client can re-mark them.
    TrustUpgraded {
        /// The room of the upgraded session.
        room_id: OwnedRoomId,

        /// The ID of the upgraded session.
        session_id: String,

        /// The events that were decrypted while the session was still
        /// untrusted.
        event_ids: Vec<OwnedEventId>,
    },
}

/// What to do with a forwarded room key, given its provenance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyDecision {
    /// Install the key, with the given trust level.
    Accept { trusted: bool },

    /// Store the key untouched until we join the room.
    Park,

    /// Drop the key, we never asked for it and the sender didn't invite us.
    Reject,
}

/// Decide what to do with a forwarded room key.
///
/// Forwards that don't name the session creator are malformed and dropped
/// before this is consulted. The checks are ordered: parking wins over
/// everything else, a key we asked one of our own devices for wins over the
/// inviter path, and the inviter path never yields a trusted key.
fn evaluate_forward(
    membership: Membership,
    requested_from_sender: bool,
    sender_device_verified: bool,
    sender_is_inviter: bool,
) -> KeyDecision {
    if membership != Membership::Joined {
        KeyDecision::Park
    } else if requested_from_sender {
        KeyDecision::Accept {
            trusted: sender_device_verified,
        }
    } else if sender_is_inviter {
        KeyDecision::Accept { trusted: false }
    } else {
        KeyDecision::Reject
    }
}

/// The top-level state machine of the engine.
pub struct EncryptionMachine {
    account: Arc<Account>,
    store: Arc<dyn CryptoStore>,
    transport: Arc<dyn Transport>,
    room_state: Arc<dyn RoomStateProvider>,
    devices: Arc<dyn DeviceDirectory>,
    sessions: PairwiseSessionManager,
    key_requests: KeyRequestMachine,
    outbound_sessions: GroupSessionStore,
    pending: PendingDecryptionQueue,
    /// Events we decrypted with a session that wasn't trusted at the time,
    /// keyed by (sender key, session ID).
    untrusted_decryptions: StdMutex<BTreeMap<(String, String), Vec<OwnedEventId>>>,
    listeners: StdMutex<Vec<UnboundedSender<RoomKeyUpdate>>>,
    settings: EncryptionSettings,
}

impl fmt::Debug for EncryptionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionMachine")
            .field("user_id", &self.account.user_id())
            .field("device_id", &self.account.device_id())
            .finish_non_exhaustive()
    }
}

impl EncryptionMachine {
    /// Create a new machine with a fresh Olm account.
    pub fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<dyn CryptoStore>,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn DeviceDirectory>,
        room_state: Arc<dyn RoomStateProvider>,
        settings: EncryptionSettings,
    ) -> Self {
        let account = Arc::new(Account::new(user_id, device_id));

        let sessions = PairwiseSessionManager::new(
            account.clone(),
            store.clone(),
            transport.clone(),
            devices.clone(),
            settings.repair_interval,
        );

        let key_requests = KeyRequestMachine::new(
            user_id.to_owned(),
            device_id.to_owned(),
            store.clone(),
            transport.clone(),
        );

        Self {
            account,
            store,
            transport,
            room_state,
            devices,
            sessions,
            key_requests,
            outbound_sessions: GroupSessionStore::new(),
            pending: PendingDecryptionQueue::new(),
            untrusted_decryptions: StdMutex::new(BTreeMap::new()),
            listeners: StdMutex::new(Vec::new()),
            settings,
        }
    }

    /// The user this machine belongs to.
    pub fn user_id(&self) -> &UserId {
        self.account.user_id()
    }

    /// The device this machine belongs to.
    pub fn device_id(&self) -> &DeviceId {
        self.account.device_id()
    }

    /// Subscribe to the updates the machine produces while it processes
    /// events, one channel per subscriber.
    pub fn subscribe(&self) -> UnboundedReceiver<RoomKeyUpdate> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(sender);
        receiver
    }

    fn emit(&self, update: RoomKeyUpdate) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|listener| listener.send(update.clone()).is_ok());
    }

    /// Send out every key request and cancellation that is waiting to go
    /// out. Cancellations are always flushed before their replacements.
    pub async fn send_outgoing_requests(&self) -> OlmResult<()> {
        self.key_requests.send_outgoing_requests().await
    }

    /// Cancel the key request for the session of the given undecryptable
    /// event and queue a fresh request for the same key under a new request
    /// ID.
    ///
    /// For when the user gives up on waiting and hits "retry". A no-op if
    /// no request for the session exists.
    pub async fn cancel_and_resend_room_key_request(
        &self,
        event: &EncryptedEvent,
    ) -> OlmResult<()> {
        let Some(sender_key) = event.content.sender_key else {
            warn!(
                event_id = ?event.event_id,
                session_id = event.content.session_id,
                "Can't re-request the room key for an event that doesn't name a sender key"
            );
            return Ok(());
        };

        let body = RoomKeyRequestBody {
            algorithm: event.content.algorithm.clone(),
            room_id: event.room_id.clone(),
            sender_key,
            session_id: event.content.session_id.clone(),
        };

        self.key_requests.cancel_and_resend(&body).await
    }

    /// Run a closure with a freshly generated secret-storage key. The
    /// private key material is wiped when the closure returns.
    pub fn bootstrap_secret_storage<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SecretStorageKey) -> R,
    {
        with_new_secret_storage_key(f)
    }

    /// Check whether the given private key is the counterpart of the given
    /// public secret-storage key. The private bytes are wiped before this
    /// returns.
    pub fn check_secret_storage_private_key(
        &self,
        private_key: Zeroizing<[u8; 32]>,
        expected: &Curve25519PublicKey,
    ) -> bool {
        SecretStorageKey::from_private_key(private_key).matches(expected)
    }

    /// Handle an encrypted to-device event.
    ///
    /// Decrypts the event over the pairwise Olm channel and routes the
    /// plaintext to the room key handlers. A message we can't decrypt means
    /// the channel is wedged; a repair is kicked off and `None` is returned
    /// rather than a hard failure.
    pub async fn receive_encrypted_to_device(
        &self,
        event: &EncryptedToDeviceEvent,
    ) -> OlmResult<Option<DecryptedOlmEvent>> {
        let decrypted = match self.sessions.decrypt_to_device_event(event).await {
            Ok(decrypted) => decrypted,
            Err(OlmError::SessionWedged(user_id, sender_key)) => {
                self.handle_wedged_session(&user_id, sender_key).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match decrypted.event_type.as_str() {
            RoomKeyContent::EVENT_TYPE => {
                let content: RoomKeyContent = serde_json::from_value(decrypted.content.clone())?;
                self.receive_room_key(event.content.sender_key, decrypted.keys.ed25519, content)
                    .await?;
            }
            ForwardedRoomKeyContent::EVENT_TYPE => {
                let content: ForwardedRoomKeyContent =
                    serde_json::from_value(decrypted.content.clone())?;
                self.receive_forwarded_room_key(&decrypted.sender, event.content.sender_key, content)
                    .await?;
            }
            DummyEventContent::EVENT_TYPE => {
                debug!(
                    sender = ?decrypted.sender,
                    "Received an m.dummy, the Olm channel is established"
                );
            }
            event_type => {
                trace!(event_type, "Received a to-device event we don't handle");
            }
        }

        Ok(Some(decrypted))
    }

    /// A to-device message couldn't be decrypted: repair the channel and,
    /// if a fresh session was established, resend the key requests the
    /// other side may have missed.
    async fn handle_wedged_session(
        &self,
        user_id: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> OlmResult<()> {
        warn!(
            ?user_id,
            ?sender_key,
            "Failed to decrypt a to-device message, the Olm channel is wedged"
        );

        if self.sessions.repair_wedged_session(user_id, sender_key).await? {
            self.key_requests.cancel_and_resend_for_target(user_id).await?;
        }

        Ok(())
    }

    /// Handle a directly shared `m.room_key`.
    ///
    /// Direct shares arrive over the sender's own Olm channel, so the
    /// resulting session is trusted.
    pub async fn receive_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: RoomKeyContent,
    ) -> OlmResult<()> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = ?content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(());
        }

        let session = InboundGroupSession::new(
            sender_key,
            signing_key,
            &content.room_id,
            &content.session_key,
            content.shared_history,
        );

        self.admit_session(session).await
    }

    /// Handle an `m.forwarded_room_key`.
    ///
    /// The key is installed, parked, or dropped depending on who forwarded
    /// it and whether we asked for it.
    pub async fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        forwarded_by: Curve25519PublicKey,
        content: ForwardedRoomKeyContent,
    ) -> OlmResult<()> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = ?content.algorithm,
                "Received a forwarded room key with an unsupported algorithm"
            );
            return Ok(());
        }

        let Some(creator_key) = content.sender_key else {
            warn!(
                room_id = ?content.room_id,
                session_id = content.session_id,
                "Dropping a forwarded room key that doesn't name the session creator"
            );
            return Ok(());
        };

        let body = RoomKeyRequestBody {
            algorithm: content.algorithm.clone(),
            room_id: content.room_id.clone(),
            sender_key: creator_key,
            session_id: content.session_id.clone(),
        };

        let membership = self.room_state.own_membership(&content.room_id).await;
        let requested_from_sender =
            self.key_requests.outstanding_request_to(&body, sender).await?;
        let sender_device_verified = self
            .devices
            .get_device_by_curve_key(sender, forwarded_by)
            .await
            .map(|d| d.is_verified())
            .unwrap_or(false);
        let sender_is_inviter =
            self.room_state.inviter(&content.room_id).await.as_deref() == Some(sender);

        match evaluate_forward(
            membership,
            requested_from_sender,
            sender_device_verified,
            sender_is_inviter,
        ) {
            KeyDecision::Accept { trusted } => {
                let session = InboundGroupSession::from_forwarded_key(
                    creator_key,
                    &content,
                    forwarded_by,
                    trusted,
                )?;
                self.admit_session(session).await
            }
            KeyDecision::Park => {
                info!(
                    room_id = ?content.room_id,
                    session_id = content.session_id,
                    "Parking a room key for a room we're not joined to"
                );

                self.store
                    .park_key(ParkedKey {
                        room_id: content.room_id,
                        sender_id: sender.to_owned(),
                        sender_key: creator_key,
                        session_id: content.session_id,
                        session_key: content.session_key,
                        claimed_ed25519_key: content.sender_claimed_ed25519_key,
                        forwarding_key_chain: content.forwarding_curve25519_key_chain,
                    })
                    .await?;

                Ok(())
            }
            KeyDecision::Reject => {
                warn!(
                    ?sender,
                    room_id = ?content.room_id,
                    session_id = content.session_id,
                    "Dropping a room key forwarded by a device we never asked"
                );
                Ok(())
            }
        }
    }

    /// We joined a room: replay the keys that were parked for it.
    ///
    /// Only keys sent by the user that invited us are admitted, and only as
    /// untrusted. Parked keys are consumed exactly once, whatever isn't
    /// admitted here is gone.
    pub async fn receive_room_join(&self, room_id: &RoomId) -> OlmResult<()> {
        let parked = self.store.take_parked_keys(room_id).await?;

        if parked.is_empty() {
            return Ok(());
        }

        let inviter = self.room_state.inviter(room_id).await;

        for key in parked {
            if Some(&key.sender_id) != inviter.as_ref() {
                warn!(
                    ?room_id,
                    session_id = key.session_id,
                    sender = ?key.sender_id,
                    "Dropping a parked key that wasn't sent by our inviter"
                );
                continue;
            }

            let session = InboundGroupSession::from_parked_key(&key);
            self.admit_session(session).await?;
        }

        Ok(())
    }

    /// Install a freshly received inbound group session, merging it with
    /// any copy we already hold, then replay the events that were waiting
    /// for it.
    async fn admit_session(&self, session: InboundGroupSession) -> OlmResult<()> {
        let sender_key = session.sender_key();
        let session_id = session.session_id().to_owned();
        let room_id = session.room_id().to_owned();

        let existing = self
            .store
            .get_inbound_group_session(&room_id, &session_id)
            .await?;

        let (merged, newly_trusted) = match existing {
            None => {
                debug!(?room_id, session_id, "Installed a new inbound group session");
                (session, false)
            }
            Some(existing) => match session.compare_ratchet(&existing).await {
                SessionOrdering::Unconnected => {
                    warn!(
                        ?room_id,
                        session_id,
                        "Ignoring a room key that isn't connected to the session we already have"
                    );
                    return Ok(());
                }
                SessionOrdering::Better => {
                    debug!(
                        ?room_id,
                        session_id,
                        "A better copy of a known session arrived, adopting its ratchet"
                    );
                    let newly_trusted = session.is_trusted() && !existing.is_trusted();
                    (existing.with_ratchet(&session), newly_trusted)
                }
                SessionOrdering::Equal | SessionOrdering::Worse => {
                    let newly_trusted = session.is_trusted() && !existing.is_trusted();
                    (existing, newly_trusted)
                }
            },
        };

        if newly_trusted {
            merged.mark_as_trusted();
        }

        self.store
            .save_inbound_group_sessions(&[merged.clone()])
            .await?;

        if newly_trusted {
            let event_ids = self
                .untrusted_decryptions
                .lock()
                .unwrap()
                .remove(&(sender_key.to_base64(), session_id.clone()))
                .unwrap_or_default();

            info!(
                ?room_id,
                session_id, "A trusted copy of an untrusted session arrived"
            );

            self.emit(RoomKeyUpdate::TrustUpgraded {
                room_id: room_id.clone(),
                session_id: session_id.clone(),
                event_ids,
            });
        }

        let ready = self.pending.take_ready(
            &sender_key.to_base64(),
            &session_id,
            merged.first_known_index(),
        );

        for waiting in ready {
            if let Err(e) = self.decrypt_room_event(&waiting.event).await {
                warn!(
                    event_id = ?waiting.event.event_id,
                    error = ?e,
                    "Replaying a queued event with a fresh room key failed"
                );
            }
        }

        self.maybe_retire_request(&merged).await;

        Ok(())
    }

    /// Drop the outgoing request for a session once nothing is waiting on
    /// it anymore and the session is trusted.
    async fn maybe_retire_request(&self, session: &InboundGroupSession) {
        if !session.is_trusted() {
            return;
        }

        let sender_key = session.sender_key();
        if self
            .pending
            .has_waiters(&sender_key.to_base64(), session.session_id())
        {
            return;
        }

        let body = RoomKeyRequestBody {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: session.room_id().to_owned(),
            sender_key,
            session_id: session.session_id().to_owned(),
        };

        if let Err(e) = self.key_requests.cancel_request(&body).await {
            warn!(
                session_id = session.session_id(),
                error = ?e,
                "Failed to retire the key request for a fulfilled session"
            );
        }
    }

    /// Decrypt an `m.room.encrypted` room event.
    ///
    /// A redacted event is not a failure: its content is gone by design and
    /// the redaction is passed through untouched. A missing room key queues
    /// the event and sends out a key request; the event is retried and
    /// surfaced through [`EncryptionMachine::subscribe`] once the key
    /// arrives.
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        if event.redacted_because().is_some() {
            let decrypted = DecryptedRoomEvent {
                event: json!({
                    "room_id": event.room_id,
                    "type": "m.room.message",
                    "content": {},
                }),
                event_id: event.event_id.clone(),
                room_id: event.room_id.clone(),
                sender: event.sender.clone(),
                sender_key: None,
                claimed_ed25519_key: None,
                forwarding_curve25519_key_chain: Vec::new(),
                trusted: true,
                unsigned: event.unsigned.clone(),
            };

            self.emit(RoomKeyUpdate::Decrypted(decrypted.clone()));
            return Ok(decrypted);
        }

        if event.content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let session = self
            .store
            .get_inbound_group_session(&event.room_id, &event.content.session_id)
            .await?;

        let Some(session) = session else {
            debug!(
                room_id = ?event.room_id,
                session_id = event.content.session_id,
                "Failed to decrypt an event, the room key is missing"
            );
            self.queue_and_request(event, event.content.sender_key).await;
            return Err(MegolmError::MissingRoomKey);
        };

        let (plaintext, message_index) =
            match session.decrypt_or_request(&event.content.ciphertext).await {
                Ok(decrypted) => decrypted,
                Err(MegolmError::MissingRoomKey) => {
                    debug!(
                        room_id = ?event.room_id,
                        session_id = event.content.session_id,
                        "Failed to decrypt an event, our copy of the room key starts too late"
                    );
                    self.queue_and_request(
                        event,
                        event.content.sender_key.or(Some(session.sender_key())),
                    )
                    .await;
                    return Err(MegolmError::MissingRoomKey);
                }
                Err(e) => return Err(e),
            };

        let payload: Value = serde_json::from_str(&plaintext)?;

        let payload_room = payload.get("room_id").and_then(Value::as_str);
        if payload_room != Some(event.room_id.as_str()) {
            return Err(EventError::MismatchedRoom(
                event.room_id.clone(),
                payload_room.and_then(|r| RoomId::parse(r).ok()),
            )
            .into());
        }

        let trusted = session.is_trusted();

        trace!(
            room_id = ?event.room_id,
            session_id = event.content.session_id,
            message_index,
            trusted,
            "Decrypted a room event"
        );

        if trusted {
            self.maybe_retire_request(&session).await;
        } else {
            self.untrusted_decryptions
                .lock()
                .unwrap()
                .entry((
                    session.sender_key().to_base64(),
                    session.session_id().to_owned(),
                ))
                .or_default()
                .push(event.event_id.clone());
        }

        let decrypted = DecryptedRoomEvent {
            event: payload,
            event_id: event.event_id.clone(),
            room_id: event.room_id.clone(),
            sender: event.sender.clone(),
            sender_key: Some(session.sender_key()),
            claimed_ed25519_key: Some(session.signing_key()),
            forwarding_curve25519_key_chain: session.forwarding_key_chain().to_vec(),
            trusted,
            unsigned: event.unsigned.clone(),
        };

        self.emit(RoomKeyUpdate::Decrypted(decrypted.clone()));

        Ok(decrypted)
    }

    /// Queue an undecryptable event and make sure a key request for its
    /// session is on its way out.
    async fn queue_and_request(
        &self,
        event: &EncryptedEvent,
        sender_key: Option<Curve25519PublicKey>,
    ) {
        let Some(sender_key) = sender_key else {
            warn!(
                event_id = ?event.event_id,
                session_id = event.content.session_id,
                "Can't request the room key for an event that doesn't name a sender key"
            );
            return;
        };

        self.pending.add(
            &sender_key.to_base64(),
            &event.content.session_id,
            PendingEvent {
                event: event.clone(),
                needed_index: event.content.ciphertext.message_index(),
            },
        );

        let body = RoomKeyRequestBody {
            algorithm: event.content.algorithm.clone(),
            room_id: event.room_id.clone(),
            sender_key,
            session_id: event.content.session_id.clone(),
        };

        if let Err(e) = self.key_requests.ensure_request(body).await {
            warn!(
                session_id = event.content.session_id,
                error = ?e,
                "Failed to store an outgoing key request"
            );
        }
    }

    /// Encrypt a room event.
    ///
    /// Returns the encrypted content together with the `m.room_key` payload
    /// that has to be shared with the room's devices whenever a fresh
    /// session was created.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> MegolmResult<(EncryptedRoomEventContent, Option<RoomKeyContent>)> {
        let existing = self.outbound_sessions.get_outbound(room_id).filter(|s| {
            !s.expired(
                self.settings.rotation_period,
                self.settings.rotation_period_msgs,
            )
        });

        let (session, room_key) = match existing {
            Some(session) => (session, None),
            None => {
                let keys = self.account.identity_keys();
                let (outbound, room_key, inbound) = OutboundGroupSession::new(
                    room_id,
                    keys.curve25519,
                    keys.ed25519,
                    self.settings.shared_history,
                );

                self.store.save_inbound_group_sessions(&[inbound]).await?;
                self.outbound_sessions.insert_outbound(outbound.clone());

                (outbound, Some(room_key))
            }
        };

        let encrypted = session.encrypt(event_type, content).await;

        Ok((encrypted, room_key))
    }

    /// Olm-encrypt a payload for every given device and send the batch out
    /// as a single to-device transaction.
    ///
    /// Blacklisted devices, devices that don't speak Olm, and devices we
    /// have no Olm channel with are skipped. If nothing is left to send, no
    /// transport call is made at all.
    pub async fn encrypt_and_send_to_devices(
        &self,
        devices: &[Device],
        event_type: &str,
        content: &Value,
    ) -> OlmResult<()> {
        let mut messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>> =
            BTreeMap::new();

        for device in devices {
            if device.is_blacklisted() || !device.supports_olm() {
                debug!(
                    user_id = ?device.user_id,
                    device_id = ?device.device_id,
                    "Not sharing with a blacklisted device or one that doesn't support Olm"
                );
                continue;
            }

            match self
                .sessions
                .encrypt_for(device, event_type, content.clone())
                .await
            {
                Ok(encrypted) => {
                    messages.entry(device.user_id.clone()).or_default().insert(
                        DeviceIdOrAllDevices::DeviceId(device.device_id.clone()),
                        serde_json::to_value(encrypted)?,
                    );
                }
                Err(OlmError::MissingSession) => {
                    debug!(
                        user_id = ?device.user_id,
                        device_id = ?device.device_id,
                        "Skipping a device we have no Olm channel with"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if messages.is_empty() {
            debug!(event_type, "No device could be encrypted for, nothing to send");
            return Ok(());
        }

        let request =
            ToDeviceRequest::new(EncryptedToDeviceEventContent::EVENT_TYPE, messages);
        self.transport.send_to_device(&request).await?;

        Ok(())
    }
}
