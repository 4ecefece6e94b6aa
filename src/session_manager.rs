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

//! Management of the pairwise Olm channels, including the repair of wedged
//! ones.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use ruma::{to_device::DeviceIdOrAllDevices, OwnedUserId, UserId};
use tracing::{debug, info, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::{EventError, OlmError, OlmResult},
    identities::{Device, DeviceDirectory},
    olm::{Account, Session},
    store::CryptoStore,
    transport::{ToDeviceRequest, Transport},
    types::events::{
        DecryptedOlmEvent, DummyEventContent, EncryptedToDeviceEvent,
        EncryptedToDeviceEventContent, EventType, OlmEventKeys,
    },
    types::EventEncryptionAlgorithm,
};

/// Manages the pairwise encrypted channels between our device and everyone
/// else's.
///
/// Detects wedged channels, where the two ends have desynchronized ratchet
/// state, and repairs them by claiming a fresh one-time key and starting
/// over. Repairs for the same peer coalesce, concurrent wedge signals never
/// cause more than one one-time key claim at a time.
#[derive(Debug)]
pub struct PairwiseSessionManager {
    account: Arc<Account>,
    store: Arc<dyn CryptoStore>,
    transport: Arc<dyn Transport>,
    devices: Arc<dyn DeviceDirectory>,

    /// Minimum time between two repairs of the same channel.
    repair_interval: Duration,

    last_repair: StdMutex<HashMap<(OwnedUserId, Curve25519PublicKey), Instant>>,
    repairs_in_flight: StdMutex<HashSet<(OwnedUserId, Curve25519PublicKey)>>,
}

impl PairwiseSessionManager {
    pub fn new(
        account: Arc<Account>,
        store: Arc<dyn CryptoStore>,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn DeviceDirectory>,
        repair_interval: Duration,
    ) -> Self {
        Self {
            account,
            store,
            transport,
            devices,
            repair_interval,
            last_repair: StdMutex::new(HashMap::new()),
            repairs_in_flight: StdMutex::new(HashSet::new()),
        }
    }

    /// Encrypt an event payload for a single device.
    ///
    /// Fails with [`OlmError::MissingSession`] if we never established a
    /// channel with the device.
    pub async fn encrypt_for(
        &self,
        device: &Device,
        event_type: &str,
        content: serde_json::Value,
    ) -> OlmResult<EncryptedToDeviceEventContent> {
        let sessions = self
            .store
            .get_sessions(&device.curve25519_key.to_base64())
            .await?;

        // The session that was used most recently is the one the other side
        // is most likely to still hold.
        let mut session = sessions
            .into_iter()
            .max_by_key(|s| s.last_use_time)
            .ok_or(OlmError::MissingSession)?;

        let content = self
            .encrypt_with_session(&mut session, device, event_type, content)
            .await?;
        self.store.save_sessions(&[session]).await?;

        Ok(content)
    }

    async fn encrypt_with_session(
        &self,
        session: &mut Session,
        device: &Device,
        event_type: &str,
        content: serde_json::Value,
    ) -> OlmResult<EncryptedToDeviceEventContent> {
        let payload = DecryptedOlmEvent {
            sender: self.account.user_id().to_owned(),
            recipient: device.user_id.clone(),
            keys: OlmEventKeys {
                ed25519: self.account.identity_keys().ed25519,
            },
            recipient_keys: OlmEventKeys {
                ed25519: device.ed25519_key,
            },
            event_type: event_type.to_owned(),
            content,
        };

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = session.encrypt(&plaintext).await;

        Ok(EncryptedToDeviceEventContent {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            sender_key: self.account.identity_keys().curve25519,
            ciphertext: BTreeMap::from([(device.curve25519_key.to_base64(), ciphertext)]),
        })
    }

    /// Decrypt an `m.room.encrypted` to-device event.
    ///
    /// A message that none of our sessions can decrypt means the channel is
    /// wedged, surfaced as [`OlmError::SessionWedged`] so the caller can
    /// kick off a repair.
    pub async fn decrypt_to_device_event(
        &self,
        event: &EncryptedToDeviceEvent,
    ) -> OlmResult<DecryptedOlmEvent> {
        if event.content.algorithm != EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let own_key = self.account.identity_keys().curve25519;
        let message = event
            .content
            .ciphertext_for(&own_key)
            .ok_or(EventError::MissingCiphertext)?;

        let plaintext = self
            .decrypt_olm_message(&event.sender, event.content.sender_key, message)
            .await?;

        let decrypted: DecryptedOlmEvent = serde_json::from_str(&plaintext)?;

        if decrypted.sender != event.sender {
            return Err(
                EventError::MismatchedSender(decrypted.sender, event.sender.clone()).into(),
            );
        }

        if decrypted.recipient != self.account.user_id() {
            return Err(EventError::MismatchedSender(
                decrypted.recipient,
                self.account.user_id().to_owned(),
            )
            .into());
        }

        let own_signing_key = self.account.identity_keys().ed25519;
        if decrypted.recipient_keys.ed25519 != own_signing_key {
            return Err(EventError::MismatchedKeys(
                own_signing_key.into(),
                decrypted.recipient_keys.ed25519.into(),
            )
            .into());
        }

        Ok(decrypted)
    }

    async fn decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<String> {
        let sessions = self.store.get_sessions(&sender_key.to_base64()).await?;

        match message {
            OlmMessage::Normal(_) => {
                for mut session in sessions {
                    if let Ok(plaintext) = session.decrypt(message).await {
                        self.store.save_sessions(&[session]).await?;
                        return Ok(plaintext);
                    }
                }

                warn!(
                    ?sender_key,
                    "No Olm session was able to decrypt the message, the \
                     channel is likely wedged"
                );

                Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
            }
            OlmMessage::PreKey(prekey) => {
                if let Some(mut session) = sessions
                    .into_iter()
                    .find(|s| s.session_id() == prekey.session_id())
                {
                    // The pre-key message claims to belong to a session we
                    // already have. If that session can't decrypt it, the
                    // channel is beyond saving.
                    match session.decrypt(message).await {
                        Ok(plaintext) => {
                            self.store.save_sessions(&[session]).await?;
                            Ok(plaintext)
                        }
                        Err(_) => {
                            Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
                        }
                    }
                } else {
                    let result = self.account.create_inbound_session(sender_key, prekey).await?;

                    self.store.save_sessions(&[result.session]).await?;

                    Ok(result.plaintext)
                }
            }
        }
    }

    /// Repair the wedged channel with the device owning the given identity
    /// key.
    ///
    /// Claims a one-time key, builds a brand new outbound session and sends
    /// an encrypted `m.dummy` through it so the other side starts using the
    /// fresh channel too. Returns whether a repair actually ran, repairs
    /// coalesce per peer and are rate limited.
    pub async fn repair_wedged_session(
        &self,
        user_id: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> OlmResult<bool> {
        let peer = (user_id.to_owned(), sender_key);

        {
            let last_repair = self.last_repair.lock().unwrap();
            if let Some(last) = last_repair.get(&peer) {
                if last.elapsed() < self.repair_interval {
                    debug!(
                        ?sender_key,
                        "Not repairing the wedged channel, a repair ran recently"
                    );
                    return Ok(false);
                }
            }
        }

        if !self.repairs_in_flight.lock().unwrap().insert(peer.clone()) {
            debug!(?sender_key, "A repair for this channel is already running");
            return Ok(false);
        }

        // Recorded up front so that a failing repair can't be retried in a
        // tight loop either.
        self.last_repair
            .lock()
            .unwrap()
            .insert(peer.clone(), Instant::now());

        let result = self.repair(user_id, sender_key).await;

        self.repairs_in_flight.lock().unwrap().remove(&peer);

        result
    }

    async fn repair(
        &self,
        user_id: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> OlmResult<bool> {
        let Some(device) = self
            .devices
            .get_device_by_curve_key(user_id, sender_key)
            .await
        else {
            warn!(
                ?sender_key,
                "Can't repair the wedged channel, no device owns the sender key"
            );
            return Ok(false);
        };

        let claimed = self
            .transport
            .claim_one_time_keys(&[(device.user_id.clone(), device.device_id.clone())])
            .await?;

        let Some(one_time_key) = claimed
            .get(&device.user_id)
            .and_then(|keys| keys.get(&device.device_id))
        else {
            warn!(
                user_id = ?device.user_id,
                device_id = ?device.device_id,
                "Can't repair the wedged channel, no one-time key could be claimed"
            );
            return Ok(false);
        };

        info!(
            user_id = ?device.user_id,
            device_id = ?device.device_id,
            ?sender_key,
            "Repairing a wedged Olm channel with a fresh session"
        );

        let mut session = self
            .account
            .create_outbound_session(device.curve25519_key, one_time_key.key)
            .await;

        let content = self
            .encrypt_with_session(
                &mut session,
                &device,
                DummyEventContent::EVENT_TYPE,
                serde_json::to_value(DummyEventContent::new())?,
            )
            .await?;
        self.store.save_sessions(&[session]).await?;

        let request = ToDeviceRequest::new_single(
            EncryptedToDeviceEventContent::EVENT_TYPE,
            device.user_id.clone(),
            DeviceIdOrAllDevices::DeviceId(device.device_id.clone()),
            serde_json::to_value(&content)?,
        );

        self.transport.send_to_device(&request).await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};
    use serde_json::json;
    use vodozemac::olm::{Account as InnerAccount, OlmMessage};

    use super::PairwiseSessionManager;
    use crate::{
        error::OlmError,
        identities::{testing::StaticDeviceDirectory, Device, LocalTrust},
        olm::Account,
        store::MemoryStore,
        transport::testing::RecordingTransport,
        types::{
            events::{EncryptedToDeviceEvent, EncryptedToDeviceEventContent, ToDeviceEvent},
            EventEncryptionAlgorithm,
        },
    };

    fn bob_device(bob: &InnerAccount) -> Device {
        Device {
            user_id: user_id!("@bob:localhost").to_owned(),
            device_id: device_id!("BOB_PHONE").to_owned(),
            curve25519_key: bob.curve25519_key(),
            ed25519_key: bob.ed25519_key(),
            algorithms: vec![EventEncryptionAlgorithm::OlmV1Curve25519AesSha2],
            local_trust: LocalTrust::Unset,
        }
    }

    fn manager(
        devices: Vec<Device>,
    ) -> (
        PairwiseSessionManager,
        Arc<Account>,
        Arc<RecordingTransport>,
        Arc<StaticDeviceDirectory>,
    ) {
        let account = Arc::new(Account::new(
            user_id!("@alice:localhost"),
            device_id!("ALICE_PHONE"),
        ));
        let transport = Arc::new(RecordingTransport::default());
        let directory = Arc::new(StaticDeviceDirectory::new(devices));

        let manager = PairwiseSessionManager::new(
            account.clone(),
            Arc::new(MemoryStore::new()),
            transport.clone(),
            directory.clone(),
            Duration::from_secs(3600),
        );

        (manager, account, transport, directory)
    }

    #[tokio::test]
    async fn encrypt_without_a_session_is_an_error() {
        let mut bob = InnerAccount::new();
        let device = bob_device(&bob);
        let (manager, ..) = manager(vec![device.clone()]);

        bob.generate_one_time_keys(1);

        let result = manager.encrypt_for(&device, "m.dummy", json!({})).await;
        assert_matches!(result, Err(OlmError::MissingSession));
    }

    #[tokio::test]
    async fn undecryptable_message_is_reported_as_wedged() {
        let mut bob = InnerAccount::new();
        let device = bob_device(&bob);
        let (manager, account, ..) = manager(vec![device]);

        // Bob encrypts for Alice over a session Alice never saw the start
        // of, then sends a normal (non pre-key) message. Simulate by
        // producing a pre-key message from a session alice knows nothing
        // about and corrupting the flow: alice holds no session at all, so
        // a normal message can't be decrypted.
        bob.generate_one_time_keys(1);
        let bob_otk = *bob.one_time_keys().values().next().unwrap();
        bob.mark_keys_as_published();

        let alice_view = InnerAccount::new();
        let mut wedged_session = alice_view.create_outbound_session(
            vodozemac::olm::SessionConfig::version_1(),
            bob.curve25519_key(),
            bob_otk,
        );
        let _ = wedged_session.encrypt("advance");
        let message = wedged_session.encrypt("lost forever");
        assert_matches!(&message, OlmMessage::PreKey(_));

        // Claim the message came from bob's identity key towards our
        // account; our account can't create an inbound session from it
        // since it was made for a different account.
        let content = EncryptedToDeviceEventContent {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            sender_key: bob.curve25519_key(),
            ciphertext: std::collections::BTreeMap::from([(
                account.identity_keys().curve25519.to_base64(),
                message,
            )]),
        };
        let event: EncryptedToDeviceEvent =
            ToDeviceEvent::new(user_id!("@bob:localhost").to_owned(), content);

        let result = manager.decrypt_to_device_event(&event).await;
        assert_matches!(result, Err(_));
    }

    #[tokio::test]
    async fn wedge_repair_sends_a_dummy_and_coalesces() {
        let mut bob = InnerAccount::new();
        let device = bob_device(&bob);
        let (manager, _, transport, _) = manager(vec![device.clone()]);

        transport.add_one_time_key(
            device.user_id.clone(),
            device.device_id.clone(),
            &mut bob,
        );

        let repaired = manager
            .repair_wedged_session(&device.user_id, device.curve25519_key)
            .await
            .unwrap();
        assert!(repaired);

        // The rate limit swallows an immediate second repair.
        let repaired = manager
            .repair_wedged_session(&device.user_id, device.curve25519_key)
            .await
            .unwrap();
        assert!(!repaired);

        let sent = transport.sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room.encrypted");
        assert_eq!(sent[0].message_count(), 1);
    }

    #[tokio::test]
    async fn repair_without_a_one_time_key_is_a_noop() {
        let bob = InnerAccount::new();
        let device = bob_device(&bob);
        let (manager, _, transport, _) = manager(vec![device.clone()]);

        let repaired = manager
            .repair_wedged_session(&device.user_id, device.curve25519_key)
            .await
            .unwrap();

        assert!(!repaired);
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn roundtrip_through_a_repaired_channel() {
        let mut bob = InnerAccount::new();
        let device = bob_device(&bob);
        let (manager, account, transport, _) = manager(vec![device.clone()]);

        transport.add_one_time_key(
            device.user_id.clone(),
            device.device_id.clone(),
            &mut bob,
        );

        manager
            .repair_wedged_session(&device.user_id, device.curve25519_key)
            .await
            .unwrap();

        // Bob can read the dummy that travelled over the fresh channel.
        let sent = transport.sent_requests();
        let content = sent[0]
            .messages
            .values()
            .next()
            .unwrap()
            .values()
            .next()
            .unwrap();

        let ciphertext = &content["ciphertext"]
            [account.identity_keys().curve25519.to_base64()];
        let message: OlmMessage = serde_json::from_value(ciphertext.clone()).unwrap();

        let OlmMessage::PreKey(prekey) = message else {
            panic!("a fresh session always starts with a pre-key message");
        };

        let result = bob
            .create_inbound_session(account.identity_keys().curve25519, &prekey)
            .unwrap();
        let plaintext: serde_json::Value =
            serde_json::from_slice(&result.plaintext).unwrap();

        assert_eq!(plaintext["type"], "m.dummy");
        assert_eq!(plaintext["recipient"], "@bob:localhost");
    }
}
