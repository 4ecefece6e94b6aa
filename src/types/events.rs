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

//! Types modeling the end-to-end encryption related Matrix events.

use std::collections::BTreeMap;

use ruma::{
    OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{
    megolm::{ExportedSessionKey, MegolmMessage, SessionKey},
    olm::OlmMessage,
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::{
    deserialize_curve_key, deserialize_ed25519_key, deserialize_opt_curve_key,
    serialize_curve_key, serialize_ed25519_key, serialize_opt_curve_key,
    EventEncryptionAlgorithm, RoomKeyRequestBody,
};

/// A trait for event contents to define their event type.
pub trait EventType {
    /// The event type of the event content.
    const EVENT_TYPE: &'static str;

    /// Get the event type of the event content.
    fn event_type(&self) -> &str {
        Self::EVENT_TYPE
    }
}

/// A to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C>
where
    C: EventType + std::fmt::Debug + Sized + Serialize,
{
    /// The sender of the event.
    pub sender: OwnedUserId,

    /// The content of the event.
    pub content: C,
}

impl<C> ToDeviceEvent<C>
where
    C: EventType + std::fmt::Debug + Sized + Serialize,
{
    /// Create a new to-device event.
    pub fn new(sender: OwnedUserId, content: C) -> Self {
        Self { sender, content }
    }
}

/// The `m.room_key` event content.
///
/// The initial share of a Megolm session, sent over an established Olm
/// channel.
#[derive(Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The encryption algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The unique ID of the session.
    pub session_id: String,

    /// The key allowing us to decrypt from the current ratchet index onwards.
    pub session_key: SessionKey,

    /// Whether the session was shared with past room history.
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,
}

impl EventType for RoomKeyContent {
    const EVENT_TYPE: &'static str = "m.room_key";
}

impl std::fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("shared_history", &self.shared_history)
            .finish_non_exhaustive()
    }
}

/// The `m.forwarded_room_key` event content.
///
/// A re-share of a Megolm session that the sender itself received from
/// someone else.
#[derive(Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The encryption algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device that created the session.
    ///
    /// Optional because senders do send forwards without it, such a forward
    /// can't ever be attached to a decryption request and gets rejected.
    #[serde(
        default,
        deserialize_with = "deserialize_opt_curve_key",
        serialize_with = "serialize_opt_curve_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_key: Option<Curve25519PublicKey>,

    /// The unique ID of the session.
    pub session_id: String,

    /// The key, exported at some ratchet index.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key the session creator claimed to own.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub sender_claimed_ed25519_key: Ed25519PublicKey,

    /// The Curve25519 keys of the devices the session passed through, oldest
    /// first.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// Whether the session was shared with past room history.
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,
}

impl std::fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("sender_claimed_ed25519_key", &self.sender_claimed_ed25519_key)
            .field(
                "forwarding_curve25519_key_chain",
                &self.forwarding_curve25519_key_chain,
            )
            .field("shared_history", &self.shared_history)
            .finish_non_exhaustive()
    }
}

impl EventType for ForwardedRoomKeyContent {
    const EVENT_TYPE: &'static str = "m.forwarded_room_key";
}

/// The action of an `m.room_key_request` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestAction {
    /// We'd like to receive the key described in the body.
    Request,
    /// A previously sent request with the same request ID should be
    /// disregarded.
    RequestCancellation,
}

/// The `m.room_key_request` event content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// What the recipient should do with this event.
    pub action: KeyRequestAction,

    /// The session we'd like to receive, absent for cancellations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RoomKeyRequestBody>,

    /// The ID of the device requesting the key.
    pub requesting_device_id: OwnedDeviceId,

    /// A random string uniquely identifying this request and its
    /// cancellation. Never reused across request generations.
    pub request_id: OwnedTransactionId,
}

impl RoomKeyRequestContent {
    /// Create a new request for the given session.
    pub fn new_request(
        body: RoomKeyRequestBody,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: KeyRequestAction::Request,
            body: Some(body),
            requesting_device_id,
            request_id,
        }
    }

    /// Create a cancellation for a previously sent request.
    pub fn new_cancellation(
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: KeyRequestAction::RequestCancellation,
            body: None,
            requesting_device_id,
            request_id,
        }
    }
}

impl EventType for RoomKeyRequestContent {
    const EVENT_TYPE: &'static str = "m.room_key_request";
}

/// The content of an `m.dummy` event.
///
/// Carries no payload, its only purpose is to establish a fresh Olm session
/// on the receiving side.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DummyEventContent {
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl DummyEventContent {
    /// Create a new `m.dummy` event content.
    pub fn new() -> Self {
        Default::default()
    }
}

impl EventType for DummyEventContent {
    const EVENT_TYPE: &'static str = "m.dummy";
}

/// The content of an `m.room.encrypted` to-device event, carrying an Olm
/// encrypted payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedToDeviceEventContent {
    /// The algorithm the payload was encrypted with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the sending device.
    #[serde(
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// Per-recipient ciphertexts, keyed by the base64 encoded Curve25519 key
    /// of the recipient device.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

impl EncryptedToDeviceEventContent {
    /// Get the ciphertext that was encrypted for the given device, if any.
    pub fn ciphertext_for(&self, recipient_key: &Curve25519PublicKey) -> Option<&OlmMessage> {
        self.ciphertext.get(&recipient_key.to_base64())
    }
}

impl EventType for EncryptedToDeviceEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

/// An `m.room.encrypted` to-device event.
pub type EncryptedToDeviceEvent = ToDeviceEvent<EncryptedToDeviceEventContent>;

/// The Ed25519 keys that are part of an Olm encrypted payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmEventKeys {
    /// The long term Ed25519 key of the device.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

/// The plaintext payload of a successfully decrypted Olm message.
///
/// The sender, recipient and key fields bind the plaintext to the Olm
/// channel it travelled over.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedOlmEvent {
    /// The user that encrypted the payload.
    pub sender: OwnedUserId,

    /// The user the payload was encrypted for.
    pub recipient: OwnedUserId,

    /// The signing keys of the sending device.
    pub keys: OlmEventKeys,

    /// The signing keys of the receiving device.
    pub recipient_keys: OlmEventKeys,

    /// The type of the carried event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the carried event.
    pub content: Value,
}

/// The content of an in-room `m.room.encrypted` event, carrying a Megolm
/// encrypted payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedRoomEventContent {
    /// The algorithm the payload was encrypted with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The encrypted content of the event.
    pub ciphertext: MegolmMessage,

    /// The ID of the session that encrypted the payload.
    pub session_id: String,

    /// The Curve25519 key of the sending device.
    ///
    /// Deprecated on the wire and untrustworthy, only used to look sessions
    /// up.
    #[serde(
        default,
        deserialize_with = "deserialize_opt_curve_key",
        serialize_with = "serialize_opt_curve_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_key: Option<Curve25519PublicKey>,

    /// The ID of the sending device, deprecated on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
}

impl EventType for EncryptedRoomEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

/// An in-room `m.room.encrypted` event as it arrives from a sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,

    /// The globally unique ID of the event.
    pub event_id: OwnedEventId,

    /// The room the event was sent in.
    pub room_id: OwnedRoomId,

    /// The encrypted content.
    pub content: EncryptedRoomEventContent,

    /// Server appended data, carried through decryption untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

impl EncryptedEvent {
    /// Get the redaction event that redacted this event, if any.
    pub fn redacted_because(&self) -> Option<&Value> {
        self.unsigned.as_ref()?.get("redacted_because")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use serde_json::{json, Value};
    use vodozemac::Curve25519PublicKey;

    use super::{
        EncryptedEvent, EncryptedToDeviceEvent, ForwardedRoomKeyContent, KeyRequestAction,
        RoomKeyRequestContent, ToDeviceEvent,
    };

    pub(crate) fn encrypted_to_device_json() -> Value {
        json!({
            "sender": "@alice:example.org",
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "ciphertext": {
                    "Nn0L2hkcCMFKqynTjyGsJbth7QrVmX3lbrksMkrGOAw": {
                        "body":
                            "Awogv7Iysf062hV1gZNfG/SdO5TdLYtkRI12em6LxralPxoSICC/Av\
                             nha6NfkaMWSC+5h+khS0wHiUzA2bPmAvVo/iYhGiAfDNh4F0eqPvOc\
                             4Hw9wMgd+frzedZgmhUNfKT0UzHQZSJPAwogF8fTdTcPt1ppJ/KAEi\
                             vFZ4dIyAlRUjzhlqzYsw9C1HoQACIgb9MK/a9TRLtwol9gfy7OeKdp\
                             mSe39YhP+5OchhKvX6eO3/aED3X1oA",
                        "type": 0
                    }
                },
                "sender_key": "mjkTX0I0Cp44ZfolOVbFe5WYPRmT6AX3J0ZbnGWnnWs"
            },
        })
    }

    #[test]
    fn encrypted_to_device_deserialization() {
        let event: EncryptedToDeviceEvent =
            serde_json::from_value(encrypted_to_device_json()).unwrap();

        let recipient =
            Curve25519PublicKey::from_base64("Nn0L2hkcCMFKqynTjyGsJbth7QrVmX3lbrksMkrGOAw")
                .unwrap();
        assert!(event.content.ciphertext_for(&recipient).is_some());

        let other =
            Curve25519PublicKey::from_base64("mjkTX0I0Cp44ZfolOVbFe5WYPRmT6AX3J0ZbnGWnnWs")
                .unwrap();
        assert!(event.content.ciphertext_for(&other).is_none());
    }

    #[test]
    fn key_request_deserialization() {
        let json = json!({
            "sender": "@alice:example.org",
            "content": {
                "action": "request_cancellation",
                "request_id": "m1234567",
                "requesting_device_id": "DEVICE",
            },
        });

        let event: ToDeviceEvent<RoomKeyRequestContent> = serde_json::from_value(json).unwrap();
        assert_matches!(event.content.action, KeyRequestAction::RequestCancellation);
        assert!(event.content.body.is_none());
    }

    #[test]
    fn forwarded_room_key_without_sender_key() {
        let json = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": "!test:localhost",
            "session_id": "FORWARDED",
            "session_key":
                "AQAAAAq2JpkMceK5f6JrZPJWwzQTn59zliuIv0F7apVLXDcZCCT3LqBjD21sULYEO5YTKdp\
                 MVhi9i6ZSZhdvZvp//tzRpDT7wpWVWI00Y3EPEjmpm/HfZ4MMAKpk+tzJVuuvfAcHBZgpnx\
                 BGzYOc/DAqapK7Tk3t3QJ1UMSD94HfAqlb1JF5QBPwoh0fOvD8pJdanB8zxz05tKFdR73/v\
                 o2Q/zE3",
            "sender_claimed_ed25519_key": "aj40p+aw64yPIdsxoog8jhPu9i7l7NcFRecuOQblE3Y",
        });

        let content: ForwardedRoomKeyContent = serde_json::from_value(json).unwrap();
        assert!(content.sender_key.is_none());
        assert!(content.forwarding_curve25519_key_chain.is_empty());
        assert!(!content.shared_history);
    }

    #[test]
    fn redaction_is_visible_in_unsigned() {
        let json = json!({
            "sender": "@alice:example.org",
            "event_id": "$event",
            "room_id": "!test:localhost",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "ciphertext":
                    "AwgAEpABhetEzzZzyYrxtEVUtlJnZtJcURBlQUQJ9irVeklCTs06LwgTMQj61PMUS4Vy\
                     YOX+PD67+hhU40/8olOww+Ud0m2afjMjC3wFX+4fFfSkoWPVHEmRVucfcdSF1RSB4EmK\
                     PIP4eo1X6x8kCIMewBvxl2sI9j4VNvDvAN7M3zkLJfFLOFHbBviI4FN7hSFHFeM739Zg\
                     iwxEs3hIkUXEiAfrobzaMEM/zY7SDrTdyffZndgJo7CZOVhoV6vuaOhmAy4X2t4UnbuV\
                     JGJjKfV57NAhp8W+9oT7ugwO",
                "session_id": "64H7XKokIx0ASkYDHZKlT5zd/Zccz/cQspPNdvnNULA",
            },
            "unsigned": {
                "redacted_because": {
                    "sender": "@alice:example.org",
                    "type": "m.room.redaction",
                },
            },
        });

        let event: EncryptedEvent = serde_json::from_value(json).unwrap();
        let redaction = event.redacted_because().unwrap();
        assert_eq!(redaction["type"], "m.room.redaction");
    }
}
