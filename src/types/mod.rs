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

//! Module containing customized types modeling Matrix keys and events.
//!
//! These types are more strict than the equivalent Ruma types: once
//! deserialized they contain valid vodozemac key types instead of base64
//! encoded strings.

pub mod events;

pub use ruma::EventEncryptionAlgorithm;
use ruma::OwnedRoomId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// Information about a requested room key.
///
/// This is the canonical description of a single Megolm session. Everything
/// that deduplicates or indexes key requests does so through the string
/// returned by [`RoomKeyRequestBody::as_key()`], never through a request's
/// transaction ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestBody {
    /// The algorithm of the session we'd like to receive.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is being used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device that created the session.
    #[serde(
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// The unique ID of the session.
    pub session_id: String,
}

impl RoomKeyRequestBody {
    /// The stable storage and deduplication key for this session.
    ///
    /// Two requests for the same session always map to the same key, no
    /// matter how many transaction IDs they went through.
    pub fn as_key(&self) -> String {
        format!(
            "roomKeyRequest:{}|{}|{}|{}",
            self.algorithm, self.room_id, self.sender_key, self.session_id
        )
    }
}

// Vodozemac serializes curve keys directly as a byteslice, while matrix likes
// to base64 encode all byte slices.
//
// This ensures that we serialize/deserialize in a Matrix compatible way.
pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_opt_curve_key<'de, D>(
    de: D,
) -> Result<Option<Curve25519PublicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let key: Option<String> = Deserialize::deserialize(de)?;

    key.map(|k| Curve25519PublicKey::from_base64(&k).map_err(serde::de::Error::custom))
        .transpose()
}

pub(crate) fn serialize_opt_curve_key<S>(
    key: &Option<Curve25519PublicKey>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match key {
        Some(key) => s.serialize_some(&key.to_base64()),
        None => s.serialize_none(),
    }
}

pub(crate) fn deserialize_ed25519_key<'de, D>(de: D) -> Result<Ed25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_ed25519_key<S>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

#[cfg(test)]
mod tests {
    use ruma::room_id;
    use vodozemac::Curve25519PublicKey;

    use super::{EventEncryptionAlgorithm, RoomKeyRequestBody};

    #[test]
    fn request_body_key_is_stable() {
        let body = RoomKeyRequestBody {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id!("!test:localhost").to_owned(),
            sender_key: Curve25519PublicKey::from_base64(
                "mjkTX0I0Cp44ZfolOVbFe5WYPRmT6AX3J0ZbnGWnnWs",
            )
            .unwrap(),
            session_id: "SESSION_ID".to_owned(),
        };

        let other = body.clone();

        assert_eq!(body.as_key(), other.as_key());
        assert!(body.as_key().contains("!test:localhost"));
    }

    #[test]
    fn request_body_serialization_roundtrip() {
        let json = serde_json::json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": "!test:localhost",
            "sender_key": "mjkTX0I0Cp44ZfolOVbFe5WYPRmT6AX3J0ZbnGWnnWs",
            "session_id": "SESSION_ID",
        });

        let body: RoomKeyRequestBody = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(body.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);

        let serialized = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serialized);
    }
}
