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

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::store::CryptoStoreError;

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The decrypted plaintext couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// A new Olm channel couldn't be established.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The Olm channel with a device has become corrupted, none of our
    /// stored sessions could decrypt the message.
    #[error(
        "decryption failed likely because an Olm session from {0} with sender key {1} was wedged"
    )]
    SessionWedged(OwnedUserId, Curve25519PublicKey),

    /// Encryption failed because the device does not have a valid Olm
    /// session with us.
    #[error("encryption failed because the device does not have a valid Olm session with us")]
    MissingSession,

    /// The transport layer failed to deliver a request.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error representing a failure during a group decryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The decrypted plaintext couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// We're missing the room key that encrypted the event, or only hold the
    /// key starting from a later message index.
    #[error("can't find the room key to decrypt the event")]
    MissingRoomKey,

    /// The encrypted Megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The ratchet failed to decrypt the ciphertext.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error that occurs when an event is structurally unusable.
#[derive(Error, Debug)]
pub enum EventError {
    /// The encrypted message uses an unsupported algorithm.
    #[error("the encrypted message has been encrypted with an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The encrypted message doesn't contain a ciphertext for our device.
    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// A room key event is missing the curve25519 key of the device that
    /// created the session.
    #[error("the room key event is missing the sender key")]
    MissingSenderKey,

    /// A room key was offered by a sender that neither matches an
    /// outstanding request of ours nor invited us into the room.
    #[error("the room key was forwarded by a device we never asked, from {0}")]
    UnauthorizedForward(OwnedUserId),

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
         message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The Ed25519 key that was part of the plaintext doesn't match the key
    /// we expected.
    #[error(
        "the signing key that was part of the plaintext doesn't match the key \
         we expected, expected {0}, got {1}"
    )]
    MismatchedKeys(Box<Ed25519PublicKey>, Box<Ed25519PublicKey>),

    /// The room ID of the room key doesn't match the room ID of the
    /// decrypted event.
    #[error(
        "the room id of the room key doesn't match the room id of the \
         decrypted event: expected {0}, got {1:?}"
    )]
    MismatchedRoom(OwnedRoomId, Option<OwnedRoomId>),
}

/// Error that occurs when a room key can't be turned into a Megolm session,
/// or an Olm channel can't be established.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The one-time key needed to establish a fresh Olm channel is missing
    /// from the key-claim response.
    #[error("tried to create a new Olm session for {0} {1}, but the one-time key is missing")]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// Error deserializing the session key.
    #[error("error deserializing the session key: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The given curve25519 key is not a valid key.
    #[error("the given curve25519 key is not a valid key")]
    InvalidCurveKey(#[from] vodozemac::KeyError),

    /// The session key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// Error when creating an Olm session from an incoming pre-key message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),
}

/// Error describing a failure of the transport layer.
///
/// The engine never swallows these, they're propagated so the caller can
/// apply its own retry policy.
#[derive(Error, Debug)]
#[error("the transport layer failed to deliver a request: {0}")]
pub struct TransportError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl TransportError {
    /// Wrap any error type into a transport error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(error))
    }
}
