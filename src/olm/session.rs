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

use std::{fmt, sync::Arc};

use ruma::SecondsSinceUnixEpoch;
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    olm::{DecryptionError, OlmMessage, Session as InnerSession},
    Curve25519PublicKey,
};

use super::IdentityKeys;

/// A pairwise encrypted channel between our own device and one remote
/// device.
#[derive(Clone)]
pub struct Session {
    /// The ratchet state of the channel.
    pub inner: Arc<Mutex<InnerSession>>,
    /// The unique ID of the session.
    pub session_id: Arc<str>,
    /// Our own identity keys.
    pub our_identity_keys: Arc<IdentityKeys>,
    /// The Curve25519 identity key of the remote device.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used to encrypt or decrypt.
    pub last_use_time: SecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// The unique ID of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Encrypt the given plaintext for the remote device.
    pub async fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        message
    }

    /// Decrypt the given Olm message.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        trace!(session_id = %self.session_id, "Decrypted an Olm message");

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(String::from_utf8_lossy(&plaintext).to_string())
    }
}
