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

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    olm::{Account as InnerAccount, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::Session;
use crate::error::SessionCreationError;

/// The long lived public identity keys of our own device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityKeys {
    /// The Curve25519 key, used to establish Olm sessions.
    pub curve25519: Curve25519PublicKey,
    /// The Ed25519 key, used to sign things we send out.
    pub ed25519: Ed25519PublicKey,
}

/// The result of creating a new inbound Olm session from a pre-key message.
pub struct InboundCreationResult {
    /// The freshly created session.
    pub session: Session,
    /// The plaintext the pre-key message carried.
    pub plaintext: String,
}

impl fmt::Debug for InboundCreationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCreationResult")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Our own Olm account, the root of all pairwise channels.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Mutex<InnerAccount>,
    identity_keys: Arc<IdentityKeys>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .finish()
    }
}

impl Account {
    /// Create a fresh account for the given device.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let inner = InnerAccount::new();
        let identity_keys = Arc::new(IdentityKeys {
            curve25519: inner.curve25519_key(),
            ed25519: inner.ed25519_key(),
        });

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            inner: Mutex::new(inner),
            identity_keys,
        }
    }

    /// The user that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device this account belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> Arc<IdentityKeys> {
        self.identity_keys.clone()
    }

    /// Create a fresh outbound Olm session towards the device owning the
    /// given identity key, using a one-time key we claimed for it.
    pub async fn create_outbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.lock().await.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        let session_id: Arc<str> = session.session_id().into();
        trace!(?session_id, "Created a new outbound Olm session");

        let now = SecondsSinceUnixEpoch::now();

        Session {
            inner: Arc::new(Mutex::new(session)),
            session_id,
            our_identity_keys: self.identity_keys.clone(),
            sender_key: identity_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create an inbound Olm session from a pre-key message another device
    /// sent us.
    pub async fn create_inbound_session(
        &self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        let result = self
            .inner
            .lock()
            .await
            .create_inbound_session(sender_key, message)?;

        let session_id: Arc<str> = result.session.session_id().into();
        trace!(?session_id, "Created a new inbound Olm session");

        let now = SecondsSinceUnixEpoch::now();

        Ok(InboundCreationResult {
            session: Session {
                inner: Arc::new(Mutex::new(result.session)),
                session_id,
                our_identity_keys: self.identity_keys.clone(),
                sender_key,
                creation_time: now,
                last_use_time: now,
            },
            plaintext: String::from_utf8_lossy(&result.plaintext).to_string(),
        })
    }
}
