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

//! The transport collaborator trait and to-device request batches.
//!
//! The engine only ever expresses the intent to send something, the actual
//! HTTP traffic and its retry policy live in the embedding client.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use ruma::{
    to_device::DeviceIdOrAllDevices, OwnedDeviceId, OwnedTransactionId, OwnedUserId,
    TransactionId,
};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use crate::error::TransportError;

/// A batch of to-device messages that should go out in a single transaction.
#[derive(Clone, Debug)]
pub struct ToDeviceRequest {
    /// The type of the event that is being sent.
    pub event_type: String,

    /// A unique transaction ID for this batch.
    ///
    /// Servers deduplicate on it, so it is generated fresh for every send
    /// and never reused, not even when re-requesting the same logical thing.
    pub txn_id: OwnedTransactionId,

    /// Per user and device message payloads.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request with a fresh transaction ID.
    pub fn new(
        event_type: &str,
        messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>>,
    ) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: TransactionId::new(),
            messages,
        }
    }

    /// Create a request carrying a single message for a single recipient.
    pub fn new_single(
        event_type: &str,
        recipient: OwnedUserId,
        recipient_device: DeviceIdOrAllDevices,
        content: Value,
    ) -> Self {
        let messages =
            BTreeMap::from([(recipient, BTreeMap::from([(recipient_device, content)]))]);
        Self::new(event_type, messages)
    }

    /// The number of individual messages in the batch.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}

/// A one-time key that was claimed for a device.
#[derive(Clone, Debug)]
pub struct ClaimedOneTimeKey {
    /// The Curve25519 one-time key itself.
    pub key: Curve25519PublicKey,
}

/// The transport layer of the embedding client.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Send out a batch of to-device messages.
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError>;

    /// Claim one-time keys for the given devices.
    ///
    /// Devices missing from the returned map had no one-time key available.
    async fn claim_one_time_keys(
        &self,
        devices: &[(OwnedUserId, OwnedDeviceId)],
    ) -> Result<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ClaimedOneTimeKey>>, TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::BTreeMap,
        sync::{Mutex, RwLock},
    };

    use async_trait::async_trait;
    use ruma::{OwnedDeviceId, OwnedUserId};
    use vodozemac::olm::Account;

    use super::{ClaimedOneTimeKey, ToDeviceRequest, Transport};
    use crate::error::TransportError;

    /// A transport that records every request and answers one-time key
    /// claims from real vodozemac accounts.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        sent: RwLock<Vec<ToDeviceRequest>>,
        one_time_keys: Mutex<BTreeMap<(OwnedUserId, OwnedDeviceId), ClaimedOneTimeKey>>,
    }

    impl RecordingTransport {
        pub fn sent_requests(&self) -> Vec<ToDeviceRequest> {
            self.sent.read().unwrap().clone()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.read().unwrap().len()
        }

        /// Make a one-time key of the given account claimable for the
        /// device.
        pub fn add_one_time_key(
            &self,
            user_id: OwnedUserId,
            device_id: OwnedDeviceId,
            account: &mut Account,
        ) {
            account.generate_one_time_keys(1);
            let key = *account
                .one_time_keys()
                .values()
                .next()
                .expect("we just generated a one-time key");
            account.mark_keys_as_published();

            self.one_time_keys
                .lock()
                .unwrap()
                .insert((user_id, device_id), ClaimedOneTimeKey { key });
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
            self.sent.write().unwrap().push(request.clone());
            Ok(())
        }

        async fn claim_one_time_keys(
            &self,
            devices: &[(OwnedUserId, OwnedDeviceId)],
        ) -> Result<
            BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ClaimedOneTimeKey>>,
            TransportError,
        > {
            let mut keys = self.one_time_keys.lock().unwrap();
            let mut response: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ClaimedOneTimeKey>> =
                BTreeMap::new();

            for (user_id, device_id) in devices {
                if let Some(key) = keys.remove(&(user_id.clone(), device_id.clone())) {
                    response
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id.clone(), key);
                }
            }

            Ok(response)
        }
    }
}
