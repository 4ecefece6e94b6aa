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

//! Device identities and the collaborator traits supplying them.
//!
//! The engine never discovers devices or room state on its own, both are
//! injected through the traits in this module.

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::types::{
    deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key, serialize_ed25519_key,
    EventEncryptionAlgorithm,
};

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified by the local user.
    Verified,
    /// The device hasn't been verified.
    #[default]
    Unset,
    /// The device was explicitly blocked, nothing should ever be encrypted
    /// for it.
    BlackListed,
}

/// A device belonging to some user, as the device directory reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    /// The user the device belongs to.
    pub user_id: OwnedUserId,

    /// The unique ID of the device.
    pub device_id: OwnedDeviceId,

    /// The long lived Curve25519 identity key of the device.
    #[serde(
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub curve25519_key: Curve25519PublicKey,

    /// The long lived Ed25519 signing key of the device.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519_key: Ed25519PublicKey,

    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// The trust the local user placed in the device.
    pub local_trust: LocalTrust,
}

impl Device {
    /// Is this device considered verified by the local user.
    pub fn is_verified(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Was this device explicitly blocked.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }

    /// Does the device support the 1:1 Olm encryption algorithm.
    pub fn supports_olm(&self) -> bool {
        self.algorithms
            .contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }
}

/// The membership state of our own user in some room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// We're joined to the room.
    Joined,
    /// We've been invited but haven't joined yet.
    Invited,
    /// We're neither joined nor invited.
    Left,
}

/// A directory of devices, provided by the embedding client.
#[async_trait]
pub trait DeviceDirectory: Send + Sync + Debug {
    /// Get a specific device of a user.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device>;

    /// Find the device of a user that owns the given Curve25519 identity
    /// key.
    async fn get_device_by_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Option<Device>;
}

/// Room state lookups, provided by the embedding client.
#[async_trait]
pub trait RoomStateProvider: Send + Sync + Debug {
    /// The membership of our own user in the given room.
    async fn own_membership(&self, room_id: &RoomId) -> Membership;

    /// The user that invited us into the given room, if we were invited.
    async fn inviter(&self, room_id: &RoomId) -> Option<OwnedUserId>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::BTreeMap,
        sync::{Mutex, RwLock},
    };

    use async_trait::async_trait;
    use ruma::{DeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
    use vodozemac::Curve25519PublicKey;

    use super::{Device, DeviceDirectory, Membership, RoomStateProvider};

    /// A device directory backed by a plain map, for tests.
    #[derive(Debug, Default)]
    pub(crate) struct StaticDeviceDirectory {
        devices: RwLock<Vec<Device>>,
    }

    impl StaticDeviceDirectory {
        pub fn new(devices: Vec<Device>) -> Self {
            Self {
                devices: RwLock::new(devices),
            }
        }

        pub fn add_device(&self, device: Device) {
            self.devices.write().unwrap().push(device);
        }
    }

    #[async_trait]
    impl DeviceDirectory for StaticDeviceDirectory {
        async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
            self.devices
                .read()
                .unwrap()
                .iter()
                .find(|d| d.user_id == user_id && d.device_id == device_id)
                .cloned()
        }

        async fn get_device_by_curve_key(
            &self,
            user_id: &UserId,
            curve_key: Curve25519PublicKey,
        ) -> Option<Device> {
            self.devices
                .read()
                .unwrap()
                .iter()
                .find(|d| d.user_id == user_id && d.curve25519_key == curve_key)
                .cloned()
        }
    }

    /// A room state provider with per-room canned answers, for tests.
    #[derive(Debug, Default)]
    pub(crate) struct StaticRoomState {
        memberships: Mutex<BTreeMap<OwnedRoomId, Membership>>,
        inviters: Mutex<BTreeMap<OwnedRoomId, OwnedUserId>>,
    }

    impl StaticRoomState {
        pub fn set_membership(&self, room_id: &RoomId, membership: Membership) {
            self.memberships
                .lock()
                .unwrap()
                .insert(room_id.to_owned(), membership);
        }

        pub fn set_inviter(&self, room_id: &RoomId, inviter: OwnedUserId) {
            self.inviters
                .lock()
                .unwrap()
                .insert(room_id.to_owned(), inviter);
        }
    }

    #[async_trait]
    impl RoomStateProvider for StaticRoomState {
        async fn own_membership(&self, room_id: &RoomId) -> Membership {
            self.memberships
                .lock()
                .unwrap()
                .get(room_id)
                .copied()
                .unwrap_or(Membership::Left)
        }

        async fn inviter(&self, room_id: &RoomId) -> Option<OwnedUserId> {
            self.inviters.lock().unwrap().get(room_id).cloned()
        }
    }
}
