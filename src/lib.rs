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

//! A no-network engine for Matrix room-key exchange and event decryption.
//!
//! The engine owns the Olm account of a single device and everything that
//! hangs off it: pairwise Olm channels, inbound and outbound Megolm
//! sessions, outgoing room key requests and the trust bookkeeping for keys
//! that arrive from other devices.
//!
//! It deliberately does no I/O of its own. The embedding client provides
//! the [`transport::Transport`] that actually talks to a homeserver, the
//! [`store::CryptoStore`] that persists sessions and requests, and the
//! directory and room state lookups in [`identities`]. The
//! [`machine::EncryptionMachine`] ties them together:
//!
//! * feed it incoming `m.room.encrypted` to-device events with
//!   [`EncryptionMachine::receive_encrypted_to_device`],
//! * decrypt room events with [`EncryptionMachine::decrypt_room_event`],
//! * encrypt outgoing room events with
//!   [`EncryptionMachine::encrypt_room_event`],
//! * flush outgoing key requests with
//!   [`EncryptionMachine::send_outgoing_requests`],
//! * and listen on [`EncryptionMachine::subscribe`] for decryptions that
//!   complete out of band, once a missing room key finally arrives.

#![warn(missing_debug_implementations, missing_docs)]

pub mod error;
pub mod gossiping;
pub mod identities;
pub mod machine;
pub mod olm;
pub mod secret_storage;
pub mod session_manager;
pub mod store;
pub mod transport;
pub mod types;

pub use error::{EventError, MegolmError, OlmError};
pub use machine::{
    DecryptedRoomEvent, EncryptionMachine, EncryptionSettings, RoomKeyUpdate,
};
pub use store::MemoryStore;
