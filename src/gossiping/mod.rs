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

//! Requesting room keys from our own other devices.

mod machine;

use ruma::{OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};

pub use machine::KeyRequestMachine;

use crate::types::RoomKeyRequestBody;

/// The lifecycle state of an outgoing key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// The request was created but hasn't gone out yet.
    Unsent,

    /// The request went out and no answer arrived yet.
    Sent,

    /// The request should be cancelled; once the cancellation is flushed the
    /// record is deleted.
    CancellationPending,

    /// The request should be cancelled and then re-sent as a brand new
    /// request with a fresh request ID.
    CancellationPendingAndWillResend,
}

/// A single logical request for a room key.
///
/// Identity is the canonical body, not the request ID: re-requesting the
/// same session reuses this record, rotating its `request_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingKeyRequest {
    /// The current wire-visible ID of the request. Rotated on every resend,
    /// never reused.
    pub request_id: OwnedTransactionId,

    /// The session being requested.
    pub body: RoomKeyRequestBody,

    /// The users whose devices the request is sent to. In practice our own
    /// user, asking our other devices.
    pub recipients: Vec<OwnedUserId>,

    /// Where in its lifecycle the request currently is.
    pub state: RequestState,
}

impl OutgoingKeyRequest {
    /// Is the given user one of the recipients of this request.
    pub fn sent_to(&self, user_id: &ruma::UserId) -> bool {
        self.recipients.iter().any(|u| u == user_id)
    }
}
